//! Installer-class blueprints: schema creation, migrations, pack install.
//!
//! `core.pack.install@v1` is the representative structured install:
//! an advisory lock gates the whole operation, the installation record is
//! claimed with a single unique-constrained insert, side effects run as
//! ordinary steps (via inline nested runs), and finalization re-reads and
//! row-locks the record before the terminal transition. Re-running after a
//! crash is safe: the unique constraint and the final status checks make
//! every entry point idempotent or an explicit conflict.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::advisory::{with_lock, LockMode};
use crate::context::RunContext;
use crate::error::EngineError;
use crate::model::{Pack, PackInstallation, PackStatus, StepKind};
use crate::registry::BlueprintRegistry;

pub fn register(registry: &mut BlueprintRegistry) {
    registry.register("core.pack.system.install@v1", system_install_pack);
    registry.register("core.migrations.apply@v1", apply_migrations);
    registry.register("core.pack.install@v1", install_pack);
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PackManifest {
    #[serde(default)]
    tables: Vec<TableDef>,
    #[serde(default)]
    migrations: Vec<MigrationDef>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableDef {
    name: String,
    #[serde(default)]
    columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnDef {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    nullable: Option<bool>,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    foreign_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrationDef {
    id: String,
    #[serde(default)]
    sql: String,
}

/// System-level pack installation - creates the schema and manifest tables.
async fn system_install_pack(ctx: Arc<RunContext>, inputs: Value) -> Result<Value> {
    let ctx = &ctx;
    let pack_ref = require_str(&inputs, "pack_ref")?;
    let pack_ref = &pack_ref;
    let schema_name = require_str(&inputs, "schema_name")?;
    let schema_name = &schema_name;
    ensure_identifier(schema_name)?;

    let pack = ctx
        .step("Fetch pack from registry", StepKind::ActionTask, |scope| async move {
            ctx.emit_progress(&format!("Looking up pack {}", pack_ref), None)
                .await?;
            let pack = Pack::find_by_ref(pack_ref, ctx.pool())
                .await?
                .ok_or_else(|| EngineError::PackNotFound(pack_ref.clone()))?;

            scope.set_outputs(json!({
                "pack_id": pack.id.to_string(),
                "pack_name": pack.name,
            }));
            Ok(pack)
        })
        .await?;

    ctx.step("Create database schema", StepKind::ActionTask, |scope| async move {
        ctx.emit_progress(&format!("Creating schema {}", schema_name), None)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema_name))
            .execute(ctx.pool())
            .await?;
        scope.set_outputs(json!({ "schema_name": schema_name }));
        Ok(())
    })
    .await?;

    let manifest: PackManifest =
        serde_json::from_value(pack.manifest.clone()).context("invalid pack manifest")?;

    let mut tables_created = Vec::new();
    for table in &manifest.tables {
        ensure_identifier(&table.name)?;

        ctx.step(
            &format!("Create table {}", table.name),
            StepKind::ActionTask,
            |scope| async move {
                ctx.emit_progress(
                    &format!("Creating table {}.{}", schema_name, table.name),
                    None,
                )
                .await?;

                let create_sql = build_create_table(schema_name, table)?;
                sqlx::query(&create_sql).execute(ctx.pool()).await?;

                scope.set_outputs(json!({
                    "table_name": table.name,
                    "column_count": table.columns.len(),
                }));
                Ok(())
            },
        )
        .await?;

        tables_created.push(table.name.clone());
    }

    Ok(json!({
        "schema_name": schema_name,
        "tables_created": tables_created,
        "table_count": tables_created.len(),
    }))
}

/// Apply migrations for a pack, one step per migration.
async fn apply_migrations(ctx: Arc<RunContext>, inputs: Value) -> Result<Value> {
    let ctx = &ctx;
    let schema_name = require_str(&inputs, "schema_name")?;
    let schema_name = &schema_name;
    let migrations: Vec<MigrationDef> = inputs
        .get("migrations")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .context("invalid migrations list")?
        .unwrap_or_default();

    if migrations.is_empty() {
        ctx.step("Check migrations", StepKind::ActionTask, |scope| async move {
            ctx.emit_progress("No migrations to apply", None).await?;
            scope.set_outputs(json!({ "message": "No migrations defined" }));
            Ok(())
        })
        .await?;
        return Ok(json!({ "migrations_applied": [] }));
    }

    let mut migrations_applied = Vec::new();
    for migration in &migrations {
        ctx.step(
            &format!("Apply migration {}", migration.id),
            StepKind::ActionTask,
            |scope| async move {
                ctx.emit_progress(
                    &format!("Applying migration {} to {}", migration.id, schema_name),
                    None,
                )
                .await?;

                if !migration.sql.is_empty() {
                    sqlx::query(&migration.sql).execute(ctx.pool()).await?;
                }

                scope.set_outputs(json!({ "migration_id": migration.id }));
                Ok(())
            },
        )
        .await?;

        migrations_applied.push(migration.id.clone());
    }

    Ok(json!({
        "migration_count": migrations_applied.len(),
        "migrations_applied": migrations_applied,
    }))
}

/// Install a pack - orchestrates system installation and migrations.
async fn install_pack(ctx: Arc<RunContext>, inputs: Value) -> Result<Value> {
    let pack_ref = require_str(&inputs, "pack_ref")?;
    let env_id = inputs
        .get("env_id")
        .and_then(Value::as_str)
        .unwrap_or("local-dev")
        .to_string();

    // Advisory lock prevents concurrent installations of the same pack/env,
    // even when multiple runs are queued.
    let lock_key = format!("pack.install:{}:{}", env_id, pack_ref);

    let locked_ctx = ctx.clone();
    let locked_ref = pack_ref.clone();
    let locked_env = env_id.clone();
    let result = with_lock(ctx.pool(), &lock_key, LockMode::FailFast, move || {
        install_pack_locked(locked_ctx, locked_ref, locked_env)
    })
    .await;

    match result {
        Err(e)
            if matches!(
                e.downcast_ref::<EngineError>(),
                Some(EngineError::LockUnavailable { .. })
            ) =>
        {
            Err(EngineError::PackInstallInProgress { pack_ref, env_id }.into())
        }
        other => other,
    }
}

/// Installation logic with the advisory lock held.
async fn install_pack_locked(
    ctx: Arc<RunContext>,
    pack_ref: String,
    env_id: String,
) -> Result<Value> {
    let ctx = &ctx;
    let pack_ref = &pack_ref;
    let env_id = &env_id;

    let pack = ctx
        .step("Validate pack", StepKind::ActionTask, |scope| async move {
            ctx.emit_progress(&format!("Validating pack {}", pack_ref), None)
                .await?;
            let pack = Pack::find_by_ref(pack_ref, ctx.pool())
                .await?
                .ok_or_else(|| EngineError::PackNotFound(pack_ref.clone()))?;

            scope.set_outputs(json!({
                "pack_id": pack.id.to_string(),
                "schema_name": pack.schema_name,
            }));
            Ok(pack)
        })
        .await?;
    let pack = &pack;

    let schema_name = pack.schema_name.clone();
    let schema_name = &schema_name;

    // Claim the (env, pack) slot with a single unique-constrained insert.
    let installation = ctx
        .step("Create installation record", StepKind::ActionTask, |scope| async move {
            let installation =
                PackInstallation::insert_claiming(pack, env_id, ctx.run_id(), ctx.pool()).await?;

            let installation = match installation {
                Some(installation) => installation,
                None => {
                    let existing =
                        PackInstallation::find_by_env_and_ref(env_id, pack_ref, ctx.pool())
                            .await?;
                    return Err(conflict_error(existing, pack_ref, env_id));
                }
            };

            scope.set_outputs(json!({
                "installation_id": installation.id.to_string(),
                "schema_mode": installation.schema_mode,
                "claimed_by_run_id": ctx.run_id().to_string(),
            }));
            Ok(installation)
        })
        .await?;

    // Side effects run as ordinary steps inside nested runs.
    ctx.step("Execute system installation", StepKind::AgentTask, |scope| async move {
        ctx.emit_progress("Running core.pack.system.install@v1", None)
            .await?;

        let system_run = ctx
            .run_blueprint(
                "core.pack.system.install@v1",
                json!({
                    "pack_ref": pack_ref,
                    "schema_name": schema_name,
                }),
            )
            .await?;

        scope.set_outputs(json!({
            "system_run_id": system_run.id.to_string(),
            "tables_created": system_run
                .outputs
                .as_ref()
                .and_then(|o| o.get("tables_created"))
                .cloned()
                .unwrap_or(json!([])),
        }));
        Ok(())
    })
    .await?;

    let manifest: PackManifest =
        serde_json::from_value(pack.manifest.clone()).context("invalid pack manifest")?;

    let mut latest_migration_id: Option<String> = None;
    if !manifest.migrations.is_empty() {
        let latest = &mut latest_migration_id;
        let migration_count = manifest.migrations.len();
        ctx.step("Execute migrations", StepKind::AgentTask, |scope| async move {
            ctx.emit_progress(
                &format!("Running core.migrations.apply@v1 ({} migrations)", migration_count),
                None,
            )
            .await?;

            let migration_run = ctx
                .run_blueprint(
                    "core.migrations.apply@v1",
                    json!({
                        "pack_ref": pack_ref,
                        "schema_name": schema_name,
                        "migrations": pack.manifest.get("migrations").cloned().unwrap_or(json!([])),
                    }),
                )
                .await?;

            let applied: Vec<String> = migration_run
                .outputs
                .as_ref()
                .and_then(|o| o.get("migrations_applied"))
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            *latest = applied.last().cloned();

            scope.set_outputs(json!({
                "migration_run_id": migration_run.id.to_string(),
                "migrations_applied": applied,
                "latest_migration_id": *latest,
            }));
            Ok(())
        })
        .await?;
    }

    // Finalize under a row lock: only the claiming run may transition, only
    // from INSTALLING, and only with the required fields present.
    let installation_id = installation.id;
    let latest_migration_id = &latest_migration_id;
    let finalized = ctx
        .step("Finalize installation", StepKind::ActionTask, |scope| async move {
            ctx.emit_progress("Locking installation record for finalization", None)
                .await?;

            let mut tx = ctx.pool().begin().await?;
            let locked = PackInstallation::lock_by_id(installation_id, &mut *tx)
                .await?
                .ok_or_else(|| EngineError::PackNotFound(pack_ref.clone()))?;

            // Idempotent re-entry: already finalized, return current state.
            if locked.status == PackStatus::Installed {
                ctx.emit_progress("Installation already finalized, returning current state", None)
                    .await?;
                scope.set_outputs(json!({
                    "status": "installed",
                    "version": locked.installed_version,
                    "migration_state": locked.migration_state,
                    "schema_name": locked.schema_name,
                    "idempotent": true,
                }));
                return Ok(locked);
            }

            if locked.installed_by_run_id != Some(ctx.run_id()) {
                return Err(EngineError::PackInstallConflict {
                    expected: ctx.run_id(),
                    actual: locked.installed_by_run_id,
                }
                .into());
            }

            if locked.status != PackStatus::Installing {
                return Err(EngineError::InvariantViolation {
                    field: "status".to_string(),
                    message: format!(
                        "cannot finalize from status {:?}, expected installing",
                        locked.status
                    ),
                }
                .into());
            }

            if locked.schema_name.as_deref().unwrap_or("").is_empty() {
                return Err(EngineError::InvariantViolation {
                    field: "schema_name".to_string(),
                    message: "schema_name must be set before marking as installed".to_string(),
                }
                .into());
            }

            if pack.version.is_empty() {
                return Err(EngineError::InvariantViolation {
                    field: "version".to_string(),
                    message: "pack.version must be set before marking as installed".to_string(),
                }
                .into());
            }

            let migration_state = latest_migration_id.as_deref().unwrap_or("init");
            let finalized = PackInstallation::mark_installed(
                locked.id,
                &pack.version,
                migration_state,
                &mut *tx,
            )
            .await?;
            tx.commit().await?;

            scope.set_outputs(json!({
                "status": "installed",
                "version": finalized.installed_version,
                "migration_state": finalized.migration_state,
                "schema_name": finalized.schema_name,
                "idempotent": false,
            }));
            Ok(finalized)
        })
        .await?;

    Ok(json!({
        "pack_id": pack.id.to_string(),
        "installation_id": finalized.id.to_string(),
        "schema_name": finalized.schema_name,
        "version": pack.version,
    }))
}

/// Map an existing installation row to the conflict the caller sees.
fn conflict_error(
    existing: Option<PackInstallation>,
    pack_ref: &str,
    env_id: &str,
) -> anyhow::Error {
    let pack_ref = pack_ref.to_string();
    let env_id = env_id.to_string();

    match existing.map(|e| e.status) {
        Some(PackStatus::Installed) => {
            EngineError::PackAlreadyInstalled { pack_ref, env_id }.into()
        }
        Some(PackStatus::Failed) => {
            EngineError::PackInstallPreviouslyFailed { pack_ref, env_id }.into()
        }
        // Installing, upgrading, or anything else in flight.
        _ => EngineError::PackInstallInProgress { pack_ref, env_id }.into(),
    }
}

fn require_str(inputs: &Value, field: &str) -> Result<String> {
    inputs
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("{} is required", field))
}

/// Manifest-sourced identifiers are interpolated into DDL; restrict them to
/// conventional SQL identifier characters.
fn ensure_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid {
        return Err(EngineError::InvariantViolation {
            field: "identifier".to_string(),
            message: format!("invalid SQL identifier: {}", name),
        }
        .into());
    }
    Ok(())
}

/// Column types pack manifests may declare. Anything else is rejected before
/// it reaches the DDL string.
const ALLOWED_COLUMN_TYPES: &[&str] = &[
    "UUID",
    "TEXT",
    "VARCHAR",
    "CHAR",
    "SMALLINT",
    "INTEGER",
    "BIGINT",
    "SERIAL",
    "BIGSERIAL",
    "NUMERIC",
    "DECIMAL",
    "REAL",
    "DOUBLE PRECISION",
    "BOOLEAN",
    "DATE",
    "TIME",
    "TIMESTAMP",
    "TIMESTAMPTZ",
    "JSON",
    "JSONB",
    "BYTEA",
];

/// Manifest-sourced column types are interpolated into DDL; accept only an
/// allowlisted base type with an optional numeric length/precision suffix
/// (`VARCHAR(255)`, `NUMERIC(12, 2)`).
fn ensure_column_type(column_type: &str) -> Result<()> {
    let upper = column_type.trim().to_ascii_uppercase();
    let (base, params) = match upper.split_once('(') {
        Some((base, rest)) => (base.trim_end(), Some(rest)),
        None => (upper.as_str(), None),
    };

    let base_ok = ALLOWED_COLUMN_TYPES.contains(&base);
    let params_ok = match params {
        None => true,
        Some(rest) => match rest.strip_suffix(')') {
            Some(inner) => {
                !inner.trim().is_empty()
                    && inner
                        .chars()
                        .all(|c| c.is_ascii_digit() || c == ',' || c == ' ')
            }
            None => false,
        },
    };

    if !base_ok || !params_ok {
        return Err(EngineError::InvariantViolation {
            field: "column_type".to_string(),
            message: format!("column type not allowed: {}", column_type),
        }
        .into());
    }
    Ok(())
}

fn build_create_table(schema_name: &str, table: &TableDef) -> Result<String> {
    let mut columns = Vec::new();

    for col in &table.columns {
        ensure_identifier(&col.name)?;
        ensure_column_type(&col.column_type)?;

        let mut col_def = format!("{} {}", col.name, col.column_type);
        if col.primary_key {
            col_def.push_str(" PRIMARY KEY");
        }
        if col.nullable == Some(false) {
            col_def.push_str(" NOT NULL");
        }
        if col.unique {
            col_def.push_str(" UNIQUE");
        }
        columns.push(col_def);
    }

    for col in &table.columns {
        if let Some(foreign_key) = &col.foreign_key {
            let (fk_table, fk_column) = foreign_key
                .split_once('.')
                .context("foreign_key must be table.column")?;
            ensure_identifier(fk_table)?;
            ensure_identifier(fk_column)?;
            columns.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}.{}({})",
                col.name, schema_name, fk_table, fk_column
            ));
        }
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        schema_name,
        table.name,
        columns.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_table() -> TableDef {
        serde_json::from_value(json!({
            "name": "contacts",
            "columns": [
                { "name": "id", "type": "UUID", "primary_key": true },
                { "name": "email", "type": "TEXT", "nullable": false, "unique": true },
                { "name": "owner_id", "type": "UUID", "foreign_key": "owners.id" },
            ],
        }))
        .unwrap()
    }

    #[test]
    fn create_table_renders_constraints() {
        let sql = build_create_table("crm", &manifest_table()).unwrap();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS crm.contacts"));
        assert!(sql.contains("id UUID PRIMARY KEY"));
        assert!(sql.contains("email TEXT NOT NULL UNIQUE"));
        assert!(sql.contains("FOREIGN KEY (owner_id) REFERENCES crm.owners(id)"));
    }

    #[test]
    fn identifiers_reject_injection() {
        assert!(ensure_identifier("contacts").is_ok());
        assert!(ensure_identifier("_private").is_ok());
        assert!(ensure_identifier("drop table; --").is_err());
        assert!(ensure_identifier("").is_err());
        assert!(ensure_identifier("1starts_with_digit").is_err());
    }

    #[test]
    fn column_types_are_allowlisted() {
        assert!(ensure_column_type("UUID").is_ok());
        assert!(ensure_column_type("text").is_ok());
        assert!(ensure_column_type("VARCHAR(255)").is_ok());
        assert!(ensure_column_type("NUMERIC(12, 2)").is_ok());
        assert!(ensure_column_type("DOUBLE PRECISION").is_ok());

        assert!(ensure_column_type("TEXT); DROP SCHEMA crm CASCADE; --").is_err());
        assert!(ensure_column_type("TEXT DEFAULT 'x'; --").is_err());
        assert!(ensure_column_type("VARCHAR(255); --").is_err());
        assert!(ensure_column_type("VARCHAR()").is_err());
        assert!(ensure_column_type("").is_err());
    }

    #[test]
    fn create_table_rejects_malicious_column_type() {
        let table: TableDef = serde_json::from_value(json!({
            "name": "contacts",
            "columns": [
                { "name": "email", "type": "TEXT); DROP SCHEMA crm CASCADE; --" },
            ],
        }))
        .unwrap();

        assert!(build_create_table("crm", &table).is_err());
    }

    #[test]
    fn manifest_defaults_to_empty_sections() {
        let manifest: PackManifest = serde_json::from_value(json!({})).unwrap();
        assert!(manifest.tables.is_empty());
        assert!(manifest.migrations.is_empty());
    }
}
