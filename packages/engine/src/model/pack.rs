//! Pack registry and installation records.
//!
//! A `Pack` describes an installable unit (target schema, table manifest,
//! migrations). A `PackInstallation` tracks one pack installed into one
//! environment; `(env_id, pack_ref)` is unique so concurrent installers race
//! on a single row.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "pack_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PackStatus {
    #[default]
    Pending,
    Installing,
    Installed,
    Upgrading,
    Failed,
    Uninstalling,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub id: Uuid,
    pub pack_ref: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub schema_name: Option<String>,
    pub manifest: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pack {
    pub async fn find_by_ref(pack_ref: &str, db: impl PgExecutor<'_>) -> Result<Option<Self>> {
        let pack = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, pack_ref, name, version, description, schema_name, manifest,
                   created_at, updated_at
            FROM packs
            WHERE pack_ref = $1
            "#,
        )
        .bind(pack_ref)
        .fetch_optional(db)
        .await?;

        Ok(pack)
    }

    pub async fn insert(&self, db: impl PgExecutor<'_>) -> Result<Self> {
        let pack = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO packs (id, pack_ref, name, version, description, schema_name,
                               manifest, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, pack_ref, name, version, description, schema_name, manifest,
                      created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.pack_ref)
        .bind(&self.name)
        .bind(&self.version)
        .bind(&self.description)
        .bind(&self.schema_name)
        .bind(&self.manifest)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(pack)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct PackInstallation {
    pub id: Uuid,
    pub pack_id: Uuid,
    pub pack_ref: String,
    pub env_id: String,
    pub status: PackStatus,
    pub schema_mode: String,
    pub schema_name: Option<String>,
    pub installed_version: Option<String>,
    pub migration_provider: String,
    pub migration_state: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub installed_by_run_id: Option<Uuid>,
    pub updated_by_run_id: Option<Uuid>,
    pub error: Option<serde_json::Value>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const INSTALLATION_COLUMNS: &str = r#"id, pack_id, pack_ref, env_id, status, schema_mode, schema_name,
           installed_version, migration_provider, migration_state,
           installed_at, installed_by_run_id, updated_by_run_id,
           error, last_error_at, created_at, updated_at"#;

impl PackInstallation {
    /// Atomically claim the `(env_id, pack_ref)` slot for `run_id`.
    ///
    /// Returns `None` when another installation already holds the slot; the
    /// caller re-reads the existing row and branches on its status.
    pub async fn insert_claiming(
        pack: &Pack,
        env_id: &str,
        run_id: Uuid,
        db: impl PgExecutor<'_>,
    ) -> Result<Option<Self>> {
        let installation = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO pack_installations (
                id, pack_id, pack_ref, env_id, status, schema_mode, schema_name,
                migration_provider, installed_by_run_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'installing', 'per_pack', $5, 'sql', $6, NOW(), NOW())
            ON CONFLICT ON CONSTRAINT uq_pack_installations_env_pack DO NOTHING
            RETURNING {INSTALLATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(pack.id)
        .bind(&pack.pack_ref)
        .bind(env_id)
        .bind(&pack.schema_name)
        .bind(run_id)
        .fetch_optional(db)
        .await?;

        Ok(installation)
    }

    pub async fn find_by_env_and_ref(
        env_id: &str,
        pack_ref: &str,
        db: impl PgExecutor<'_>,
    ) -> Result<Option<Self>> {
        let installation = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {INSTALLATION_COLUMNS}
            FROM pack_installations
            WHERE env_id = $1 AND pack_ref = $2
            "#
        ))
        .bind(env_id)
        .bind(pack_ref)
        .fetch_optional(db)
        .await?;

        Ok(installation)
    }

    /// Re-read the row under `FOR UPDATE` so a single finalizer holds it
    /// through the terminal transition.
    pub async fn lock_by_id(id: Uuid, db: impl PgExecutor<'_>) -> Result<Option<Self>> {
        let installation = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {INSTALLATION_COLUMNS}
            FROM pack_installations
            WHERE id = $1
            FOR UPDATE
            "#
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(installation)
    }

    /// Transition the locked row to INSTALLED, clearing prior errors.
    pub async fn mark_installed(
        id: Uuid,
        version: &str,
        migration_state: &str,
        db: impl PgExecutor<'_>,
    ) -> Result<Self> {
        let installation = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE pack_installations
            SET status = 'installed',
                installed_version = $1,
                migration_state = $2,
                installed_at = NOW(),
                error = NULL,
                updated_at = NOW()
            WHERE id = $3
            RETURNING {INSTALLATION_COLUMNS}
            "#
        ))
        .bind(version)
        .bind(migration_state)
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(installation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pack_status_is_pending() {
        assert_eq!(PackStatus::default(), PackStatus::Pending);
    }

    #[test]
    fn pack_status_serializes_snake_case() {
        let json = serde_json::to_string(&PackStatus::Installing).unwrap();
        assert_eq!(json, "\"installing\"");
    }
}
