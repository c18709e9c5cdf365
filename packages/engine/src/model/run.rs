//! Run model - one enqueued execution of a named blueprint.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never revert.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Run {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Blueprint reference, e.g. `core.pack.install@v1`
    pub name: String,

    #[builder(default)]
    pub status: RunStatus,
    #[builder(default = "system".to_string())]
    pub actor: String,
    pub correlation_id: String,

    // Payload
    #[builder(default = serde_json::json!({}))]
    pub inputs: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub outputs: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<serde_json::Value>,

    // Queue and lease management
    #[builder(default, setter(strip_option))]
    pub queued_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,

    // Scheduling and priority
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default = 100)]
    pub priority: i32,
    #[builder(default = 0)]
    pub attempt: i32,
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<i32>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    // DAG orchestration
    #[builder(default, setter(strip_option))]
    pub parent_run_id: Option<Uuid>,
}

impl Run {
    pub async fn find_by_id(id: Uuid, db: impl PgExecutor<'_>) -> Result<Option<Self>> {
        let run = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, status, actor, correlation_id, inputs, outputs, error,
                   queued_at, locked_at, locked_by, lease_expires_at,
                   run_at, priority, attempt, max_attempts,
                   created_at, started_at, completed_at, parent_run_id
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(run)
    }

    pub async fn insert(&self, db: impl PgExecutor<'_>) -> Result<Self> {
        let run = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO runs (
                id, name, status, actor, correlation_id, inputs, outputs, error,
                queued_at, locked_at, locked_by, lease_expires_at,
                run_at, priority, attempt, max_attempts,
                created_at, started_at, completed_at, parent_run_id
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8,
                $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19, $20
            )
            RETURNING id, name, status, actor, correlation_id, inputs, outputs, error,
                      queued_at, locked_at, locked_by, lease_expires_at,
                      run_at, priority, attempt, max_attempts,
                      created_at, started_at, completed_at, parent_run_id
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(self.status)
        .bind(&self.actor)
        .bind(&self.correlation_id)
        .bind(&self.inputs)
        .bind(&self.outputs)
        .bind(&self.error)
        .bind(self.queued_at)
        .bind(self.locked_at)
        .bind(&self.locked_by)
        .bind(self.lease_expires_at)
        .bind(self.run_at)
        .bind(self.priority)
        .bind(self.attempt)
        .bind(self.max_attempts)
        .bind(self.created_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(self.parent_run_id)
        .fetch_one(db)
        .await?;

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> Run {
        Run::builder()
            .name("core.test.echo@v1".to_string())
            .correlation_id("corr-1".to_string())
            .build()
    }

    #[test]
    fn new_run_starts_queued() {
        let run = sample_run();
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[test]
    fn new_run_has_normal_priority() {
        let run = sample_run();
        assert_eq!(run.priority, 100);
    }

    #[test]
    fn new_run_defaults_to_system_actor() {
        let run = sample_run();
        assert_eq!(run.actor, "system");
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
