//! Step model - atomic unit within a run.
//!
//! Step indexes within a run form a contiguous prefix starting at 0, enforced
//! by the `(run_id, idx)` unique constraint. Status transitions and their
//! paired events are written by the run context at step boundaries.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "step_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "step_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    ActionTask,
    AgentTask,
    Gate,
    Transform,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ActionTask => "action_task",
            StepKind::AgentTask => "agent_task",
            StepKind::Gate => "gate",
            StepKind::Transform => "transform",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub idx: i32,
    pub kind: StepKind,
    pub status: StepStatus,
    pub inputs: Option<serde_json::Value>,
    pub outputs: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub logs_artifact_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(run_id: Uuid, name: &str, idx: i32, kind: StepKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            name: name.to_string(),
            idx,
            kind,
            status: StepStatus::Created,
            inputs: None,
            outputs: None,
            error: None,
            logs_artifact_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub async fn insert(&self, db: impl PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO steps (id, run_id, name, idx, kind, status, inputs, outputs, error,
                               logs_artifact_id, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(self.id)
        .bind(self.run_id)
        .bind(&self.name)
        .bind(self.idx)
        .bind(self.kind)
        .bind(self.status)
        .bind(&self.inputs)
        .bind(&self.outputs)
        .bind(&self.error)
        .bind(self.logs_artifact_id)
        .bind(self.created_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Number of steps already recorded for a run; the next free idx.
    pub async fn count_for_run(run_id: Uuid, db: impl PgExecutor<'_>) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM steps WHERE run_id = $1")
                .bind(run_id)
                .fetch_one(db)
                .await?;

        Ok(count)
    }

    pub async fn find_by_run(run_id: Uuid, db: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        let steps = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, run_id, name, idx, kind, status, inputs, outputs, error,
                   logs_artifact_id, created_at, started_at, completed_at
            FROM steps
            WHERE run_id = $1
            ORDER BY idx ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(db)
        .await?;

        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_as_str_matches_wire_names() {
        assert_eq!(StepKind::ActionTask.as_str(), "action_task");
        assert_eq!(StepKind::AgentTask.as_str(), "agent_task");
        assert_eq!(StepKind::Gate.as_str(), "gate");
        assert_eq!(StepKind::Transform.as_str(), "transform");
    }

    #[test]
    fn default_status_is_created() {
        assert_eq!(StepStatus::default(), StepStatus::Created);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&StepKind::AgentTask).unwrap();
        assert_eq!(json, "\"agent_task\"");
    }
}
