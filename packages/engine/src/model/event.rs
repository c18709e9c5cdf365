//! Event model - append-only audit records.
//!
//! Events are immutable once written. `run_id`/`step_id` reference existing
//! entities at write time; commits are tied to step boundaries by the run
//! context, never here.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_name: String,
    pub occurred_at: DateTime<Utc>,
    pub env_id: String,
    pub actor: String,
    pub correlation_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub async fn insert(&self, db: impl PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (
                id, event_name, occurred_at, env_id, actor, correlation_id,
                run_id, step_id, resource_type, resource_id, data, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(self.id)
        .bind(&self.event_name)
        .bind(self.occurred_at)
        .bind(&self.env_id)
        .bind(&self.actor)
        .bind(&self.correlation_id)
        .bind(self.run_id)
        .bind(self.step_id)
        .bind(&self.resource_type)
        .bind(&self.resource_id)
        .bind(&self.data)
        .bind(self.created_at)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Events for a run in commit-visible order.
    pub async fn find_by_run(run_id: Uuid, db: impl PgExecutor<'_>) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, event_name, occurred_at, env_id, actor, correlation_id,
                   run_id, step_id, resource_type, resource_id, data, created_at
            FROM events
            WHERE run_id = $1
            ORDER BY occurred_at ASC, created_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(db)
        .await?;

        Ok(events)
    }
}
