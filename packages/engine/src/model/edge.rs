//! RunEdge model - parent/child DAG relationships.
//!
//! `(parent_run_id, child_key)` is unique whenever `child_key` is set, making
//! child spawns idempotent and queryable.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RunEdge {
    pub id: Uuid,
    pub parent_run_id: Uuid,
    pub child_run_id: Uuid,
    pub relation: String,
    pub child_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunEdge {
    pub fn child(parent_run_id: Uuid, child_run_id: Uuid, child_key: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_run_id,
            child_run_id,
            relation: "child".to_string(),
            child_key,
            created_at: Utc::now(),
        }
    }

    pub async fn insert(&self, db: impl PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_edges (id, parent_run_id, child_run_id, relation, child_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(self.id)
        .bind(self.parent_run_id)
        .bind(self.child_run_id)
        .bind(&self.relation)
        .bind(&self.child_key)
        .bind(self.created_at)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn find_by_parent_and_key(
        parent_run_id: Uuid,
        child_key: &str,
        db: impl PgExecutor<'_>,
    ) -> Result<Option<Self>> {
        let edge = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, parent_run_id, child_run_id, relation, child_key, created_at
            FROM run_edges
            WHERE parent_run_id = $1 AND child_key = $2
            "#,
        )
        .bind(parent_run_id)
        .bind(child_key)
        .fetch_optional(db)
        .await?;

        Ok(edge)
    }

    pub async fn find_by_parent(
        parent_run_id: Uuid,
        db: impl PgExecutor<'_>,
    ) -> Result<Vec<Self>> {
        let edges = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, parent_run_id, child_run_id, relation, child_key, created_at
            FROM run_edges
            WHERE parent_run_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(parent_run_id)
        .fetch_all(db)
        .await?;

        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_edge_has_child_relation() {
        let edge = RunEdge::child(Uuid::new_v4(), Uuid::new_v4(), Some("migrations".into()));
        assert_eq!(edge.relation, "child");
        assert_eq!(edge.child_key.as_deref(), Some("migrations"));
    }
}
