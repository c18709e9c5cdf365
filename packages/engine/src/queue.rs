//! Postgres-backed run queue: enqueue, claim, lease renewal, cancel.
//!
//! Claiming is a single SQL round-trip: a locking CTE selects eligible rows
//! with `FOR UPDATE SKIP LOCKED`, then the outer UPDATE transitions them to
//! RUNNING under a lease. At most one worker owns a run at any instant, and
//! expired leases are reclaimable, so no work is lost when a worker dies.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::model::Run;

/// Priority bands (lower = more urgent): 0-9 critical, 10-49 high,
/// 50-100 normal, >= 200 background.
pub const PRIORITY_NORMAL: i32 = 100;

/// Options for `enqueue_run`.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EnqueueOptions {
    #[builder(default = "system".to_string(), setter(into))]
    pub actor: String,
    /// Generated when absent; threaded through all events of the workflow.
    #[builder(default, setter(strip_option, into))]
    pub correlation_id: Option<String>,
    /// Earliest eligibility; defaults to now.
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default = PRIORITY_NORMAL)]
    pub priority: i32,
    /// Reserved policy hook; nothing consumes it yet.
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<i32>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Enqueue a blueprint run for async execution by a worker.
///
/// Writes one QUEUED row. The run becomes eligible at `run_at` (default now)
/// and is dispatched best-effort by `(priority, run_at, queued_at)`.
pub async fn enqueue_run(
    pool: &PgPool,
    blueprint_ref: &str,
    inputs: serde_json::Value,
    opts: EnqueueOptions,
) -> Result<Run> {
    let correlation_id = opts
        .correlation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = Utc::now();

    let mut run = Run::builder()
        .name(blueprint_ref.to_string())
        .actor(opts.actor)
        .correlation_id(correlation_id.clone())
        .inputs(inputs)
        .queued_at(now)
        .run_at(opts.run_at.unwrap_or(now))
        .priority(opts.priority)
        .build();
    run.max_attempts = opts.max_attempts;

    let run = run.insert(pool).await?;

    if run.run_at.map(|at| at > now).unwrap_or(false) {
        info!(
            run_id = %run.id,
            blueprint_ref,
            run_at = ?run.run_at,
            priority = run.priority,
            correlation_id = %correlation_id,
            "scheduled run"
        );
    } else {
        info!(
            run_id = %run.id,
            blueprint_ref,
            priority = run.priority,
            correlation_id = %correlation_id,
            "enqueued run"
        );
    }

    Ok(run)
}

/// Claim up to `batch` eligible runs for `worker_id`, leasing each for
/// `lease_seconds`.
///
/// Candidates are QUEUED rows whose eligibility time has passed, plus RUNNING
/// rows with expired leases (crash recovery). Ordering is priority first,
/// then reclaims before fresh work so zombies clear quickly, then eligibility
/// and enqueue time.
pub async fn claim_runs(
    pool: &PgPool,
    worker_id: &str,
    batch: i64,
    lease_seconds: i64,
) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        r#"
        WITH candidate AS (
            SELECT id
            FROM runs
            WHERE
                (status = 'queued' AND COALESCE(run_at, queued_at, created_at, NOW()) <= NOW())
                OR
                (status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < NOW())
            ORDER BY
                priority ASC,
                CASE WHEN status = 'running' THEN 0 ELSE 1 END,
                run_at ASC NULLS LAST,
                queued_at ASC NULLS LAST,
                created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE runs
        SET
            status = 'running',
            locked_at = NOW(),
            locked_by = $2,
            lease_expires_at = NOW() + ($3 || ' seconds')::interval,
            started_at = COALESCE(started_at, NOW())
        WHERE id IN (SELECT id FROM candidate)
        RETURNING id, name, status, actor, correlation_id, inputs, outputs, error,
                  queued_at, locked_at, locked_by, lease_expires_at,
                  run_at, priority, attempt, max_attempts,
                  created_at, started_at, completed_at, parent_run_id
        "#,
    )
    .bind(batch)
    .bind(worker_id)
    .bind(lease_seconds.to_string())
    .fetch_all(pool)
    .await?;

    for run in &runs {
        info!(
            run_id = %run.id,
            blueprint_ref = %run.name,
            correlation_id = %run.correlation_id,
            worker_id,
            "claimed run"
        );
    }

    Ok(runs)
}

/// Renew the lease on a running run.
///
/// CAS update: only extends the lease while this worker still owns the row.
/// Returns `false` when ownership has been lost (another worker reclaimed).
pub async fn renew_lease(
    pool: &PgPool,
    run_id: Uuid,
    worker_id: &str,
    lease_seconds: i64,
) -> Result<bool> {
    let row = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE runs
        SET lease_expires_at = NOW() + ($1 || ' seconds')::interval
        WHERE id = $2
          AND status = 'running'
          AND locked_by = $3
        RETURNING id
        "#,
    )
    .bind(lease_seconds.to_string())
    .bind(run_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;

    if row.is_some() {
        debug!(run_id = %run_id, worker_id, "renewed lease");
        Ok(true)
    } else {
        warn!(run_id = %run_id, worker_id, "lost lease ownership, another worker may have reclaimed");
        Ok(false)
    }
}

/// Cancel a queued run.
///
/// CAS QUEUED -> CANCELLED; running runs are not cancelled cooperatively,
/// they are reclaimed via lease expiry once their owner stops. Returns `true`
/// when the run was cancelled by this call.
pub async fn cancel_run(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'cancelled',
            completed_at = NOW()
        WHERE id = $1 AND status = 'queued'
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Whether an error chain bottoms out in a Postgres unique violation (23505).
///
/// Spawn idempotency and step idx allocation both branch on this.
pub(crate) fn is_unique_violation(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_defaults() {
        let opts = EnqueueOptions::default();
        assert_eq!(opts.actor, "system");
        assert_eq!(opts.priority, PRIORITY_NORMAL);
        assert!(opts.correlation_id.is_none());
        assert!(opts.run_at.is_none());
        assert!(opts.max_attempts.is_none());
    }

    #[test]
    fn enqueue_options_builder_overrides() {
        let opts = EnqueueOptions::builder()
            .actor("ops")
            .priority(5)
            .correlation_id("corr-7")
            .build();
        assert_eq!(opts.actor, "ops");
        assert_eq!(opts.priority, 5);
        assert_eq!(opts.correlation_id.as_deref(), Some("corr-7"));
    }
}
