//! Run execution and finalization.
//!
//! `execute_run` is the internal execution primitive: load the run, resolve
//! its blueprint, emit `run.started`, run the blueprint, then finalize with a
//! compare-and-swap terminal write. Zero affected rows on the CAS means
//! ownership was lost mid-execution; the worker logs and drops the run, and
//! whoever reclaimed it finishes the work. Double-finalization is
//! structurally impossible.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::{error_document, is_lost_lease, EngineError};
use crate::lease::LeaseRenewer;
use crate::model::{Run, RunStatus};
use crate::registry::SharedBlueprintRegistry;

/// Lease granted to inline nested runs; long enough for installer sub-runs,
/// short enough that a crashed inline run is eventually reclaimed.
const INLINE_LEASE_SECONDS: i64 = 3600;

/// Execute an existing run (worker-only function).
///
/// Does NOT create a run - executes one that is already RUNNING under this
/// worker's lease (or, with `worker_id = None`, an inline nested run).
pub async fn execute_run(
    pool: &PgPool,
    registry: &SharedBlueprintRegistry,
    run_id: Uuid,
    worker_id: Option<&str>,
) -> Result<Run> {
    let run = Run::find_by_id(run_id, pool)
        .await?
        .ok_or(EngineError::RunNotFound(run_id))?;

    let implementation = registry
        .get(&run.name)
        .ok_or_else(|| EngineError::BlueprintNotFound(run.name.clone()))?;

    info!(
        run_id = %run.id,
        blueprint_ref = %run.name,
        correlation_id = %run.correlation_id,
        "executing run"
    );

    let ctx = Arc::new(RunContext::new(
        pool.clone(),
        registry.clone(),
        run.clone(),
        worker_id.map(String::from),
    ));

    let result: Result<serde_json::Value> = async {
        ctx.emit_event(
            "run.started",
            json!({
                "run_id": run.id.to_string(),
                "blueprint_ref": run.name,
                "inputs": run.inputs,
            }),
        )
        .await?;

        (*implementation)(ctx.clone(), run.inputs.clone()).await
    }
    .await;

    match result {
        Ok(outputs) => {
            if !finalize_completed(&ctx, worker_id, &outputs).await? {
                return Err(EngineError::LostLease {
                    run_id,
                    worker_id: worker_id.unwrap_or_default().to_string(),
                }
                .into());
            }

            info!(run_id = %run_id, correlation_id = %run.correlation_id, "completed run");
            Run::find_by_id(run_id, pool)
                .await?
                .ok_or_else(|| EngineError::RunNotFound(run_id).into())
        }
        Err(e) => {
            // Uncommitted boundary state is abandoned before recording failure.
            ctx.discard_pending();

            match finalize_failed(&ctx, worker_id, &e).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(run_id = %run_id, "lost ownership when marking run as failed")
                }
                Err(fin_err) => {
                    error!(run_id = %run_id, error = %fin_err, "failed to record run failure")
                }
            }

            error!(
                run_id = %run_id,
                correlation_id = %run.correlation_id,
                error = %e,
                "failed run"
            );
            Err(e)
        }
    }
}

/// CAS terminal transition to COMPLETED, committed atomically with the
/// remaining buffered events and `run.completed`.
async fn finalize_completed(
    ctx: &RunContext,
    worker_id: Option<&str>,
    outputs: &serde_json::Value,
) -> Result<bool> {
    let mut tx = ctx.pool().begin().await?;

    let row = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE runs
        SET status = 'completed',
            completed_at = NOW(),
            outputs = $2
        WHERE id = $1
          AND status = 'running'
          AND ($3::text IS NULL OR locked_by = $3)
          AND ($3::text IS NULL OR lease_expires_at > NOW())
        RETURNING id
        "#,
    )
    .bind(ctx.run_id())
    .bind(outputs)
    .bind(worker_id)
    .fetch_optional(&mut *tx)
    .await?;

    if row.is_none() {
        return Ok(false);
    }

    for event in ctx.take_pending() {
        event.insert(&mut *tx).await?;
    }
    ctx.build_event(
        "run.completed",
        json!({
            "run_id": ctx.run_id().to_string(),
            "outputs": outputs,
        }),
        None,
    )
    .insert(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// CAS terminal transition to FAILED with the structured error document.
async fn finalize_failed(
    ctx: &RunContext,
    worker_id: Option<&str>,
    error: &anyhow::Error,
) -> Result<bool> {
    let mut tx = ctx.pool().begin().await?;

    let row = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE runs
        SET status = 'failed',
            completed_at = NOW(),
            error = $2
        WHERE id = $1
          AND status = 'running'
          AND ($3::text IS NULL OR locked_by = $3)
          AND ($3::text IS NULL OR lease_expires_at > NOW())
        RETURNING id
        "#,
    )
    .bind(ctx.run_id())
    .bind(error_document(error))
    .bind(worker_id)
    .fetch_optional(&mut *tx)
    .await?;

    if row.is_none() {
        return Ok(false);
    }

    ctx.build_event(
        "run.failed",
        json!({
            "run_id": ctx.run_id().to_string(),
            "error": error.to_string(),
        }),
        None,
    )
    .insert(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Execute a blueprint inline (for nested/child runs).
///
/// Creates a run that is already RUNNING and executes it in-process, bypassing
/// the queue. Used by installer blueprints for their synchronous sub-runs.
/// The run carries an inline lease so the RUNNING invariants hold and a
/// crashed inline run is eventually reclaimed by a worker.
pub async fn run_blueprint(
    pool: &PgPool,
    registry: &SharedBlueprintRegistry,
    blueprint_ref: &str,
    inputs: serde_json::Value,
    actor: &str,
    correlation_id: Option<String>,
) -> Result<Run> {
    let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = Utc::now();

    let run = Run::builder()
        .name(blueprint_ref.to_string())
        .status(RunStatus::Running)
        .actor(actor.to_string())
        .correlation_id(correlation_id.clone())
        .inputs(inputs)
        .locked_at(now)
        .locked_by(format!("inline-{}", std::process::id()))
        .lease_expires_at(now + chrono::Duration::seconds(INLINE_LEASE_SECONDS))
        .started_at(now)
        .build();
    let run = run.insert(pool).await?;

    info!(
        run_id = %run.id,
        blueprint_ref,
        correlation_id = %correlation_id,
        "executing nested run"
    );

    Box::pin(execute_run(pool, registry, run.id, None)).await
}

/// Drive one claimed run to a terminal state, renewing its lease alongside.
///
/// The lease renewer is the sole concurrent actor inside one execution and
/// never shares a connection with the executor. When the renewer observes
/// lost ownership it cancels, and the execution is abandoned (the reclaiming
/// worker finishes the run). Failures are logged, never propagated - the
/// worker loop must stay alive.
pub async fn execute_claimed(
    pool: &PgPool,
    registry: &SharedBlueprintRegistry,
    run: &Run,
    worker_id: &str,
    lease_seconds: i64,
) {
    let renewer = LeaseRenewer::spawn(
        pool.clone(),
        run.id,
        worker_id.to_string(),
        lease_seconds,
    );
    let lost = renewer.lost_token();

    let result = tokio::select! {
        res = execute_run(pool, registry, run.id, Some(worker_id)) => res,
        _ = lost.cancelled() => Err(EngineError::LostLease {
            run_id: run.id,
            worker_id: worker_id.to_string(),
        }
        .into()),
    };

    renewer.shutdown().await;

    match result {
        Ok(_) => {}
        Err(e) if is_lost_lease(&e) => {
            warn!(run_id = %run.id, worker_id, "lost lease during execution, dropping run");
        }
        Err(e) => {
            error!(run_id = %run.id, worker_id, error = %e, "run execution failed");
        }
    }
}
