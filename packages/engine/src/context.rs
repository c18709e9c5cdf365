//! Run context passed to blueprint implementations.
//!
//! The context is the only surface a blueprint touches: scoped steps, event
//! emission, progress, child spawn/wait (see `dag`), and ownership assertion.
//! Blueprints never commit or roll back a connection themselves; all
//! transactional choreography happens here and in the executor.
//!
//! # Commit cadence
//!
//! Emitted events are buffered in the context and written inside the next
//! step-boundary transaction, so a step transition and the events that
//! accompany it become visible atomically. `step.started` precedes any
//! `step.progress`, which precedes `step.completed`/`step.failed` by commit
//! order. Progress events additionally get a throttled flush (2s cadence) so
//! live observers see movement inside long steps.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{is_lost_lease, error_document, EngineError};
use crate::model::{Event, Run, Step, StepKind};
use crate::queue::is_unique_violation;
use crate::registry::SharedBlueprintRegistry;

/// How often progress events may force an early flush of the pending buffer.
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts at allocating a step idx before surfacing the unique violation.
const STEP_IDX_RETRIES: usize = 3;

pub struct RunContext {
    pool: PgPool,
    registry: SharedBlueprintRegistry,
    run: Run,
    worker_id: Option<String>,
    env_id: String,
    current_step: Mutex<Option<CurrentStep>>,
    pending_events: Mutex<Vec<Event>>,
    last_progress_flush: Mutex<Instant>,
}

#[derive(Clone)]
struct CurrentStep {
    id: Uuid,
    name: String,
}

/// Handle given to a step body for recording its outputs.
#[derive(Clone)]
pub struct StepScope {
    step_id: Uuid,
    outputs: Arc<Mutex<Option<serde_json::Value>>>,
}

impl StepScope {
    pub fn id(&self) -> Uuid {
        self.step_id
    }

    /// Outputs recorded here are written at the step's end boundary.
    pub fn set_outputs(&self, outputs: serde_json::Value) {
        *self.outputs.lock().unwrap() = Some(outputs);
    }

    fn take_outputs(&self) -> Option<serde_json::Value> {
        self.outputs.lock().unwrap().take()
    }
}

impl RunContext {
    pub fn new(
        pool: PgPool,
        registry: SharedBlueprintRegistry,
        run: Run,
        worker_id: Option<String>,
    ) -> Self {
        let env_id = run
            .inputs
            .get("env_id")
            .and_then(|v| v.as_str())
            .unwrap_or("local-dev")
            .to_string();

        Self {
            pool,
            registry,
            run,
            worker_id,
            env_id,
            current_step: Mutex::new(None),
            pending_events: Mutex::new(Vec::new()),
            last_progress_flush: Mutex::new(Instant::now()),
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn correlation_id(&self) -> &str {
        &self.run.correlation_id
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Assert that this worker still owns the run.
    ///
    /// Checked before any state-changing write. Contexts without a worker id
    /// (inline nested execution) skip the check.
    pub async fn assert_ownership(&self) -> Result<()> {
        let Some(worker_id) = &self.worker_id else {
            return Ok(());
        };

        let row = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM runs
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at > NOW()
            "#,
        )
        .bind(self.run.id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            return Err(EngineError::LostLease {
                run_id: self.run.id,
                worker_id: worker_id.clone(),
            }
            .into());
        }

        Ok(())
    }

    /// Emit an event during execution.
    ///
    /// The event is buffered and committed at the next step boundary (or run
    /// finalization), keeping chatty blueprints cheap.
    pub async fn emit_event(&self, event_name: &str, data: serde_json::Value) -> Result<()> {
        self.assert_ownership().await?;

        let step_id = self.current_step.lock().unwrap().as_ref().map(|s| s.id);
        let event = self.build_event(event_name, data, step_id);
        self.pending_events.lock().unwrap().push(event);

        info!(event_name, correlation_id = %self.run.correlation_id, "event emitted");
        Ok(())
    }

    /// Emit a `step.progress` event scoped to the current step.
    pub async fn emit_progress(&self, message: &str, progress: Option<f64>) -> Result<()> {
        let Some(step) = self.current_step.lock().unwrap().clone() else {
            warn!("no active step for progress emission");
            return Ok(());
        };

        let mut data = json!({
            "step_id": step.id.to_string(),
            "step_name": step.name,
            "message": message,
        });
        if let Some(progress) = progress {
            data["progress"] = json!(progress);
        }
        self.emit_event("step.progress", data).await?;

        // Throttled flush so long steps show movement without a commit per event.
        let flush_due = {
            let mut last = self.last_progress_flush.lock().unwrap();
            if last.elapsed() >= PROGRESS_FLUSH_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if flush_due {
            self.flush_pending().await?;
        }

        Ok(())
    }

    /// Execute a scoped step.
    ///
    /// Creates the step with the next gap-free idx, commits the start boundary
    /// (CREATED -> RUNNING + `step.started`), runs `body`, then commits the end
    /// boundary matching the outcome. Ownership is asserted at each boundary;
    /// losing it while recording a failure is logged and the original error
    /// still propagates.
    pub async fn step<F, Fut, T>(&self, name: &str, kind: StepKind, body: F) -> Result<T>
    where
        F: FnOnce(StepScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let step = self.open_step(name, kind).await?;
        let scope = StepScope {
            step_id: step.id,
            outputs: Arc::new(Mutex::new(None)),
        };

        *self.current_step.lock().unwrap() = Some(CurrentStep {
            id: step.id,
            name: step.name.clone(),
        });
        let result = body(scope.clone()).await;
        let outputs = scope.take_outputs();

        match &result {
            Ok(_) => {
                let close = self.close_step_completed(step.id, name, outputs).await;
                *self.current_step.lock().unwrap() = None;
                close?;
            }
            Err(e) => {
                self.close_step_failed(step.id, name, e).await;
                *self.current_step.lock().unwrap() = None;
            }
        }

        result
    }

    /// Create the step row and commit the start boundary.
    ///
    /// Retries idx allocation on `(run_id, idx)` conflicts; blueprints run
    /// single-threaded per run, so conflicts are rare and defensive.
    async fn open_step(&self, name: &str, kind: StepKind) -> Result<Step> {
        self.assert_ownership().await?;
        let pending = self.take_pending();

        let mut attempt = 0;
        loop {
            match self.try_open_step(name, kind, &pending).await {
                Ok(step) => return Ok(step),
                Err(e) if is_unique_violation(&e) && attempt + 1 < STEP_IDX_RETRIES => {
                    attempt += 1;
                    warn!(
                        run_id = %self.run.id,
                        step_name = name,
                        attempt,
                        "step idx conflict, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_open_step(&self, name: &str, kind: StepKind, pending: &[Event]) -> Result<Step> {
        let mut tx = self.pool.begin().await?;

        let idx = Step::count_for_run(self.run.id, &mut *tx).await?;
        let mut step = Step::new(self.run.id, name, idx as i32, kind);
        step.insert(&mut *tx).await?;

        // Start boundary: CREATED -> RUNNING + step.started, one commit.
        let started_at = Utc::now();
        sqlx::query("UPDATE steps SET status = 'running', started_at = $2 WHERE id = $1")
            .bind(step.id)
            .bind(started_at)
            .execute(&mut *tx)
            .await?;

        for event in pending {
            event.insert(&mut *tx).await?;
        }
        self.build_event(
            "step.started",
            json!({
                "step_id": step.id.to_string(),
                "step_name": name,
                "step_kind": kind.as_str(),
            }),
            Some(step.id),
        )
        .insert(&mut *tx)
        .await?;

        tx.commit().await?;

        step.status = crate::model::StepStatus::Running;
        step.started_at = Some(started_at);
        Ok(step)
    }

    /// End boundary for a successful body: COMPLETED + step.completed, one commit.
    async fn close_step_completed(
        &self,
        step_id: Uuid,
        name: &str,
        outputs: Option<serde_json::Value>,
    ) -> Result<()> {
        self.assert_ownership().await?;
        let pending = self.take_pending();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE steps SET status = 'completed', completed_at = NOW(), outputs = $2 WHERE id = $1",
        )
        .bind(step_id)
        .bind(outputs)
        .execute(&mut *tx)
        .await?;

        for event in &pending {
            event.insert(&mut *tx).await?;
        }
        self.build_event(
            "step.completed",
            json!({
                "step_id": step_id.to_string(),
                "step_name": name,
            }),
            Some(step_id),
        )
        .insert(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// End boundary for a failed body: FAILED + error + step.failed, one commit.
    ///
    /// Never fails: losing ownership here is logged and the caller continues
    /// unwinding with the original error.
    async fn close_step_failed(&self, step_id: Uuid, name: &str, error: &anyhow::Error) {
        let outcome: Result<()> = async {
            self.assert_ownership().await?;
            let pending = self.take_pending();

            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE steps SET status = 'failed', completed_at = NOW(), error = $2 WHERE id = $1",
            )
            .bind(step_id)
            .bind(error_document(error))
            .execute(&mut *tx)
            .await?;

            for event in &pending {
                event.insert(&mut *tx).await?;
            }
            self.build_event(
                "step.failed",
                json!({
                    "step_id": step_id.to_string(),
                    "step_name": name,
                    "error": error.to_string(),
                }),
                Some(step_id),
            )
            .insert(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {}
            Err(e) if is_lost_lease(&e) => {
                warn!(step_id = %step_id, "lost ownership while marking step as failed");
            }
            Err(e) => {
                error!(step_id = %step_id, error = %e, "error while marking step as failed");
            }
        }
    }

    pub(crate) fn build_event(
        &self,
        event_name: &str,
        data: serde_json::Value,
        step_id: Option<Uuid>,
    ) -> Event {
        let now = Utc::now();
        Event {
            id: Uuid::new_v4(),
            event_name: event_name.to_string(),
            occurred_at: now,
            env_id: self.env_id.clone(),
            actor: self.run.actor.clone(),
            correlation_id: Some(self.run.correlation_id.clone()),
            run_id: Some(self.run.id),
            step_id,
            resource_type: None,
            resource_id: None,
            data,
            created_at: now,
        }
    }

    /// Drain the pending buffer; the caller writes the events in its own
    /// boundary transaction.
    pub(crate) fn take_pending(&self) -> Vec<Event> {
        std::mem::take(&mut *self.pending_events.lock().unwrap())
    }

    /// Discard buffered events (failure-path rollback analogue).
    pub(crate) fn discard_pending(&self) {
        self.pending_events.lock().unwrap().clear();
    }

    /// Commit buffered events outside a step boundary.
    pub(crate) async fn flush_pending(&self) -> Result<()> {
        let pending = self.take_pending();
        if pending.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for event in &pending {
            event.insert(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(crate) fn current_step_id(&self) -> Option<Uuid> {
        self.current_step.lock().unwrap().as_ref().map(|s| s.id)
    }

    /// Execute another blueprint inline as a nested run, inheriting this
    /// run's actor and correlation id. See `executor::run_blueprint`.
    pub async fn run_blueprint(
        &self,
        blueprint_ref: &str,
        inputs: serde_json::Value,
    ) -> Result<Run> {
        crate::executor::run_blueprint(
            &self.pool,
            &self.registry,
            blueprint_ref,
            inputs,
            &self.run.actor,
            Some(self.run.correlation_id.clone()),
        )
        .await
    }
}
