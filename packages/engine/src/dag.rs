//! DAG orchestration: idempotent child spawn and multi-child wait.
//!
//! A child is visible (QUEUED with its edge) before the parent can observe it
//! via `wait_runs`, because spawn commits the child run and the edge in one
//! transaction before returning.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::model::{Run, RunEdge, RunStatus};
use crate::queue::is_unique_violation;

/// Wait policy for `wait_runs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Wait for every child to complete; fail fast on the first failure.
    #[default]
    All,
    /// Return as soon as any child completes; fail when all have failed.
    Any,
}

impl WaitPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitPolicy::All => "all",
            WaitPolicy::Any => "any",
        }
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct SpawnOptions {
    /// Idempotency key: at most one child per (parent, key).
    #[builder(default, setter(strip_option, into))]
    pub child_key: Option<String>,
    /// Inherits the parent's priority when absent.
    #[builder(default, setter(strip_option))]
    pub priority: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct WaitOptions {
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
    /// Initial polling interval; grows 1.25x after 10s, capped at 2s.
    #[builder(default = Duration::from_millis(500))]
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Result of a satisfied wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl RunContext {
    /// Spawn a child run for DAG execution.
    ///
    /// Race-safe and atomic: the child run and its edge are inserted in a
    /// single transaction, so no orphan children are left behind. With a
    /// `child_key` the spawn is idempotent; losing the insert race re-reads
    /// the edge and returns the winner's child id.
    pub async fn spawn_run(
        &self,
        blueprint_ref: &str,
        inputs: serde_json::Value,
        opts: SpawnOptions,
    ) -> Result<Uuid> {
        // Fast path: already spawned under this key.
        if let Some(key) = &opts.child_key {
            if let Some(edge) =
                RunEdge::find_by_parent_and_key(self.run_id(), key, self.pool()).await?
            {
                info!(
                    child_key = %key,
                    child_run_id = %edge.child_run_id,
                    "child run already spawned"
                );
                return Ok(edge.child_run_id);
            }
        }

        let parent = self.run();
        let priority = opts.priority.unwrap_or(parent.priority);
        let now = Utc::now();

        let child = Run::builder()
            .name(blueprint_ref.to_string())
            .actor(parent.actor.clone())
            .correlation_id(parent.correlation_id.clone())
            .inputs(inputs)
            .queued_at(now)
            .run_at(opts.run_at.unwrap_or(now))
            .priority(priority)
            .parent_run_id(parent.id)
            .build();
        let edge = RunEdge::child(parent.id, child.id, opts.child_key.clone());

        let spawn: Result<()> = async {
            let mut tx = self.pool().begin().await?;
            child.insert(&mut *tx).await?;
            edge.insert(&mut *tx).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        let child_run_id = match spawn {
            Ok(()) => child.id,
            Err(e) if is_unique_violation(&e) => {
                // Race: a concurrent spawn with the same child_key won.
                let Some(key) = &opts.child_key else {
                    return Err(e);
                };
                let edge = RunEdge::find_by_parent_and_key(self.run_id(), key, self.pool())
                    .await?
                    .ok_or(e)?;
                info!(
                    child_key = %key,
                    child_run_id = %edge.child_run_id,
                    "spawn race lost, returning existing child run"
                );
                return Ok(edge.child_run_id);
            }
            Err(e) => return Err(e),
        };

        // Emitted after the commit so the event never references a rolled-back child.
        self.emit_event(
            "run.spawned",
            json!({
                "parent_run_id": self.run_id().to_string(),
                "child_run_id": child_run_id.to_string(),
                "child_key": opts.child_key.clone(),
                "blueprint_ref": blueprint_ref,
                "priority": priority,
            }),
        )
        .await?;

        info!(
            child_run_id = %child_run_id,
            blueprint_ref,
            child_key = ?opts.child_key,
            "spawned child run"
        );
        Ok(child_run_id)
    }

    /// Wait for child runs to reach a policy-satisfying state.
    ///
    /// Each poll reads `(id, status)` on a fresh pool connection to avoid
    /// stale snapshots, asserts parent ownership (a demoted parent must stop
    /// waiting), and backs off adaptively with jitter.
    pub async fn wait_runs(
        &self,
        run_ids: &[Uuid],
        policy: WaitPolicy,
        opts: WaitOptions,
    ) -> Result<WaitOutcome> {
        let start = Instant::now();
        let mut poll = opts.poll_interval;

        info!(
            count = run_ids.len(),
            policy = policy.as_str(),
            timeout = ?opts.timeout,
            "waiting for child runs"
        );

        loop {
            self.assert_ownership().await?;

            if let Some(timeout) = opts.timeout {
                if start.elapsed() > timeout {
                    return Err(EngineError::WaitTimeout {
                        policy: policy.as_str().to_string(),
                        timeout_secs: timeout.as_secs_f64(),
                    }
                    .into());
                }
            }

            // Fresh connection per poll; (id, status) only.
            let rows = {
                let mut conn = self.pool().acquire().await?;
                sqlx::query_as::<_, (Uuid, RunStatus)>(
                    "SELECT id, status FROM runs WHERE id = ANY($1)",
                )
                .bind(run_ids)
                .fetch_all(&mut *conn)
                .await?
            };

            let completed: Vec<Uuid> = rows
                .iter()
                .filter(|(_, st)| *st == RunStatus::Completed)
                .map(|(id, _)| *id)
                .collect();
            let failed: Vec<Uuid> = rows
                .iter()
                .filter(|(_, st)| matches!(st, RunStatus::Failed | RunStatus::Cancelled))
                .map(|(id, _)| *id)
                .collect();
            let done = completed.len() + failed.len();

            match policy {
                WaitPolicy::All => {
                    if !failed.is_empty() {
                        return Err(EngineError::ChildRunsFailed {
                            policy: policy.as_str().to_string(),
                            failed,
                        }
                        .into());
                    }
                    if done == run_ids.len() {
                        info!(count = completed.len(), "all child runs completed");
                        return Ok(WaitOutcome {
                            completed,
                            failed: Vec::new(),
                        });
                    }
                }
                WaitPolicy::Any => {
                    if !completed.is_empty() {
                        info!(
                            completed = completed.len(),
                            failed = failed.len(),
                            "child run completed"
                        );
                        return Ok(WaitOutcome { completed, failed });
                    }
                    if failed.len() == run_ids.len() {
                        return Err(EngineError::ChildRunsFailed {
                            policy: policy.as_str().to_string(),
                            failed,
                        }
                        .into());
                    }
                }
            }

            if self.current_step_id().is_some() {
                let fraction = if run_ids.is_empty() {
                    0.0
                } else {
                    done as f64 / run_ids.len() as f64
                };
                if let Err(e) = self
                    .emit_progress(
                        &format!("Waiting for child runs: {}/{} done", done, run_ids.len()),
                        Some(fraction),
                    )
                    .await
                {
                    warn!(error = %e, "failed to emit wait progress");
                }
            }

            // Jittered sleep; mild backoff after 10s, capped at 2s.
            let jitter = Duration::from_secs_f64(fastrand::f64() * 0.1);
            tokio::time::sleep(poll + jitter).await;

            if start.elapsed() > Duration::from_secs(10) && poll < Duration::from_secs(2) {
                poll = std::cmp::min(Duration::from_secs(2), poll.mul_f64(1.25));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_policy_names() {
        assert_eq!(WaitPolicy::All.as_str(), "all");
        assert_eq!(WaitPolicy::Any.as_str(), "any");
    }

    #[test]
    fn wait_policy_deserializes_lowercase() {
        let policy: WaitPolicy = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(policy, WaitPolicy::Any);
    }

    #[test]
    fn spawn_options_default_inherits() {
        let opts = SpawnOptions::default();
        assert!(opts.child_key.is_none());
        assert!(opts.priority.is_none());
        assert!(opts.run_at.is_none());
    }

    #[test]
    fn wait_options_default_poll_interval() {
        let opts = WaitOptions::default();
        assert_eq!(opts.poll_interval, Duration::from_millis(500));
        assert!(opts.timeout.is_none());
    }
}
