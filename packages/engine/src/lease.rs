//! Background lease renewal for a claimed run.
//!
//! While a run executes, a companion task renews the lease every
//! `lease_seconds / 2`. Each renewal acquires a fresh connection from the
//! pool, so the renewer never shares a database session with the executor
//! and the long-running execution cannot starve renewal.
//!
//! A renewal that affects zero rows means ownership was lost (another worker
//! reclaimed the run after lease expiry); the renewer cancels its `lost`
//! token, which the executor races against the blueprint future.

use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::queue;

pub struct LeaseRenewer {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
    lost: CancellationToken,
}

impl LeaseRenewer {
    /// Spawn the renewal task for a claimed run.
    pub fn spawn(pool: PgPool, run_id: Uuid, worker_id: String, lease_seconds: i64) -> Self {
        let shutdown = CancellationToken::new();
        let lost = CancellationToken::new();

        let interval = Duration::from_secs((lease_seconds / 2).max(1) as u64);
        let task_shutdown = shutdown.clone();
        let task_lost = lost.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => {
                        debug!(run_id = %run_id, "lease renewal stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match queue::renew_lease(&pool, run_id, &worker_id, lease_seconds).await {
                            Ok(true) => {}
                            Ok(false) => {
                                error!(
                                    run_id = %run_id,
                                    worker_id = %worker_id,
                                    "lost ownership during execution, stopping renewal"
                                );
                                task_lost.cancel();
                                break;
                            }
                            Err(e) => {
                                // Transient DB error: keep the task alive and
                                // retry on the next tick.
                                warn!(run_id = %run_id, error = %e, "lease renewal failed");
                            }
                        }
                    }
                }
            }
        });

        Self {
            handle,
            shutdown,
            lost,
        }
    }

    /// Token cancelled when ownership is lost.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Stop the renewal task and wait for it to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}
