//! Worker supervisor: claim and execute queued runs.
//!
//! The loop drives claim -> execute -> finalize with graceful shutdown:
//! SIGINT/SIGTERM set a shared flag and the loop returns after the current
//! execution completes. Errors inside the loop are logged and swallowed so a
//! bad run or a transient DB failure never kills the worker.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = BlueprintRegistry::new();
//! blueprints::register_all(&mut registry);
//!
//! let worker = Worker::new(pool, Arc::new(registry), WorkerConfig::from_env()?);
//! worker.run_until_shutdown().await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::executor;
use crate::metrics;
use crate::queue;
use crate::registry::SharedBlueprintRegistry;

pub struct Worker {
    pool: PgPool,
    registry: SharedBlueprintRegistry,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(pool: PgPool, registry: SharedBlueprintRegistry, config: WorkerConfig) -> Self {
        Self {
            pool,
            registry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a shutdown handle for graceful shutdown.
    ///
    /// Store `true` to stop the loop after the current execution completes.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run the worker until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        let registered = self.registry.list();
        info!(
            worker_id = %self.config.worker_id,
            lease_seconds = self.config.lease_seconds,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            blueprints = registered.len(),
            "worker starting"
        );
        info!(blueprints = %registered.join(", "), "registered blueprints");

        // Metrics roll up on their own cadence, never in the claim path.
        tokio::spawn(metrics::collector_loop(
            self.pool.clone(),
            self.config.metrics_interval,
        ));

        loop {
            if self.is_shutdown_requested() {
                break;
            }

            let runs = match queue::claim_runs(
                &self.pool,
                &self.config.worker_id,
                self.config.batch_size,
                self.config.lease_seconds,
            )
            .await
            {
                Ok(runs) => runs,
                Err(e) => {
                    error!(error = %e, "failed to claim runs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if runs.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            for run in runs {
                if self.is_shutdown_requested() {
                    break;
                }

                // Executed on its own task so a panicking blueprint is
                // contained; the abandoned run is reclaimed after lease expiry.
                let pool = self.pool.clone();
                let registry = self.registry.clone();
                let worker_id = self.config.worker_id.clone();
                let lease_seconds = self.config.lease_seconds;
                let run_id = run.id;

                let handle = tokio::spawn(async move {
                    executor::execute_claimed(&pool, &registry, &run, &worker_id, lease_seconds)
                        .await;
                });

                if let Err(e) = handle.await {
                    error!(run_id = %run_id, error = %e, "execution task panicked");
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker shutting down gracefully");
        Ok(())
    }

    /// Run until SIGINT/SIGTERM is received.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown_handle();

        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("received shutdown signal, finishing current run");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.run().await
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BlueprintRegistry;

    #[tokio::test]
    async fn shutdown_flag_round_trips() {
        let pool_opts = sqlx::postgres::PgPoolOptions::new();
        let pool = pool_opts.connect_lazy("postgres://localhost/unused").unwrap();
        let worker = Worker::new(
            pool,
            Arc::new(BlueprintRegistry::new()),
            WorkerConfig::with_worker_id("test-worker"),
        );

        assert!(!worker.is_shutdown_requested());
        worker.request_shutdown();
        assert!(worker.is_shutdown_requested());
    }
}
