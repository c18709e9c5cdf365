//! Worker process entry point.
//!
//! Registers the built-in blueprints, connects to Postgres, and runs the
//! claim/execute loop until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use engine_core::blueprints;
use engine_core::{BlueprintRegistry, Config, Worker};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,engine_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = Config::from_env()?;

    tracing::info!(worker_id = %config.worker.worker_id, "starting worker process");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    // The registry must be fully populated before the loop starts claiming.
    let mut registry = BlueprintRegistry::new();
    blueprints::register_all(&mut registry);

    let worker = Worker::new(pool, Arc::new(registry), config.worker);
    worker.run_until_shutdown().await?;

    tracing::info!("worker stopped");
    Ok(())
}
