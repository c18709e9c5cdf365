//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; each harness
//! gets its own database (created and migrated on setup) so concurrently
//! running tests never claim each other's runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use uuid::Uuid;

use engine_core::blueprints;
use engine_core::model::Run;
use engine_core::{BlueprintRegistry, SharedBlueprintRegistry, Worker, WorkerConfig};

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Connection URL prefix without a database name.
    base_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG; try_init avoids panicking when already set up.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let base_url = format!("postgresql://postgres:postgres@{}:{}", host, port);

        Ok(Self {
            base_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test harness: isolated database, migrated schema, built-in registry.
pub struct TestHarness {
    pub db_pool: PgPool,
    pub registry: SharedBlueprintRegistry,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_name = format!("engine_test_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&format!("{}/postgres", infra.base_url))
            .await
            .context("Failed to connect to admin database")?;
        sqlx::query(&format!("CREATE DATABASE {}", db_name))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&format!("{}/{}", infra.base_url, db_name))
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        let mut registry = BlueprintRegistry::new();
        blueprints::register_all(&mut registry);

        Ok(Self {
            db_pool,
            registry: Arc::new(registry),
        })
    }

    /// Start a worker with a fast poll for test latency.
    pub fn start_worker(&self, worker_id: &str) -> WorkerHandle {
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(100),
            ..WorkerConfig::with_worker_id(worker_id)
        };
        self.start_worker_with(config)
    }

    pub fn start_worker_with(&self, config: WorkerConfig) -> WorkerHandle {
        let worker = Worker::new(self.db_pool.clone(), self.registry.clone(), config);
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        WorkerHandle { shutdown, handle }
    }

    /// Poll until the run reaches a terminal status.
    pub async fn wait_for_terminal(&self, run_id: Uuid, timeout: Duration) -> Result<Run> {
        let start = std::time::Instant::now();

        loop {
            let run = Run::find_by_id(run_id, &self.db_pool)
                .await?
                .ok_or_else(|| anyhow!("run {} not found", run_id))?;

            if run.status.is_terminal() {
                return Ok(run);
            }
            if start.elapsed() > timeout {
                return Err(anyhow!(
                    "run {} still {:?} after {:?}",
                    run_id,
                    run.status,
                    timeout
                ));
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

/// Handle to a worker running on a background task.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Request shutdown and wait for the loop to drain.
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.handle.await;
    }
}
