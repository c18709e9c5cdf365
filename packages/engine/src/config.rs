use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use uuid::Uuid;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker: WorkerConfig::from_env()?,
        })
    }
}

/// Worker process knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID for this instance
    pub worker_id: String,
    /// Lease duration granted on claim and extended on renewal
    pub lease_seconds: i64,
    /// How long to wait when no runs are available
    pub poll_interval: Duration,
    /// Maximum number of runs to claim at once
    pub batch_size: i64,
    /// Interval between metrics collector ticks
    pub metrics_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease_seconds: 60,
            poll_interval: Duration::from_secs(2),
            batch_size: 1,
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Load worker knobs from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            worker_id: env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            lease_seconds: env_parse("LEASE_DURATION_SECONDS", defaults.lease_seconds)?,
            poll_interval: Duration::from_secs(env_parse(
                "POLL_INTERVAL_SECONDS",
                defaults.poll_interval.as_secs(),
            )?),
            batch_size: env_parse("WORKER_BATCH_SIZE", defaults.batch_size)?,
            metrics_interval: Duration::from_secs(env_parse(
                "METRICS_COLLECTOR_INTERVAL",
                defaults.metrics_interval.as_secs(),
            )?),
        })
    }

    /// Create a config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_is_sixty_seconds() {
        let config = WorkerConfig::default();
        assert_eq!(config.lease_seconds, 60);
    }

    #[test]
    fn default_poll_interval_is_two_seconds() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn default_batch_size_is_one() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn default_worker_id_has_prefix() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn with_worker_id_overrides_id_only() {
        let config = WorkerConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
        assert_eq!(config.lease_seconds, 60);
    }
}
