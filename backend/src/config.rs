use std::str::FromStr;
use std::time::Duration;

use crate::batcher::DEFAULT_BATCH_SIZE;
use crate::execution::RetryPolicy;
use crate::scheduler::scheduler::SchedulerConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    // =========================
    // Intake configuration
    // =========================
    /// Maximum number of identifiers carried by a single unit (K).
    ///
    /// Every submission is split into `ceil(N / batch_size)` units.
    pub batch_size: usize,

    // =========================
    // Scheduler configuration
    // =========================
    /// Minimum spacing between two units entering IN_FLIGHT.
    ///
    /// Measured from the end of a unit's processing to the next pick,
    /// so throughput is bounded to one unit per cooldown at most.
    pub cooldown: Duration,

    /// Simulated duration of the external processing call.
    pub processing_time: Duration,

    /// Upper bound on a single processing attempt. Exceeding it counts
    /// as a failed attempt.
    pub processing_timeout: Duration,

    /// Total attempts per unit (first try included) before it is FAILED.
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles on each subsequent retry.
    pub retry_backoff: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ingest_dev.db?mode=rwc".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            cooldown: Duration::from_millis(5_000),
            processing_time: Duration::from_millis(1_000),
            processing_timeout: Duration::from_millis(30_000),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1_000),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults.database_url.clone());

        Self {
            database_url,

            batch_size: env_or("INGEST_BATCH_SIZE", defaults.batch_size).max(1),

            cooldown: Duration::from_millis(env_or(
                "INGEST_COOLDOWN_MS",
                defaults.cooldown.as_millis() as u64,
            )),
            processing_time: Duration::from_millis(env_or(
                "INGEST_PROCESSING_MS",
                defaults.processing_time.as_millis() as u64,
            )),
            processing_timeout: Duration::from_millis(env_or(
                "INGEST_PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout.as_millis() as u64,
            )),
            max_attempts: env_or("INGEST_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            retry_backoff: Duration::from_millis(env_or(
                "INGEST_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            cooldown: self.cooldown,
            processing_timeout: self.processing_timeout,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: self.retry_backoff,
            },
        }
    }
}

/// Reads `key` from the environment, falling back to `default` when unset or
/// unparseable.
fn env_or<T: FromStr + Copy + std::fmt::Debug>(key: &str, default: T) -> T {
    parse_or(key, std::env::var(key).ok().as_deref(), default)
}

fn parse_or<T: FromStr + Copy + std::fmt::Debug>(key: &str, raw: Option<&str>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, ?default, "unparseable config value; using default");
            default
        }
    }
}
