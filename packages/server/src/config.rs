use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::kernel::broker::RedisBrokerConfig;
use crate::kernel::jobs::{
    CircuitBreakerConfig, DrainerConfig, JobRunnerConfig, ReaperConfig, ReliabilityConfig,
    RetryPolicy,
};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub job_dedup_window_secs: u64,
    pub job_default_max_attempts: i32,
    pub job_retry_base_delay_ms: u64,
    pub job_retry_max_delay_secs: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
    pub spool_fallback_threshold: i64,
    pub drainer_healthy_interval_secs: u64,
    pub drainer_degraded_interval_secs: u64,
    pub drainer_batch_size: i64,
    pub drainer_max_backoff_secs: u64,
    pub runner_poll_interval_ms: u64,
    pub runner_batch_size: usize,
    pub stalled_job_timeout_secs: u64,
    pub spool_claim_timeout_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            job_dedup_window_secs: parse_var("JOB_DEDUP_WINDOW_SECS", 300)?,
            job_default_max_attempts: parse_var("JOB_DEFAULT_MAX_ATTEMPTS", 3)?,
            job_retry_base_delay_ms: parse_var("JOB_RETRY_BASE_DELAY_MS", 1000)?,
            job_retry_max_delay_secs: parse_var("JOB_RETRY_MAX_DELAY_SECS", 3600)?,
            circuit_breaker_threshold: parse_var("CIRCUIT_BREAKER_THRESHOLD", 5)?,
            circuit_breaker_cooldown_secs: parse_var("CIRCUIT_BREAKER_COOLDOWN_SECS", 60)?,
            spool_fallback_threshold: parse_var("SPOOL_FALLBACK_THRESHOLD", 50)?,
            drainer_healthy_interval_secs: parse_var("DRAINER_HEALTHY_INTERVAL_SECS", 10)?,
            drainer_degraded_interval_secs: parse_var("DRAINER_DEGRADED_INTERVAL_SECS", 5)?,
            drainer_batch_size: parse_var("DRAINER_BATCH_SIZE", 25)?,
            drainer_max_backoff_secs: parse_var("DRAINER_MAX_BACKOFF_SECS", 300)?,
            runner_poll_interval_ms: parse_var("RUNNER_POLL_INTERVAL_MS", 1000)?,
            runner_batch_size: parse_var("RUNNER_BATCH_SIZE", 10)?,
            stalled_job_timeout_secs: parse_var("STALLED_JOB_TIMEOUT_SECS", 900)?,
            spool_claim_timeout_secs: parse_var("SPOOL_CLAIM_TIMEOUT_SECS", 600)?,
            reaper_interval_secs: parse_var("REAPER_INTERVAL_SECS", 60)?,
        })
    }

    pub fn reliability(&self) -> ReliabilityConfig {
        ReliabilityConfig {
            dedup_window: Duration::from_secs(self.job_dedup_window_secs),
            default_max_attempts: self.job_default_max_attempts,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.circuit_breaker_threshold,
                cooldown: Duration::from_secs(self.circuit_breaker_cooldown_secs),
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.job_retry_base_delay_ms),
            max_delay: Duration::from_secs(self.job_retry_max_delay_secs),
        }
    }

    pub fn broker(&self) -> RedisBrokerConfig {
        RedisBrokerConfig {
            url: self.redis_url.clone(),
            ..Default::default()
        }
    }

    pub fn drainer(&self) -> DrainerConfig {
        DrainerConfig {
            healthy_interval: Duration::from_secs(self.drainer_healthy_interval_secs),
            degraded_interval: Duration::from_secs(self.drainer_degraded_interval_secs),
            batch_size: self.drainer_batch_size,
            max_backoff: Duration::from_secs(self.drainer_max_backoff_secs),
            ..Default::default()
        }
    }

    pub fn runner(&self) -> JobRunnerConfig {
        JobRunnerConfig {
            batch_size: self.runner_batch_size,
            poll_interval: Duration::from_millis(self.runner_poll_interval_ms),
            ..Default::default()
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper_interval_secs),
            stalled_job_timeout: Duration::from_secs(self.stalled_job_timeout_secs),
            spool_claim_timeout: Duration::from_secs(self.spool_claim_timeout_secs),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_numbers_fall_back_to_defaults() {
        let value: u64 = parse_var("RELAY_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn invalid_numbers_are_errors() {
        env::set_var("RELAY_TEST_BAD_NUMBER", "ten");
        let err = parse_var::<u64>("RELAY_TEST_BAD_NUMBER", 1).unwrap_err();
        assert!(err.to_string().contains("RELAY_TEST_BAD_NUMBER"));
        env::remove_var("RELAY_TEST_BAD_NUMBER");
    }

    #[test]
    fn derived_configs_carry_env_values() {
        let config = Config {
            database_url: "postgres://localhost/relay".into(),
            redis_url: "redis://cache:6379".into(),
            job_dedup_window_secs: 120,
            job_default_max_attempts: 5,
            job_retry_base_delay_ms: 250,
            job_retry_max_delay_secs: 60,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_secs: 30,
            spool_fallback_threshold: 50,
            drainer_healthy_interval_secs: 10,
            drainer_degraded_interval_secs: 5,
            drainer_batch_size: 25,
            drainer_max_backoff_secs: 300,
            runner_poll_interval_ms: 500,
            runner_batch_size: 4,
            stalled_job_timeout_secs: 900,
            spool_claim_timeout_secs: 600,
            reaper_interval_secs: 60,
        };

        let reliability = config.reliability();
        assert_eq!(reliability.dedup_window, Duration::from_secs(120));
        assert_eq!(reliability.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(250));
        assert_eq!(config.broker().url, "redis://cache:6379");
        assert_eq!(config.runner().batch_size, 4);
        assert_eq!(config.reaper().stalled_job_timeout, Duration::from_secs(900));
    }
}
