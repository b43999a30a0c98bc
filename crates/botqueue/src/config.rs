use std::time::Duration;

use crate::db::PoolSettings;
use crate::queue::manager::ManagerConfig;
use crate::queue::retry::{RetryPolicy, MAX_JITTER_PCT};
use crate::queue::store::DEFAULT_MAX_PAYLOAD_BYTES;

/// Runtime configuration, loaded from the environment (and `.env` if present).
///
/// Every knob reads `BOTQUEUE_<NAME>` first and falls back to the bare `<NAME>`.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub reap_interval_ms: u64,
    pub stale_timeout_secs: u64,
    pub handler_timeout_secs: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_pct: f64,
    pub max_payload_bytes: usize,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub db_disable_jit: bool,
    pub migrate_on_startup: bool,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("BOTQUEUE_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let concurrency = parse_or("BOTQUEUE_CONCURRENCY", "CONCURRENCY", 4_usize).clamp(1, 256);
        let poll_interval_ms = parse_or("BOTQUEUE_POLL_INTERVAL_MS", "POLL_INTERVAL_MS", 250_u64);
        let reap_interval_ms = parse_or("BOTQUEUE_REAP_INTERVAL_MS", "REAP_INTERVAL_MS", 15_000_u64);
        let stale_timeout_secs =
            parse_or("BOTQUEUE_STALE_TIMEOUT_SECS", "STALE_TIMEOUT_SECS", 300_u64).max(1);
        let handler_timeout_secs =
            parse_or("BOTQUEUE_HANDLER_TIMEOUT_SECS", "HANDLER_TIMEOUT_SECS", 60_u64).max(1);

        let retry_base_ms = parse_or("BOTQUEUE_RETRY_BASE_MS", "RETRY_BASE_MS", 2_000_u64);
        let retry_max_ms =
            parse_or("BOTQUEUE_RETRY_MAX_MS", "RETRY_MAX_MS", 15 * 60 * 1000_u64).max(retry_base_ms);
        let retry_jitter_pct = parse_or("BOTQUEUE_RETRY_JITTER_PCT", "RETRY_JITTER_PCT", 0.20_f64)
            .clamp(0.0, MAX_JITTER_PCT);

        let max_payload_bytes = parse_or(
            "BOTQUEUE_MAX_PAYLOAD_BYTES",
            "MAX_PAYLOAD_BYTES",
            DEFAULT_MAX_PAYLOAD_BYTES,
        );

        let db_max_connections =
            parse_or("BOTQUEUE_DB_MAX_CONNECTIONS", "DB_MAX_CONNECTIONS", 8_u32).clamp(1, 64);
        let db_acquire_timeout_secs = parse_or(
            "BOTQUEUE_DB_ACQUIRE_TIMEOUT_SECS",
            "DB_ACQUIRE_TIMEOUT_SECS",
            10_u64,
        )
        .clamp(1, 60);
        let db_disable_jit = env_bool("BOTQUEUE_DISABLE_JIT").unwrap_or(true);

        let migrate_on_startup = env_bool("BOTQUEUE_MIGRATE_ON_STARTUP").unwrap_or(false);
        let log_json = env_bool("BOTQUEUE_LOG_JSON").unwrap_or(false);

        // stale items must be given at least one full handler budget
        if stale_timeout_secs < handler_timeout_secs {
            anyhow::bail!(
                "stale timeout ({stale_timeout_secs}s) must not be shorter than the handler timeout ({handler_timeout_secs}s)"
            );
        }

        Ok(Self {
            database_url,
            worker_id,
            concurrency,
            poll_interval_ms,
            reap_interval_ms,
            stale_timeout_secs,
            handler_timeout_secs,
            retry_base_ms,
            retry_max_ms,
            retry_jitter_pct,
            max_payload_bytes,
            db_max_connections,
            db_acquire_timeout_secs,
            db_disable_jit,
            migrate_on_startup,
            log_json,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            jitter_pct: self.retry_jitter_pct,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.db_max_connections,
            acquire_timeout: Duration::from_secs(self.db_acquire_timeout_secs),
            disable_jit: self.db_disable_jit,
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            worker_id: self.worker_id.clone(),
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reap_interval: Duration::from_millis(self.reap_interval_ms),
            stale_timeout: Duration::from_secs(self.stale_timeout_secs),
            ..ManagerConfig::default()
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn parse_or<T: std::str::FromStr>(primary: &str, fallback: &str, default: T) -> T {
    env_or_fallback(primary, fallback)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
