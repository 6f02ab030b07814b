use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

/// How the next attempt of an errored message or call is spaced out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed,
    Exponential,
}

impl FromStr for BackoffPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(anyhow!("unknown backoff policy: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub workers: usize,
    pub max_requests_per_second: u32,
    pub batch_size: i64,
    pub backoff: BackoffPolicy,
    pub backoff_base: Duration,
    pub max_msg_errors: i32,
    pub msg_max_age: chrono::Duration,
    pub stale_connection_after: chrono::Duration,
}

/// Longest any retry waits, whatever the base delay.
pub const MAX_BACKOFF_DAYS: i64 = 7;

impl RetryConfig {
    /// Delay before the next attempt, given how many errors the attempt has seen so far.
    /// Never more than [`MAX_BACKOFF_DAYS`].
    pub fn backoff_for(&self, error_count: i32) -> chrono::Duration {
        let max = chrono::Duration::days(MAX_BACKOFF_DAYS);
        let base = chrono::Duration::from_std(self.backoff_base)
            .unwrap_or(max)
            .min(max);
        match self.backoff {
            BackoffPolicy::Fixed => base,
            BackoffPolicy::Exponential => {
                let exponent = error_count.clamp(1, 10) as u32 - 1;
                base.num_milliseconds()
                    .checked_mul(2_i64.pow(exponent))
                    .map_or(max, chrono::Duration::milliseconds)
                    .min(max)
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_requests_per_second: 10,
            batch_size: 200,
            backoff: BackoffPolicy::Exponential,
            backoff_base: Duration::from_secs(300),
            max_msg_errors: 3,
            msg_max_age: chrono::Duration::days(7),
            stale_connection_after: chrono::Duration::days(2),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub redis_url: Option<String>,
    pub flow_engine_url: String,
    pub courier_url: String,
    pub ivr_url: String,
    pub asset_cache_ttl: Duration,
    pub task_timeout: Duration,
    pub retry: RetryConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let redis_url = env::var("REDIS_URL").ok();
        let flow_engine_url = env::var("FLOW_ENGINE_URL")
            .unwrap_or_else(|_| "http://localhost:8091".to_string());
        let courier_url =
            env::var("COURIER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        let ivr_url = env::var("IVR_URL").unwrap_or_else(|_| courier_url.clone());
        let asset_cache_ttl = Duration::from_secs(
            env::var("ASSET_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("ASSET_CACHE_TTL_SECS must be an integer")?,
        );
        let task_timeout = Duration::from_secs(
            env::var("TASK_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("TASK_TIMEOUT_SECS must be an integer")?,
        );

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            workers: env::var("RETRY_WORKERS")
                .ok()
                .map(|value| value.parse())
                .transpose()
                .context("RETRY_WORKERS must be an integer")?
                .unwrap_or(defaults.workers)
                .max(1),
            max_requests_per_second: env::var("RETRY_MAX_RPS")
                .ok()
                .map(|value| value.parse())
                .transpose()
                .context("RETRY_MAX_RPS must be an integer")?
                .unwrap_or(defaults.max_requests_per_second)
                .max(1),
            batch_size: env::var("RETRY_BATCH_SIZE")
                .ok()
                .map(|value| value.parse())
                .transpose()
                .context("RETRY_BATCH_SIZE must be an integer")?
                .unwrap_or(defaults.batch_size),
            backoff: env::var("RETRY_BACKOFF")
                .ok()
                .map(|value| value.parse())
                .transpose()?
                .unwrap_or(defaults.backoff),
            backoff_base: env::var("RETRY_BACKOFF_SECS")
                .ok()
                .map(|value| value.parse().map(Duration::from_secs))
                .transpose()
                .context("RETRY_BACKOFF_SECS must be an integer")?
                .unwrap_or(defaults.backoff_base),
            max_msg_errors: env::var("MAX_MSG_ERRORS")
                .ok()
                .map(|value| value.parse())
                .transpose()
                .context("MAX_MSG_ERRORS must be an integer")?
                .unwrap_or(defaults.max_msg_errors),
            msg_max_age: env::var("MSG_MAX_AGE_DAYS")
                .ok()
                .map(|value| value.parse().map(chrono::Duration::days))
                .transpose()
                .context("MSG_MAX_AGE_DAYS must be an integer")?
                .unwrap_or(defaults.msg_max_age),
            stale_connection_after: env::var("STALE_CONNECTION_HOURS")
                .ok()
                .map(|value| value.parse().map(chrono::Duration::hours))
                .transpose()
                .context("STALE_CONNECTION_HOURS must be an integer")?
                .unwrap_or(defaults.stale_connection_after),
        };

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            redis_url,
            flow_engine_url,
            courier_url,
            ivr_url,
            asset_cache_ttl,
            task_timeout,
            retry,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_url(&self.database_url)
    }

    pub fn redacted_redis_url(&self) -> Option<String> {
        self.redis_url.as_deref().map(redact_url)
    }
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
