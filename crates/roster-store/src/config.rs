//! Connection parameters for the coordination store
//!
//! Parameters are injected into a connector at construction and are not
//! re-read at runtime.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 20;

/// Coordination store connection configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store addresses as `host:port`
    pub addresses: Vec<String>,
    /// Session timeout; a suspended session expires after this long
    pub session_timeout_ms: u64,
    /// Retries after the first failed attempt
    pub retry_count: u32,
    /// Fixed sleep between attempts
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["127.0.0.1:2181".to_string()],
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl StoreConfig {
    /// Parse a comma separated connect string such as `zk1:2181,zk2:2181`.
    pub fn from_connect_string(connect_string: &str) -> Self {
        Self {
            addresses: connect_string
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_session_timeout(mut self, timeout_ms: u64) -> Self {
        self.session_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, retry_count: u32, backoff_ms: u64) -> Self {
        self.retry_count = retry_count;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn connect_string(&self) -> String {
        self.addresses.join(",")
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.retry_backoff_ms))
    }

    /// Reject configurations no connection attempt could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(StoreError::Config("no store address configured".to_string()));
        }

        for addr in &self.addresses {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| StoreError::Config(format!("missing port in address '{}'", addr)))?;
            if host.is_empty() {
                return Err(StoreError::Config(format!("missing host in address '{}'", addr)));
            }
            port.parse::<u16>()
                .map_err(|_| StoreError::Config(format!("invalid port in address '{}'", addr)))?;
        }

        if self.session_timeout_ms == 0 {
            return Err(StoreError::Config("session timeout must be positive".to_string()));
        }

        Ok(())
    }
}

/// Bounded retry with a fixed backoff, for transient store errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Run `op`, retrying while it fails with a retryable error.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation,
                        attempt,
                        self.max_retries + 1,
                        e,
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT, Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS))
    }
}
