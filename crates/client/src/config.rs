//! Poller and HTTP client configuration.
//!
//! Both structs have defaults suitable for a local backend and can be
//! overridden through environment variables (a `.env` file is loaded by
//! the binary via `dotenvy`).

use std::time::Duration;

use scanlate_core::error::CoreError;

use crate::retry::RetryPolicy;

/// Default delay between polls while a job is not finished.
pub const DEFAULT_INTERVAL_MS: u64 = 2000;

/// Default number of non-terminal polls before giving up (~10 minutes).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 300;

/// Default backend URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Default per-request HTTP timeout. Processing runs in the background,
/// but submissions of large pages can still be slow.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Settings for a [`JobPoller`](crate::poller::JobPoller).
#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    /// Delay between a non-terminal response and the next request.
    pub interval: Duration,
    /// Ceiling on non-terminal responses before the session times out.
    pub max_attempts: u32,
    /// What to do when a status request fails at the transport level.
    pub transport_retry: RetryPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            transport_retry: RetryPolicy::disabled(),
        }
    }
}

impl PollingConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default |
    /// |--------------------------|---------|
    /// | `POLL_INTERVAL_MS`       | `2000`  |
    /// | `POLL_MAX_ATTEMPTS`      | `300`   |
    /// | `POLL_TRANSPORT_RETRIES` | `0`     |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from an arbitrary
    /// key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let interval = match lookup("POLL_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(parse_var("POLL_INTERVAL_MS", &raw)?),
            None => defaults.interval,
        };

        let max_attempts = match lookup("POLL_MAX_ATTEMPTS") {
            Some(raw) => parse_var("POLL_MAX_ATTEMPTS", &raw)?,
            None => defaults.max_attempts,
        };

        let transport_retry = match lookup("POLL_TRANSPORT_RETRIES") {
            Some(raw) => RetryPolicy::exponential(parse_var("POLL_TRANSPORT_RETRIES", &raw)?),
            None => defaults.transport_retry,
        };

        let config = Self {
            interval,
            max_attempts,
            transport_retry,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_transport_retry(mut self, policy: RetryPolicy) -> Self {
        self.transport_retry = policy;
        self
    }

    /// Reject settings that would make the poller spin or never poll.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.interval.is_zero() {
            return Err(CoreError::Validation(
                "Polling interval must be greater than zero".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }
        let retry = &self.transport_retry;
        if retry.is_enabled() && (retry.initial_delay.is_zero() || retry.multiplier < 1.0) {
            return Err(CoreError::Validation(
                "Retry backoff needs a non-zero initial delay and a multiplier >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Wall-clock ceiling on one tracking session, ignoring request time.
    /// Saturates at [`Duration::MAX`].
    pub fn max_duration(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// Settings for [`ScanlateApi`](crate::api::ScanlateApi).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub api_url: String,
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl ApiConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                 |
    /// |------------------------------|-------------------------|
    /// | `SCANLATE_API_URL`           | `http://localhost:8000` |
    /// | `SCANLATE_HTTP_TIMEOUT_SECS` | `300`                   |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let api_url = lookup("SCANLATE_API_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(CoreError::Validation(format!(
                "SCANLATE_API_URL must be an http(s) URL, got '{api_url}'"
            )));
        }

        let request_timeout = match lookup("SCANLATE_HTTP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_var("SCANLATE_HTTP_TIMEOUT_SECS", &raw)?),
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        Ok(Self {
            api_url,
            request_timeout,
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, CoreError> {
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Validation(format!("{key} must be a valid number, got '{raw}'")))
}
