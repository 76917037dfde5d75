//! Worker settings.

use std::time::Duration;

use jobmesh_infra::ConfigError;
use jobmesh_infra::config::{MAX_WAIT_TIME, parse_or, seconds_or};

/// Upper bound on messages per receive (matches common broker batch limits).
pub const MAX_BATCH: usize = 10;

/// Longest accepted sleep between empty polls.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Longest accepted HTTP report timeout.
pub const MAX_REPORT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn out_of_range(key: &'static str, value: Duration, min: u64, max: Duration) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.as_secs().to_string(),
        reason: format!("must be between {min} and {}", max.as_secs()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Unique per worker; doubles as the queue consumer name
    pub worker_id: String,
    /// Base URL of the API the HTTP reporter talks to
    pub api_base_url: String,
    /// Sleep after an empty or failed poll
    pub poll_interval: Duration,
    /// Messages per receive, `1..=MAX_BATCH`
    pub max_messages: usize,
    /// Long-poll wait per receive
    pub wait_time: Duration,
    /// Per-request timeout of the HTTP reporter
    pub report_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            api_base_url: "http://localhost:8000".to_string(),
            poll_interval: Duration::from_secs(5),
            max_messages: MAX_BATCH,
            wait_time: Duration::from_secs(20),
            report_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let cfg = Self {
            worker_id: lookup("WORKER_ID")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(d.worker_id),
            api_base_url: lookup("API_BASE_URL")
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(d.api_base_url),
            poll_interval: seconds_or(&lookup, "POLL_INTERVAL_SECONDS", d.poll_interval.as_secs())?,
            max_messages: parse_or(&lookup, "MAX_MESSAGES_PER_POLL", d.max_messages)?,
            wait_time: seconds_or(&lookup, "WAIT_TIME_SECONDS", d.wait_time.as_secs())?,
            report_timeout: seconds_or(&lookup, "REPORT_TIMEOUT_SECONDS", d.report_timeout.as_secs())?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH).contains(&self.max_messages) {
            return Err(ConfigError::Invalid {
                key: "MAX_MESSAGES_PER_POLL",
                value: self.max_messages.to_string(),
                reason: format!("must be between 1 and {MAX_BATCH}"),
            });
        }
        if self.wait_time > MAX_WAIT_TIME {
            return Err(out_of_range("WAIT_TIME_SECONDS", self.wait_time, 0, MAX_WAIT_TIME));
        }
        if self.poll_interval > MAX_POLL_INTERVAL {
            return Err(out_of_range(
                "POLL_INTERVAL_SECONDS",
                self.poll_interval,
                0,
                MAX_POLL_INTERVAL,
            ));
        }
        if self.report_timeout.is_zero() || self.report_timeout > MAX_REPORT_TIMEOUT {
            return Err(out_of_range(
                "REPORT_TIMEOUT_SECONDS",
                self.report_timeout,
                1,
                MAX_REPORT_TIMEOUT,
            ));
        }
        Ok(())
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }
}
