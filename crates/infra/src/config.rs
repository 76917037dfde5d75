//! Configuration objects.
//!
//! Each component receives an explicit config value constructed once at
//! startup (usually from environment variables). Nothing reads the environment
//! after construction.

use core::str::FromStr;
use std::time::Duration;

use jobmesh_core::CompletionPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Read `key` through `lookup` and parse it, falling back to `default` when unset.
pub fn parse_or<T, L>(lookup: &L, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Like [`parse_or`], but interprets the value as whole seconds.
pub fn seconds_or<L>(lookup: &L, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default).map(Duration::from_secs)
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Longest accepted visibility window (12 hours).
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest accepted long-poll wait per receive.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Longest accepted retry sweep interval.
pub const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Orchestration service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound for `num_tasks` on job creation
    pub max_tasks: u32,
    /// `max_retries` assigned to every new task
    pub max_task_retries: u32,
    pub completion_policy: CompletionPolicy,
    /// How often RETRYING tasks are re-enqueued
    pub retry_sweep_interval: Duration,
    /// Max tasks re-enqueued per sweep
    pub retry_sweep_batch: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tasks: 10_000,
            max_task_retries: 3,
            completion_policy: CompletionPolicy::CompleteWhenAllTerminal,
            retry_sweep_interval: Duration::from_secs(5),
            retry_sweep_batch: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let cfg = Self {
            max_tasks: parse_or(&lookup, "MAX_TASKS", d.max_tasks)?,
            max_task_retries: parse_or(&lookup, "MAX_TASK_RETRIES", d.max_task_retries)?,
            completion_policy: parse_or(&lookup, "JOB_COMPLETION_POLICY", d.completion_policy)?,
            retry_sweep_interval: seconds_or(
                &lookup,
                "RETRY_SWEEP_INTERVAL_SECONDS",
                d.retry_sweep_interval.as_secs(),
            )?,
            retry_sweep_batch: parse_or(&lookup, "RETRY_SWEEP_BATCH", d.retry_sweep_batch)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks == 0 {
            return Err(invalid("MAX_TASKS", self.max_tasks, "must be at least 1"));
        }
        if self.max_task_retries == 0 {
            return Err(invalid(
                "MAX_TASK_RETRIES",
                self.max_task_retries,
                "must be at least 1",
            ));
        }
        if self.retry_sweep_batch == 0 {
            return Err(invalid("RETRY_SWEEP_BATCH", self.retry_sweep_batch, "must be at least 1"));
        }
        if self.retry_sweep_interval.is_zero() || self.retry_sweep_interval > MAX_SWEEP_INTERVAL {
            return Err(invalid(
                "RETRY_SWEEP_INTERVAL_SECONDS",
                self.retry_sweep_interval.as_secs(),
                &format!("must be between 1 and {}", MAX_SWEEP_INTERVAL.as_secs()),
            ));
        }
        Ok(())
    }

    pub fn with_max_task_retries(mut self, max_task_retries: u32) -> Self {
        self.max_task_retries = max_task_retries;
        self
    }

    pub fn with_completion_policy(mut self, policy: CompletionPolicy) -> Self {
        self.completion_policy = policy;
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: u32) -> Self {
        self.max_tasks = max_tasks;
        self
    }
}

/// Work queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a received message stays hidden before redelivery
    pub visibility_timeout: Duration,
    pub redis_url: Option<String>,
    pub stream_key: String,
    pub consumer_group: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            redis_url: None,
            stream_key: "jobmesh:tasks".to_string(),
            consumer_group: "jobmesh.workers".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let cfg = Self {
            visibility_timeout: seconds_or(
                &lookup,
                "QUEUE_VISIBILITY_TIMEOUT_SECONDS",
                d.visibility_timeout.as_secs(),
            )?,
            redis_url: lookup("REDIS_URL").filter(|s| !s.trim().is_empty()),
            stream_key: lookup("QUEUE_STREAM_KEY").unwrap_or(d.stream_key),
            consumer_group: lookup("QUEUE_CONSUMER_GROUP").unwrap_or(d.consumer_group),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.visibility_timeout;
        if timeout < Duration::from_secs(1) || timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(invalid(
                "QUEUE_VISIBILITY_TIMEOUT_SECONDS",
                timeout.as_secs(),
                &format!("must be between 1 and {}", MAX_VISIBILITY_TIMEOUT.as_secs()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());

        let q = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(q.visibility_timeout, Duration::from_secs(30));
        assert!(q.redis_url.is_none());
    }

    #[test]
    fn values_are_parsed() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("MAX_TASKS", "50"),
            ("MAX_TASK_RETRIES", "5"),
            ("JOB_COMPLETION_POLICY", "fail_on_any_failure"),
            ("RETRY_SWEEP_INTERVAL_SECONDS", "2"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_tasks, 50);
        assert_eq!(cfg.max_task_retries, 5);
        assert_eq!(cfg.completion_policy, CompletionPolicy::FailOnAnyFailure);
        assert_eq!(cfg.retry_sweep_interval, Duration::from_secs(2));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            OrchestratorConfig::from_lookup(lookup(&[("MAX_TASKS", "lots")])),
            Err(ConfigError::Invalid { key: "MAX_TASKS", .. })
        ));
        assert!(matches!(
            OrchestratorConfig::from_lookup(lookup(&[("MAX_TASK_RETRIES", "0")])),
            Err(ConfigError::Invalid { key: "MAX_TASK_RETRIES", .. })
        ));
        assert!(QueueConfig::from_lookup(lookup(&[("QUEUE_VISIBILITY_TIMEOUT_SECONDS", "0")])).is_err());
    }

    #[test]
    fn durations_are_bounded_above() {
        let huge = u64::MAX.to_string();
        assert!(matches!(
            QueueConfig::from_lookup(lookup(&[("QUEUE_VISIBILITY_TIMEOUT_SECONDS", huge.as_str())])),
            Err(ConfigError::Invalid { key: "QUEUE_VISIBILITY_TIMEOUT_SECONDS", .. })
        ));
        assert!(QueueConfig::from_lookup(lookup(&[("QUEUE_VISIBILITY_TIMEOUT_SECONDS", "43200")])).is_ok());
        assert!(QueueConfig::from_lookup(lookup(&[("QUEUE_VISIBILITY_TIMEOUT_SECONDS", "43201")])).is_err());

        for bad in ["0", "3601", huge.as_str()] {
            assert!(matches!(
                OrchestratorConfig::from_lookup(lookup(&[("RETRY_SWEEP_INTERVAL_SECONDS", bad)])),
                Err(ConfigError::Invalid { key: "RETRY_SWEEP_INTERVAL_SECONDS", .. })
            ));
        }
    }
}
