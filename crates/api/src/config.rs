//! API server settings.

use std::net::SocketAddr;

use jobmesh_infra::config::parse_or;
use jobmesh_infra::{ConfigError, OrchestratorConfig, QueueConfig};

/// Upper bound on in-process workers started by the API server.
pub const MAX_EMBEDDED_WORKERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Postgres connection string; when unset the in-memory store is used
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Worker threads running inside the API process (0 = external workers only)
    pub embedded_workers: usize,
    pub orchestrator: OrchestratorConfig,
    pub queue: QueueConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            database_url: None,
            database_max_connections: 10,
            embedded_workers: 0,
            orchestrator: OrchestratorConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let cfg = Self {
            bind_addr: parse_or(&lookup, "BIND_ADDR", d.bind_addr)?,
            database_url: lookup("DATABASE_URL")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                d.database_max_connections,
            )?,
            embedded_workers: parse_or(&lookup, "EMBEDDED_WORKERS", d.embedded_workers)?,
            orchestrator: OrchestratorConfig::from_lookup(&lookup)?,
            queue: QueueConfig::from_lookup(&lookup)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedded_workers > MAX_EMBEDDED_WORKERS {
            return Err(ConfigError::Invalid {
                key: "EMBEDDED_WORKERS",
                value: self.embedded_workers.to_string(),
                reason: format!("must be at most {MAX_EMBEDDED_WORKERS}"),
            });
        }
        if self.database_max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
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
    fn defaults_use_in_memory_backends() {
        let cfg = ApiConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8000);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.embedded_workers, 0);
        assert_eq!(cfg.orchestrator, OrchestratorConfig::default());
    }

    #[test]
    fn nested_settings_are_read_from_the_same_source() {
        let cfg = ApiConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/jobmesh"),
            ("EMBEDDED_WORKERS", "4"),
            ("MAX_TASK_RETRIES", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/jobmesh"));
        assert_eq!(cfg.embedded_workers, 4);
        assert_eq!(cfg.orchestrator.max_task_retries, 5);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ApiConfig::from_lookup(lookup(&[("BIND_ADDR", "nowhere")])),
            Err(ConfigError::Invalid { key: "BIND_ADDR", .. })
        ));
        assert!(matches!(
            ApiConfig::from_lookup(lookup(&[("EMBEDDED_WORKERS", "1000")])),
            Err(ConfigError::Invalid { key: "EMBEDDED_WORKERS", .. })
        ));
    }
}
