//! # ReasonChip configuration
//!
//! One YAML file configures the broker and worker daemons and the
//! logging level map. String values support shell-style `${VAR}`
//! environment substitution.

mod loader;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

pub use loader::{load_config, ConfigError};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ReasonChipConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// URI clients connect to.
    #[serde(default = "default_client_listen")]
    pub client_listen: String,
    /// URI workers connect to.
    #[serde(default = "default_worker_listen")]
    pub worker_listen: String,
}

fn default_client_listen() -> String {
    "tcp://127.0.0.1:51001".to_string()
}

fn default_worker_listen() -> String {
    "tcp://127.0.0.1:51002".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_listen: default_client_listen(),
            worker_listen: default_worker_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Broker URI the worker connects to.
    #[serde(default = "default_broker_uri")]
    pub broker: String,
    /// Concurrent run capacity.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Reconnect after transport loss.
    #[serde(default)]
    pub reconnect: bool,
    /// Collection name → pipeline tree root.
    #[serde(default)]
    pub collections: HashMap<String, PathBuf>,
}

fn default_broker_uri() -> String {
    "tcp://127.0.0.1:51002".to_string()
}

fn default_workers() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker: default_broker_uri(),
            workers: default_workers(),
            reconnect: false,
            collections: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logger target → level; the empty target sets the default level.
    #[serde(default)]
    pub levels: HashMap<String, String>,
}

impl LoggingConfig {
    /// Render the map as tracing `EnvFilter` directives.
    pub fn directives(&self) -> Vec<String> {
        let mut directives: Vec<String> = self
            .levels
            .iter()
            .map(|(target, level)| {
                if target.is_empty() {
                    level.clone()
                } else {
                    format!("{target}={level}")
                }
            })
            .collect();
        directives.sort();
        directives
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReasonChipConfig::default();
        assert_eq!(config.broker.client_listen, "tcp://127.0.0.1:51001");
        assert_eq!(config.worker.workers, 4);
        assert!(!config.worker.reconnect);
    }

    #[test]
    fn test_logging_directives() {
        let mut levels = HashMap::new();
        levels.insert(String::new(), "info".to_string());
        levels.insert("reasonchip_net".to_string(), "debug".to_string());
        let logging = LoggingConfig { levels };
        assert_eq!(
            logging.directives(),
            vec!["info".to_string(), "reasonchip_net=debug".to_string()]
        );
    }
}
