//! Config loading with `${VAR}` environment substitution.

use std::path::Path;

use serde_yaml::Value;
use thiserror::Error;

use crate::ReasonChipConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("environment variable '{var}' referenced by config is not set")]
    MissingEnv { var: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load_config(path: &Path) -> Result<ReasonChipConfig, ConfigError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    load_str(&content, &display)
}

pub fn load_str(content: &str, path: &str) -> Result<ReasonChipConfig, ConfigError> {
    let mut document: Value =
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
    substitute_env(&mut document)?;
    let config: ReasonChipConfig =
        serde_yaml::from_value(document).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ReasonChipConfig) -> Result<(), ConfigError> {
    if config.worker.workers == 0 {
        return Err(ConfigError::Invalid("worker.workers must be > 0".into()));
    }
    for uri in [
        &config.broker.client_listen,
        &config.broker.worker_listen,
        &config.worker.broker,
    ] {
        if !uri.contains("://") {
            return Err(ConfigError::Invalid(format!(
                "'{uri}' is not a transport uri"
            )));
        }
    }
    for (name, root) in &config.worker.collections {
        if root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "collection '{name}' has an empty path"
            )));
        }
    }
    Ok(())
}

/// Replace `${VAR}` in every string scalar. A missing variable is an
/// error rather than a silent empty string.
fn substitute_env(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand(s)?;
            }
            Ok(())
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_env(item)?;
            }
            Ok(())
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn expand(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            // Unterminated reference stays literal.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let var = &tail[..end];
        let value = std::env::var(var).map_err(|_| ConfigError::MissingEnv {
            var: var.to_string(),
        })?;
        out.push_str(&value);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let config = load_str(
            r#"
broker:
  client_listen: tcp://0.0.0.0:6001
  worker_listen: tcp://0.0.0.0:6002
worker:
  broker: tcp://10.0.0.1:6002
  workers: 8
  reconnect: true
  collections:
    demo: ./pipelines
logging:
  levels:
    "": info
"#,
            "test.yaml",
        )
        .unwrap();
        assert_eq!(config.broker.client_listen, "tcp://0.0.0.0:6001");
        assert_eq!(config.worker.workers, 8);
        assert!(config.worker.reconnect);
        assert_eq!(config.worker.collections.len(), 1);
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("RC_TEST_PORT", "7001");
        let config = load_str(
            "broker:\n  client_listen: tcp://127.0.0.1:${RC_TEST_PORT}\n",
            "test.yaml",
        )
        .unwrap();
        assert_eq!(config.broker.client_listen, "tcp://127.0.0.1:7001");
    }

    #[test]
    fn test_missing_env_is_an_error() {
        let err = load_str(
            "worker:\n  broker: tcp://${RC_DEFINITELY_UNSET_VAR}:1\n",
            "test.yaml",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv { .. }));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = load_str("worker:\n  workers: 0\n", "test.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(load_str("bogus_section: {}\n", "test.yaml").is_err());
    }
}
