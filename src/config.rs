use serde::Deserialize;
use std::env;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("failed to parse environment variable {name} with value '{value}'")]
    InvalidVar { name: &'static str, value: String },
}

/// Cluster access configuration: the namespace name and the proxy endpoint
/// serving the directory and conscience APIs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub namespace: String,
    /// `host:port` of the cluster proxy.
    pub proxy: String,
    #[serde(default = "default_timeout", with = "duration_seconds")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)
}

mod duration_seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

impl Config {
    pub fn new(namespace: impl Into<String>, proxy: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            proxy: proxy.into(),
            timeout: default_timeout(),
        }
    }

    /// Reads `OIO_NAMESPACE`, `OIO_PROXY` and the optional
    /// `OIO_TIMEOUT_SECONDS`. Fails fast on anything missing or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let namespace =
            env::var("OIO_NAMESPACE").map_err(|_| ConfigError::MissingVar("OIO_NAMESPACE"))?;
        let proxy = env::var("OIO_PROXY").map_err(|_| ConfigError::MissingVar("OIO_PROXY"))?;

        let timeout = match env::var("OIO_TIMEOUT_SECONDS") {
            Ok(value) => {
                let seconds: u64 = value.parse().map_err(|_| ConfigError::InvalidVar {
                    name: "OIO_TIMEOUT_SECONDS",
                    value,
                })?;
                Duration::from_secs(seconds)
            }
            Err(_) => default_timeout(),
        };

        Ok(Self {
            namespace,
            proxy,
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_config() {
        let config = Config::new("OPENIO", "127.0.0.1:6000");
        assert_eq!(config.namespace, "OPENIO");
        assert_eq!(config.proxy, "127.0.0.1:6000");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_deserialize_with_timeout() {
        let config: Config =
            serde_json::from_str(r#"{"namespace": "NS", "proxy": "10.0.0.1:6000", "timeout": 5}"#)
                .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_default_timeout() {
        let config: Config =
            serde_json::from_str(r#"{"namespace": "NS", "proxy": "10.0.0.1:6000"}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
    }
}
