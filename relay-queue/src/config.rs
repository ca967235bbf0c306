//! Queue configuration.
//!
//! A [`QueueConfig`] names the connections a process may use, which one is the
//! default, and how workers poll. Each connection picks a driver and carries a
//! free-form options map that the driver deserializes into its own typed
//! options.
//!
//! ## Environment
//!
//! [`QueueConfig::from_env`] reads variables prefixed `RELAY_`:
//!
//! ```bash
//! export RELAY_DEFAULT_CONNECTION=db
//! export RELAY_CONNECTIONS__DB__DRIVER=database
//! export RELAY_CONNECTIONS__DB__URL=sqlite://jobs.db
//! export RELAY_WORKER_QUEUES=emails,default
//! export RELAY_WORKER_SHUTDOWN_TIMEOUT=30
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::{QueueError, QueueResult};

const ENV_PREFIX: &str = "RELAY_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Connection used when a dispatch names none
    pub default_connection: String,
    /// Queue used when neither the dispatch nor the job names one
    pub default_queue: String,
    pub connections: HashMap<String, ConnectionConfig>,
    pub worker: WorkerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_connection: "sync".to_string(),
            default_queue: "default".to_string(),
            connections: HashMap::new(),
            worker: WorkerConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_connection(mut self, name: impl Into<String>, connection: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), connection);
        self
    }

    pub fn with_default_connection(mut self, name: impl Into<String>) -> Self {
        self.default_connection = name.into();
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            QueueError::Configuration(format!("invalid queue config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> QueueResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build from `RELAY_`-prefixed key/value pairs; other keys are ignored
    pub fn from_vars<I, K, V>(vars: I) -> QueueResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(key) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();

            match key {
                "DEFAULT_CONNECTION" => config.default_connection = value,
                "DEFAULT_QUEUE" => config.default_queue = value,
                "WORKER_CONNECTION" => config.worker.connection = Some(value),
                "WORKER_QUEUES" => config.worker.queues = split_list(&value),
                "WORKER_SHUTDOWN_TIMEOUT" => config.worker.shutdown_timeout = parse_seconds(key, &value)?,
                "WORKER_POLL_INTERVAL" => config.worker.poll_interval = parse_seconds(key, &value)?,
                "WORKER_BASE_RETRY_BACKOFF" => {
                    config.worker.base_retry_backoff = parse_seconds(key, &value)?
                }
                "WORKER_MAX_RETRY_BACKOFF" => {
                    config.worker.max_retry_backoff = parse_seconds(key, &value)?
                }
                _ => {
                    // RELAY_CONNECTIONS__DB__URL → connections.db.options.url
                    let Some(rest) = key.strip_prefix("CONNECTIONS__") else {
                        continue;
                    };
                    let Some((name, option)) = rest.split_once("__") else {
                        return Err(QueueError::Configuration(format!(
                            "{}{} must look like {}CONNECTIONS__<NAME>__<OPTION>",
                            ENV_PREFIX, key, ENV_PREFIX
                        )));
                    };

                    let connection = config.connections.entry(name.to_lowercase()).or_default();
                    match option.to_lowercase().as_str() {
                        "driver" => connection.driver = value,
                        option => {
                            connection.options.insert(option.to_string(), env_value(value));
                        }
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.default_connection.is_empty() {
            return Err(QueueError::Configuration("default_connection is empty".to_string()));
        }
        if self.default_queue.is_empty() {
            return Err(QueueError::Configuration("default_queue is empty".to_string()));
        }
        if let Some((name, _)) = self.connections.iter().find(|(_, c)| c.driver.is_empty()) {
            return Err(QueueError::Configuration(format!(
                "connection `{}` does not name a driver",
                name
            )));
        }
        Ok(())
    }

    /// Queues a worker should poll, in order
    pub fn worker_queues(&self) -> Vec<String> {
        if self.worker.queues.is_empty() {
            vec![self.default_queue.clone()]
        } else {
            self.worker.queues.clone()
        }
    }
}

/// One named connection: a driver plus its options
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    pub driver: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl ConnectionConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Deserialize the options into a driver's typed options
    pub fn options<T: DeserializeOwned>(&self) -> QueueResult<T> {
        parse_options(&self.driver, &self.options)
    }
}

pub(crate) fn parse_options<T: DeserializeOwned>(driver: &str, options: &Map<String, Value>) -> QueueResult<T> {
    serde_json::from_value(Value::Object(options.clone())).map_err(|e| {
        QueueError::Configuration(format!("invalid options for driver `{}`: {}", driver, e))
    })
}

/// Worker process settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Connection to consume; the default connection when unset
    pub connection: Option<String>,
    pub queues: Vec<String>,
    #[serde(deserialize_with = "seconds")]
    pub shutdown_timeout: Duration,
    /// Pause after an empty poll or a failed pop
    #[serde(deserialize_with = "seconds")]
    pub poll_interval: Duration,
    #[serde(deserialize_with = "seconds")]
    pub base_retry_backoff: Duration,
    #[serde(deserialize_with = "seconds")]
    pub max_retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connection: None,
            queues: Vec::new(),
            shutdown_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            base_retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    /// `base * 2^attempts`, capped at the maximum
    pub fn retry_backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_retry_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_retry_backoff)
            .min(self.max_retry_backoff)
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
}

fn parse_seconds(key: &str, value: &str) -> QueueResult<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| {
            QueueError::Configuration(format!("{}{} must be a number of seconds, got `{}`", ENV_PREFIX, key, value))
        })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Numbers and booleans keep their type; everything else stays a string
fn env_value(value: String) -> Value {
    if let Ok(flag) = value.parse::<bool>() {
        return Value::Bool(flag);
    }
    if let Ok(number) = value.parse::<u64>() {
        return Value::from(number);
    }
    match value.parse::<f64>() {
        Ok(number) if number.is_finite() => Value::from(number),
        _ => Value::String(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.default_connection, "sync");
        assert_eq!(config.default_queue, "default");
        assert_eq!(config.worker.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.worker_queues(), vec!["default".to_string()]);
    }

    #[test]
    fn test_from_vars() {
        let config = QueueConfig::from_vars([
            ("RELAY_DEFAULT_CONNECTION", "db"),
            ("RELAY_CONNECTIONS__DB__DRIVER", "database"),
            ("RELAY_CONNECTIONS__DB__URL", "sqlite::memory:"),
            ("RELAY_CONNECTIONS__DB__CLAIM_TIMEOUT", "90"),
            ("RELAY_WORKER_QUEUES", "emails, default"),
            ("RELAY_WORKER_SHUTDOWN_TIMEOUT", "2.5"),
            ("HOME", "/root"),
        ])
        .unwrap();

        assert_eq!(config.default_connection, "db");
        assert_eq!(config.worker.queues, vec!["emails", "default"]);
        assert_eq!(config.worker.shutdown_timeout, Duration::from_millis(2500));

        let db = &config.connections["db"];
        assert_eq!(db.driver, "database");
        assert_eq!(db.options["url"], json!("sqlite::memory:"));
        assert_eq!(db.options["claim_timeout"], json!(90));
    }

    #[test]
    fn test_bad_env_values_are_configuration_errors() {
        let err = QueueConfig::from_vars([("RELAY_WORKER_POLL_INTERVAL", "soon")]).unwrap_err();
        assert!(err.is_configuration());

        let err = QueueConfig::from_vars([("RELAY_CONNECTIONS__DB", "x")]).unwrap_err();
        assert!(err.is_configuration());

        let err = QueueConfig::from_vars([("RELAY_CONNECTIONS__DB__URL", "x")]).unwrap_err();
        assert!(err.to_string().contains("does not name a driver"));
    }

    #[test]
    fn test_json_config() {
        let config: QueueConfig = serde_json::from_value(json!({
            "default_connection": "broker",
            "connections": {
                "broker": {
                    "driver": "broker",
                    "options": {"queue_url_prefix": "https://sqs.local/", "visibility_timeout": 60}
                }
            },
            "worker": {"queues": ["high", "low"], "shutdown_timeout": 3}
        }))
        .unwrap();

        assert_eq!(config.default_queue, "default");
        assert_eq!(config.worker.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.connections["broker"].options["visibility_timeout"], json!(60));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let worker = WorkerConfig {
            base_retry_backoff: Duration::from_secs(2),
            max_retry_backoff: Duration::from_secs(30),
            ..Default::default()
        };

        assert_eq!(worker.retry_backoff(0), Duration::from_secs(2));
        assert_eq!(worker.retry_backoff(3), Duration::from_secs(16));
        assert_eq!(worker.retry_backoff(4), Duration::from_secs(30));
        assert_eq!(worker.retry_backoff(64), Duration::from_secs(30));
    }
}
