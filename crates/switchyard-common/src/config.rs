//! Configuration for switchyard

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name identifying this instance, used for per-instance cron locks
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Key-value store configuration
    #[serde(default)]
    pub valkey: KvConfig,

    /// Outbound HTTP configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_instance_name() -> String {
    hostname()
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "switchyard".to_string())
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    36
}

fn default_min_connections() -> u32 {
    4
}

/// Key-value store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Connection URL
    #[serde(default = "default_kv_url")]
    pub url: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: default_kv_url(),
        }
    }
}

fn default_kv_url() -> String {
    "redis://localhost:6379/15".to_string()
}

/// Outbound HTTP configuration, shared by all ticket providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Maximum attempts per request (1 = no retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between retries in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_http_timeout() -> u64 {
    30
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers consuming the batch queue
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,

    /// Number of workers consuming the handler queue
    #[serde(default = "default_handler_workers")]
    pub handler_workers: usize,

    /// How long in-flight tasks get to finish on shutdown, in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_workers: default_batch_workers(),
            handler_workers: default_handler_workers(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_batch_workers() -> usize {
    4
}

fn default_handler_workers() -> usize {
    32
}

fn default_shutdown_grace() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./switchyard.toml"),
            std::path::PathBuf::from("/etc/switchyard/switchyard.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
instance_name = "switchyard-1"

[database]
url = "postgres://localhost/switchyard"

[valkey]
url = "redis://localhost:6379/10"

[http]
max_attempts = 5

[workers]
batch_workers = 2
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.instance_name, "switchyard-1");
        assert_eq!(config.database.url, "postgres://localhost/switchyard");
        assert_eq!(config.database.max_connections, 36);
        assert_eq!(config.valkey.url, "redis://localhost:6379/10");
        assert_eq!(config.http.max_attempts, 5);
        assert_eq!(config.http.backoff_ms, 1000);
        assert_eq!(config.workers.batch_workers, 2);
        assert_eq!(config.workers.handler_workers, 32);
    }

    #[test]
    fn test_defaults() {
        let toml = r#"
[database]
url = "postgres://localhost/switchyard"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.http.max_attempts, 3);
        assert_eq!(config.workers.shutdown_grace_secs, 30);
        assert_eq!(config.logging.level, "info");
    }
}
