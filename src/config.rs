//! Configuration management for taskpilot.
//!
//! Configuration can be set via environment variables:
//! - `DB_PATH` - Optional. Task store location. Defaults to `tasks.db`.
//! - `MAX_CONCURRENT` - Optional. Scheduler concurrency bound. Defaults to `3`.
//! - `BASE_REPO` - Optional. Base git repository tasks branch from. Defaults to `/home/ubuntu/project`.
//! - `LOG_DIR` - Optional. Per-task raw log destination. Defaults to `/home/ubuntu/task-logs`.
//! - `POLL_INTERVAL` - Optional. Scheduler cadence in seconds. Defaults to `2.0`.
//! - `API_CREDENTIAL` - Optional. When set, mutating endpoints require a matching `x-api-key` header.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `AGENT_CLI` - Optional. Path to the agent CLI binary. Defaults to `claude`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Task store location
    pub db_path: PathBuf,

    /// Maximum number of tasks running at once
    pub max_concurrent: usize,

    /// Base git repository that per-task workspaces branch from
    pub base_repo: PathBuf,

    /// Directory for per-task raw agent logs
    pub log_dir: PathBuf,

    /// Scheduler poll cadence
    pub poll_interval: Duration,

    /// Shared credential required on mutating endpoints (None = open)
    pub api_credential: Option<String>,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Agent CLI binary invoked per task
    pub agent_cli: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tasks.db"));

        let max_concurrent = std::env::var("MAX_CONCURRENT")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("MAX_CONCURRENT".to_string(), format!("{}", e)))?;

        let base_repo = std::env::var("BASE_REPO")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/home/ubuntu/project"));

        let log_dir = std::env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/home/ubuntu/task-logs"));

        let poll_secs: f64 = std::env::var("POLL_INTERVAL")
            .unwrap_or_else(|_| "2.0".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("POLL_INTERVAL".to_string(), format!("{}", e)))?;
        if !poll_secs.is_finite() || poll_secs <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "POLL_INTERVAL".to_string(),
                "must be a positive number of seconds".to_string(),
            ));
        }

        let api_credential = std::env::var("API_CREDENTIAL")
            .ok()
            .filter(|s| !s.is_empty());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let agent_cli = std::env::var("AGENT_CLI").unwrap_or_else(|_| "claude".to_string());

        Ok(Self {
            db_path,
            max_concurrent,
            base_repo,
            log_dir,
            poll_interval: Duration::from_secs_f64(poll_secs),
            api_credential,
            host,
            port,
            agent_cli,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(db_path: PathBuf, base_repo: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            db_path,
            max_concurrent: 3,
            base_repo,
            log_dir,
            poll_interval: Duration::from_secs(2),
            api_credential: None,
            host: "127.0.0.1".to_string(),
            port: 3000,
            agent_cli: "claude".to_string(),
        }
    }
}
