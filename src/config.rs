//! Runtime configuration.
//!
//! Loaded once at startup from environment variables (with an optional
//! `.env` for local development) layered on top of an optional TOML file at
//! a well-known path. Env vars win over the file so operators can override
//! a single field without editing it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_address: String,
    pub database_path: PathBuf,
    pub log_level: String,
    pub log_dir: PathBuf,

    pub upstream_base_url: String,
    pub oauth_client_id: String,
    pub oauth_token_url: String,

    pub session_ttl_secs: u64,
    pub tee_buffer_bytes: usize,
    pub flush_interval_ms: u64,
    pub writer_batch_size: usize,
    pub writer_queue_capacity: usize,
    pub writer_shutdown_grace_secs: u64,

    pub forward_connect_timeout_secs: u64,
    pub forward_total_timeout_secs: u64,
    pub forward_idle_timeout_secs: u64,
    pub buffered_body_threshold_bytes: usize,

    pub request_count_reset_policy: RequestCountResetPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCountResetPolicy {
    ClearOnRateLimitReset,
    DailyBoundary,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: "0.0.0.0:3000".to_string(),
            database_path: PathBuf::from("relay.db"),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),

            upstream_base_url: "https://api.anthropic.com".to_string(),
            oauth_client_id: String::new(),
            oauth_token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),

            session_ttl_secs: 5 * 60 * 60,
            tee_buffer_bytes: 256 * 1024,
            flush_interval_ms: 100,
            writer_batch_size: 64,
            writer_queue_capacity: 4096,
            writer_shutdown_grace_secs: 5,

            forward_connect_timeout_secs: 10,
            forward_total_timeout_secs: 120,
            forward_idle_timeout_secs: 60,
            buffered_body_threshold_bytes: 1024 * 1024,

            request_count_reset_policy: RequestCountResetPolicy::ClearOnRateLimitReset,
        }
    }
}

impl Config {
    /// Loads configuration: defaults, then an optional TOML file at
    /// `RELAY_CONFIG_FILE` (default `./relay.toml`, silently skipped if
    /// absent), then environment variables, in ascending precedence.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        let config_path = env::var("RELAY_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("relay.toml"));
        if let Some(from_file) = Self::load_file(&config_path)? {
            config = from_file;
        }

        config.apply_env()?;
        config.validate().map_err(AppError::Config)?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Option<Config>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(Some(config))
    }

    fn apply_env(&mut self) -> Result<()> {
        macro_rules! env_string {
            ($field:expr, $name:literal) => {
                if let Ok(v) = env::var($name) {
                    $field = v;
                }
            };
        }
        macro_rules! env_parsed {
            ($field:expr, $name:literal) => {
                if let Ok(v) = env::var($name) {
                    $field = v.parse().context(concat!("invalid ", $name))?;
                }
            };
        }

        env_string!(self.server_address, "SERVER_ADDRESS");
        if let Ok(v) = env::var("DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        env_string!(self.log_level, "LOG_LEVEL");
        if let Ok(v) = env::var("LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        env_string!(self.upstream_base_url, "UPSTREAM_BASE_URL");
        env_string!(self.oauth_client_id, "OAUTH_CLIENT_ID");
        env_string!(self.oauth_token_url, "OAUTH_TOKEN_URL");

        env_parsed!(self.session_ttl_secs, "SESSION_TTL_SECS");
        env_parsed!(self.tee_buffer_bytes, "TEE_BUFFER_BYTES");
        env_parsed!(self.flush_interval_ms, "FLUSH_INTERVAL_MS");
        env_parsed!(self.writer_batch_size, "WRITER_BATCH_SIZE");
        env_parsed!(self.writer_queue_capacity, "WRITER_QUEUE_CAPACITY");
        env_parsed!(
            self.writer_shutdown_grace_secs,
            "WRITER_SHUTDOWN_GRACE_SECS"
        );
        env_parsed!(
            self.forward_connect_timeout_secs,
            "FORWARD_CONNECT_TIMEOUT_SECS"
        );
        env_parsed!(
            self.forward_total_timeout_secs,
            "FORWARD_TOTAL_TIMEOUT_SECS"
        );
        env_parsed!(
            self.forward_idle_timeout_secs,
            "FORWARD_IDLE_TIMEOUT_SECS"
        );
        env_parsed!(
            self.buffered_body_threshold_bytes,
            "BUFFERED_BODY_THRESHOLD_BYTES"
        );

        if let Ok(v) = env::var("REQUEST_COUNT_RESET_POLICY") {
            self.request_count_reset_policy = match v.as_str() {
                "daily_boundary" => RequestCountResetPolicy::DailyBoundary,
                _ => RequestCountResetPolicy::ClearOnRateLimitReset,
            };
        }

        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        if self.server_address.is_empty() {
            return Err("server_address cannot be empty".to_string());
        }
        if self.upstream_base_url.is_empty() {
            return Err("upstream_base_url cannot be empty".to_string());
        }
        if self.tee_buffer_bytes == 0 {
            return Err("tee_buffer_bytes must be greater than 0".to_string());
        }
        if self.writer_batch_size == 0 {
            return Err("writer_batch_size must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn writer_shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.writer_shutdown_grace_secs)
    }

    pub fn forward_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_connect_timeout_secs)
    }

    pub fn forward_total_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_total_timeout_secs)
    }

    pub fn forward_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_server_address() {
        let mut config = Config::default();
        config.server_address = String::new();
        assert!(config.validate().is_err());
    }
}
