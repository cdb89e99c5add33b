//! Typed configuration read from the closed `GATEWAY_*` environment
//! variable set. Unknown `GATEWAY_*` keys are ignored with a warning rather
//! than rejected, matching the teacher's `TANDEM_*` env handling.

use std::path::PathBuf;
use std::time::Duration;

use gw_observability::LogFormat;

const KNOWN_KEYS: &[&str] = &[
    "GATEWAY_HOST",
    "GATEWAY_PORT",
    "GATEWAY_STATE_DIR",
    "GATEWAY_MAX_WORKERS",
    "GATEWAY_MONITOR_INTERVAL_MS",
    "GATEWAY_MAX_QUEUE_DEPTH",
    "GATEWAY_UPSTREAM_BASE_URL",
    "GATEWAY_UPSTREAM_API_KEY",
    "GATEWAY_CLI_COMMAND",
    "GATEWAY_LOG_FORMAT",
    "GATEWAY_DEFAULT_MONTHLY_QUOTA_USD",
    "GATEWAY_DRAIN_DEADLINE_SECS",
];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub state_dir: PathBuf,
    pub max_workers: usize,
    pub max_queue_depth: usize,
    pub monitor_interval_ms: u64,
    pub upstream_base_url: String,
    pub upstream_api_key: String,
    pub cli_command: String,
    pub log_format: LogFormat,
    pub default_monthly_quota_usd: Option<f64>,
    pub drain_deadline: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        warn_on_unknown_keys();

        let port = env_parsed("GATEWAY_PORT", 8080u16)?;
        let max_workers = env_parsed("GATEWAY_MAX_WORKERS", 4usize)?;
        let max_queue_depth = env_parsed("GATEWAY_MAX_QUEUE_DEPTH", 64usize)?;
        let monitor_interval_ms = env_parsed("GATEWAY_MONITOR_INTERVAL_MS", 10u64)?;
        let drain_secs = env_parsed("GATEWAY_DRAIN_DEADLINE_SECS", 30u64)?;

        let log_format = std::env::var("GATEWAY_LOG_FORMAT")
            .ok()
            .map(|v| LogFormat::parse(&v))
            .unwrap_or(LogFormat::Json);

        let default_monthly_quota_usd = match std::env::var("GATEWAY_DEFAULT_MONTHLY_QUOTA_USD") {
            Ok(raw) => Some(raw.parse::<f64>().map_err(|_| ConfigError::InvalidValue {
                key: "GATEWAY_DEFAULT_MONTHLY_QUOTA_USD",
                value: raw,
            })?),
            Err(_) => None,
        };

        Ok(Self {
            host: std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port,
            state_dir: std::env::var("GATEWAY_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./gateway-state")),
            max_workers,
            max_queue_depth,
            monitor_interval_ms,
            upstream_base_url: std::env::var("GATEWAY_UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            upstream_api_key: std::env::var("GATEWAY_UPSTREAM_API_KEY").unwrap_or_default(),
            cli_command: std::env::var("GATEWAY_CLI_COMMAND").unwrap_or_else(|_| "claude".to_string()),
            log_format,
            default_monthly_quota_usd,
            drain_deadline: Duration::from_secs(drain_secs),
        })
    }

    /// Configuration is invalid (exit code 2) when a worker pool with zero
    /// capacity would accept no work at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "GATEWAY_MAX_WORKERS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn warn_on_unknown_keys() {
    for (key, _) in std::env::vars() {
        if key.starts_with("GATEWAY_") && !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key, "unrecognized GATEWAY_ environment variable, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_fails_validation() {
        let mut config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            state_dir: PathBuf::from("."),
            max_workers: 0,
            max_queue_depth: 10,
            monitor_interval_ms: 10,
            upstream_base_url: String::new(),
            upstream_api_key: String::new(),
            cli_command: "claude".to_string(),
            log_format: LogFormat::Json,
            default_monthly_quota_usd: None,
            drain_deadline: Duration::from_secs(1),
        };
        assert!(config.validate().is_err());
        config.max_workers = 1;
        assert!(config.validate().is_ok());
    }
}
