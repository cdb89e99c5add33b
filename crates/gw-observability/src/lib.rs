use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// One structured log line for a request-scoped event. Every field besides
/// `event`/`component` is optional so call sites only populate what applies.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub request_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub api_key_prefix: Option<&'a str>,
    pub model: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> GatewayEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            request_id: None,
            project_id: None,
            task_id: None,
            api_key_prefix: None,
            model: None,
            status: None,
            error_code: None,
            detail: None,
        }
    }
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Returns the first 10 characters of an API key, enough for correlation in
/// logs without ever writing the secret itself.
pub fn key_prefix(key: &str) -> String {
    key.chars().take(10).collect()
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} sha256={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn emit_event(level: Level, event: GatewayEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "gateway.event",
            component = event.component,
            event = event.event,
            request_id = event.request_id.unwrap_or(""),
            project_id = event.project_id.unwrap_or(""),
            task_id = event.task_id.unwrap_or(""),
            api_key_prefix = event.api_key_prefix.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "gateway_event"
        ),
        Level::WARN => tracing::warn!(
            target: "gateway.event",
            component = event.component,
            event = event.event,
            request_id = event.request_id.unwrap_or(""),
            project_id = event.project_id.unwrap_or(""),
            task_id = event.task_id.unwrap_or(""),
            api_key_prefix = event.api_key_prefix.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "gateway_event"
        ),
        _ => tracing::info!(
            target: "gateway.event",
            component = event.component,
            event = event.event,
            request_id = event.request_id.unwrap_or(""),
            project_id = event.project_id.unwrap_or(""),
            task_id = event.task_id.unwrap_or(""),
            api_key_prefix = event.api_key_prefix.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "gateway_event"
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "compact" | "text" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Initializes the global tracing subscriber: JSON or compact lines to the
/// console plus a daily-rotated JSON file under `logs_dir`, filtered by
/// `RUST_LOG` (default `info`).
pub fn init_logging(
    logs_dir: &Path,
    retention_days: u64,
    console_format: LogFormat,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("gateway")
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    match console_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_ansi(false))
                .try_init()
                .ok();
        }
        LogFormat::Compact => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_target(true)
                        .with_ansi(true),
                )
                .try_init()
                .ok();
        }
    }

    let info = LoggingInitInfo {
        logs_dir: logs_dir.display().to_string(),
        prefix: "gateway".to_string(),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = "gateway.";

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: gateway.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(prefix).trim_end_matches(".jsonl");

        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "super-secret-token-123";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len="));
        assert!(!redacted.contains("super-secret-token-123"));
    }

    #[test]
    fn key_prefix_truncates() {
        assert_eq!(key_prefix("cc_abcdefghijklmnop"), "cc_abcdefg");
        assert_eq!(key_prefix("short"), "short");
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/gateway");
        let logs = canonical_logs_dir_from_root(&root);
        assert_eq!(logs, PathBuf::from("/tmp/gateway").join("logs"));
    }

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("unknown"), LogFormat::Json);
    }
}
