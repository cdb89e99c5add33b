//! Append-only audit log: one row per tool call, file access, or blocked
//! attempt, keyed by task-id and API key. Same connection-mutex-plus-
//! spawn_blocking shape as the auth/permission/budget stores.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection};
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum AuditLogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// `record` is fire-and-forget so callers on the hot path never wait on a
/// write; `pending`/`drained` let shutdown wait for those writes to land
/// before the process exits, instead of dropping them mid-flight.
#[derive(Clone)]
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl AuditLog {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = db_path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, AuditLogError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    task_id TEXT,
                    api_key_prefix TEXT NOT NULL,
                    event TEXT NOT NULL,
                    detail TEXT NOT NULL
                );",
            )?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        })
    }

    pub fn record(&self, task_id: Option<String>, api_key_prefix: String, event: &str, detail: String) {
        let conn = self.conn.clone();
        let event = event.to_string();
        let pending = self.pending.clone();
        let drained = self.drained.clone();
        pending.fetch_add(1, Ordering::SeqCst);
        tokio::task::spawn(async move {
            let _ = tokio::task::spawn_blocking(move || -> Result<(), rusqlite::Error> {
                let guard = conn.lock().expect("audit log mutex poisoned");
                guard.execute(
                    "INSERT INTO audit_log (timestamp, task_id, api_key_prefix, event, detail)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![Utc::now().to_rfc3339(), task_id, api_key_prefix, event, detail],
                )?;
                Ok(())
            })
            .await;
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        });
    }

    /// Waits for every in-flight write to land, up to `timeout`. Called on
    /// shutdown so a `record` fired just before the drain signal isn't
    /// silently dropped when the process exits.
    pub async fn flush(&self, timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            // Register for notification before re-checking, so a completion
            // that lands between the check above and the wait below is never
            // missed (Notify only wakes waiters registered at notify time).
            let notified = self.drained.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_open_again_does_not_panic() {
        let log = AuditLog::open(":memory:").await.unwrap();
        log.record(Some("task-1".to_string()), "cc_abc123".to_string(), "tool_call", "{}".to_string());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
