//! Persistent API key records (C2): lookup, revoke, per-key rate limiting.
//!
//! Backed by an embedded SQLite database. Every query runs inside
//! `spawn_blocking` so callers on the async reactor never block on the
//! connection mutex or on disk I/O, per the async/blocking split rule.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KEY_PREFIX: &str = "cc_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub rate_limit_per_min: u32,
    pub last_window_start: DateTime<Utc>,
    pub request_count_in_window: u32,
}

impl ApiKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("key not found")]
    NotFound,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of a rate-limit check against the current one-minute window.
#[derive(Debug, Clone, Copy)]
pub enum RateLimitDecision {
    Allowed,
    Exceeded { retry_after_s: u64 },
}

#[derive(Clone)]
pub struct AuthStore {
    conn: Arc<Mutex<Connection>>,
}

impl AuthStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = db_path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, AuthError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let conn = Connection::open(path)?;
            conn.execute("PRAGMA journal_mode = WAL", [])?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS api_keys (
                    key TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    revoked_at TEXT,
                    rate_limit_per_min INTEGER NOT NULL,
                    last_window_start TEXT NOT NULL,
                    request_count_in_window INTEGER NOT NULL
                );",
            )?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Generates a new opaque key with the canonical `cc_` prefix and persists it.
    pub async fn create_key(
        &self,
        project_id: String,
        rate_limit_per_min: u32,
    ) -> Result<ApiKeyRecord, AuthError> {
        let key = generate_key();
        let now = Utc::now();
        let record = ApiKeyRecord {
            key,
            project_id,
            created_at: now,
            revoked_at: None,
            rate_limit_per_min,
            last_window_start: now,
            request_count_in_window: 0,
        };
        let conn = self.conn.clone();
        let insert = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), AuthError> {
            let conn = conn.lock().expect("auth db mutex poisoned");
            conn.execute(
                "INSERT INTO api_keys (key, project_id, created_at, revoked_at, rate_limit_per_min, last_window_start, request_count_in_window)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    insert.key,
                    insert.project_id,
                    insert.created_at.to_rfc3339(),
                    insert.revoked_at.map(|t| t.to_rfc3339()),
                    insert.rate_limit_per_min,
                    insert.last_window_start.to_rfc3339(),
                    insert.request_count_in_window,
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(record)
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<ApiKeyRecord>, AuthError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ApiKeyRecord>, AuthError> {
            let conn = conn.lock().expect("auth db mutex poisoned");
            let record = conn
                .query_row(
                    "SELECT key, project_id, created_at, revoked_at, rate_limit_per_min, last_window_start, request_count_in_window
                     FROM api_keys WHERE key = ?1",
                    params![key],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    /// Revokes a key in place. Revoked keys are never deleted (spec invariant:
    /// revoked keys must fail admission immediately regardless of cache state).
    pub async fn revoke(&self, key: &str) -> Result<(), AuthError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let affected = tokio::task::spawn_blocking(move || -> Result<usize, AuthError> {
            let conn = conn.lock().expect("auth db mutex poisoned");
            let affected = conn.execute(
                "UPDATE api_keys SET revoked_at = ?1 WHERE key = ?2 AND revoked_at IS NULL",
                params![Utc::now().to_rfc3339(), key],
            )?;
            Ok(affected)
        })
        .await??;
        if affected == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    /// Atomically checks and advances the sliding one-minute rate-limit window.
    /// The read-modify-write happens under the same connection mutex lock so
    /// no two admissions can race on the same key's counter.
    pub async fn check_and_increment_rate_limit(
        &self,
        key: &str,
    ) -> Result<RateLimitDecision, AuthError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<RateLimitDecision, AuthError> {
            let conn = conn.lock().expect("auth db mutex poisoned");
            let (limit, window_start, count): (u32, String, u32) = conn.query_row(
                "SELECT rate_limit_per_min, last_window_start, request_count_in_window FROM api_keys WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let window_start: DateTime<Utc> = window_start
                .parse()
                .unwrap_or_else(|_| Utc::now());
            let now = Utc::now();
            let window_expired = (now - window_start).num_seconds() >= 60;

            let (new_window_start, new_count) = if window_expired {
                (now, 1)
            } else {
                (window_start, count + 1)
            };

            if !window_expired && count >= limit {
                let retry_after_s = (60 - (now - window_start).num_seconds()).max(1) as u64;
                return Ok(RateLimitDecision::Exceeded { retry_after_s });
            }

            conn.execute(
                "UPDATE api_keys SET last_window_start = ?1, request_count_in_window = ?2 WHERE key = ?3",
                params![new_window_start.to_rfc3339(), new_count, key],
            )?;
            Ok(RateLimitDecision::Allowed)
        })
        .await?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    let created_at: String = row.get(2)?;
    let revoked_at: Option<String> = row.get(3)?;
    let last_window_start: String = row.get(5)?;
    Ok(ApiKeyRecord {
        key: row.get(0)?,
        project_id: row.get(1)?,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        revoked_at: revoked_at.and_then(|s| s.parse().ok()),
        rate_limit_per_min: row.get(4)?,
        last_window_start: last_window_start.parse().unwrap_or_else(|_| Utc::now()),
        request_count_in_window: row.get(6)?,
    })
}

fn generate_key() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..32)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{KEY_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> AuthStore {
        AuthStore::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_lookup_round_trips() {
        let store = store().await;
        let created = store.create_key("proj-a".into(), 60).await.unwrap();
        assert!(created.key.starts_with(KEY_PREFIX));
        let found = store.lookup(&created.key).await.unwrap().unwrap();
        assert_eq!(found.project_id, "proj-a");
        assert!(!found.is_revoked());
    }

    #[tokio::test]
    async fn revoke_is_immediate_and_permanent() {
        let store = store().await;
        let created = store.create_key("proj-a".into(), 60).await.unwrap();
        store.revoke(&created.key).await.unwrap();
        let found = store.lookup(&created.key).await.unwrap().unwrap();
        assert!(found.is_revoked());
        // revoking again is a no-op failure, not a panic or double free of semantics
        assert!(store.revoke(&created.key).await.is_err());
    }

    #[tokio::test]
    async fn rate_limit_trips_after_the_configured_count() {
        let store = store().await;
        let created = store.create_key("proj-a".into(), 2).await.unwrap();
        assert!(matches!(
            store
                .check_and_increment_rate_limit(&created.key)
                .await
                .unwrap(),
            RateLimitDecision::Allowed
        ));
        assert!(matches!(
            store
                .check_and_increment_rate_limit(&created.key)
                .await
                .unwrap(),
            RateLimitDecision::Allowed
        ));
        match store
            .check_and_increment_rate_limit(&created.key)
            .await
            .unwrap()
        {
            RateLimitDecision::Exceeded { retry_after_s } => assert!(retry_after_s > 0),
            RateLimitDecision::Allowed => panic!("expected the third request in-window to trip"),
        }
    }

    #[tokio::test]
    async fn unknown_key_lookup_returns_none() {
        let store = store().await;
        assert!(store.lookup("cc_doesnotexist").await.unwrap().is_none());
    }
}
