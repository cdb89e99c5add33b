//! Budget ledger (C4): per-project monthly token quota and append-only cost
//! ledger, with pre-commit reservations that prevent concurrent over-commit.
//!
//! Reservations live in memory only (the fast path); they are guarded by the
//! same mutex as the SQLite connection so a `reserve` can never observe a
//! `record`/`refund` mid-flight, and vice versa — that's what keeps the
//! quota invariant (`recorded + outstanding <= quota`) atomic across both.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Utc};
use gw_types::UsageSource;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("monthly budget exceeded for project {project_id}")]
    Exceeded { project_id: String },
    #[error("unknown reservation handle")]
    UnknownReservation,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct ReservationHandle(pub Uuid);

#[derive(Debug, Clone)]
struct Reservation {
    project_id: String,
    amount_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct UsageAggregate {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub request_count: u64,
}

struct Inner {
    conn: Connection,
    outstanding: HashMap<Uuid, Reservation>,
    default_quota_usd: Option<f64>,
}

#[derive(Clone)]
pub struct BudgetLedger {
    inner: Arc<Mutex<Inner>>,
}

impl BudgetLedger {
    /// Opens the ledger with no default quota: a project implicitly created
    /// by first reference (spec.md §3) is unmetered until `set_quota` gives
    /// it an explicit cap.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, BudgetError> {
        Self::open_with_default_quota(db_path, None).await
    }

    /// Opens the ledger with `default_quota_usd` applied to any project that
    /// has never had `set_quota` called on it explicitly — the
    /// `GATEWAY_DEFAULT_MONTHLY_QUOTA_USD` seed for implicitly-created
    /// projects.
    pub async fn open_with_default_quota(
        db_path: impl AsRef<Path>,
        default_quota_usd: Option<f64>,
    ) -> Result<Self, BudgetError> {
        let path = db_path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, BudgetError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let conn = Connection::open(path)?;
            conn.execute("PRAGMA journal_mode = WAL", [])?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS budgets (
                    project_id TEXT PRIMARY KEY,
                    monthly_quota_usd REAL
                );
                CREATE TABLE IF NOT EXISTS usage_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    model TEXT NOT NULL,
                    input_tokens INTEGER NOT NULL,
                    output_tokens INTEGER NOT NULL,
                    cost_usd REAL NOT NULL,
                    source TEXT NOT NULL
                );",
            )?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                outstanding: HashMap::new(),
                default_quota_usd,
            })),
        })
    }

    /// Sets (or clears, with `None`) a project's monthly token-spend quota.
    pub async fn set_quota(
        &self,
        project_id: &str,
        monthly_quota_usd: Option<f64>,
    ) -> Result<(), BudgetError> {
        let inner = self.inner.clone();
        let project_id = project_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), BudgetError> {
            let guard = inner.lock().expect("budget mutex poisoned");
            guard.conn.execute(
                "INSERT INTO budgets (project_id, monthly_quota_usd) VALUES (?1, ?2)
                 ON CONFLICT(project_id) DO UPDATE SET monthly_quota_usd = excluded.monthly_quota_usd",
                params![project_id, monthly_quota_usd],
            )?;
            Ok(())
        })
        .await?
    }

    /// Attempts to reserve `estimated_cost` against the project's monthly
    /// quota. Succeeds unconditionally when the project has no quota set.
    pub async fn reserve(
        &self,
        project_id: &str,
        estimated_cost: f64,
    ) -> Result<ReservationHandle, BudgetError> {
        let inner = self.inner.clone();
        let project_id = project_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<ReservationHandle, BudgetError> {
            let mut guard = inner.lock().expect("budget mutex poisoned");

            // `None` here means "no row yet" (apply the configured default);
            // `Some(None)` means a row exists with an explicit NULL (the
            // project was deliberately set unlimited via `set_quota`).
            let row: Option<Option<f64>> = guard
                .conn
                .query_row(
                    "SELECT monthly_quota_usd FROM budgets WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .optional()?;
            let quota: Option<f64> = match row {
                Some(explicit) => explicit,
                None => guard.default_quota_usd,
            };

            if let Some(quota) = quota {
                let period = current_period();
                let committed: f64 = guard
                    .conn
                    .query_row(
                        "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records
                         WHERE project_id = ?1 AND substr(timestamp, 1, 7) = ?2",
                        params![project_id, period],
                        |row| row.get(0),
                    )
                    .unwrap_or(0.0);
                let outstanding: f64 = guard
                    .outstanding
                    .values()
                    .filter(|r| r.project_id == project_id)
                    .map(|r| r.amount_usd)
                    .sum();

                if committed + outstanding + estimated_cost > quota {
                    return Err(BudgetError::Exceeded { project_id });
                }
            }

            let id = Uuid::new_v4();
            guard.outstanding.insert(
                id,
                Reservation {
                    project_id,
                    amount_usd: estimated_cost,
                },
            );
            Ok(ReservationHandle(id))
        })
        .await?
    }

    /// Commits the actual cost of a completed request and releases its
    /// reservation. Must be called (or `refund` called) exactly once per
    /// `reserve`.
    pub async fn record(
        &self,
        handle: ReservationHandle,
        actual_cost: f64,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
        source: UsageSource,
    ) -> Result<(), BudgetError> {
        let inner = self.inner.clone();
        let model = model.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), BudgetError> {
            let mut guard = inner.lock().expect("budget mutex poisoned");
            let reservation = guard
                .outstanding
                .remove(&handle.0)
                .ok_or(BudgetError::UnknownReservation)?;
            let source_tag = match source {
                UsageSource::Direct => "direct",
                UsageSource::Cli => "cli",
                UsageSource::Agentic => "agentic",
            };
            guard.conn.execute(
                "INSERT INTO usage_records (project_id, timestamp, model, input_tokens, output_tokens, cost_usd, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    reservation.project_id,
                    Utc::now().to_rfc3339(),
                    model,
                    input_tokens,
                    output_tokens,
                    actual_cost,
                    source_tag,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Releases a reservation without committing any cost — used on every
    /// exit path that didn't produce billable usage (denied, failed, refunded).
    pub async fn refund(&self, handle: ReservationHandle) -> Result<(), BudgetError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<(), BudgetError> {
            let mut guard = inner.lock().expect("budget mutex poisoned");
            guard
                .outstanding
                .remove(&handle.0)
                .ok_or(BudgetError::UnknownReservation)?;
            Ok(())
        })
        .await?
    }

    pub async fn outstanding_count(&self) -> usize {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.lock().expect("budget mutex poisoned").outstanding.len())
            .await
            .unwrap_or(0)
    }

    /// Aggregated usage for a project over the given `YYYY-MM` period.
    pub async fn usage(&self, project_id: &str, period: &str) -> Result<UsageAggregate, BudgetError> {
        let inner = self.inner.clone();
        let project_id = project_id.to_string();
        let period = period.to_string();
        tokio::task::spawn_blocking(move || -> Result<UsageAggregate, BudgetError> {
            let guard = inner.lock().expect("budget mutex poisoned");
            let row = guard.conn.query_row(
                "SELECT COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0), COALESCE(SUM(cost_usd),0.0), COUNT(*)
                 FROM usage_records WHERE project_id = ?1 AND substr(timestamp, 1, 7) = ?2",
                params![project_id, period],
                |row| {
                    Ok(UsageAggregate {
                        total_input_tokens: row.get(0)?,
                        total_output_tokens: row.get(1)?,
                        total_cost_usd: row.get(2)?,
                        request_count: row.get(3)?,
                    })
                },
            )?;
            Ok(row)
        })
        .await?
    }
}

fn current_period() -> String {
    period_of(Utc::now())
}

fn period_of(ts: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_record_round_trip_is_committed() {
        let ledger = BudgetLedger::open(":memory:").await.unwrap();
        ledger.set_quota("proj-a", Some(10.0)).await.unwrap();
        let handle = ledger.reserve("proj-a", 1.0).await.unwrap();
        ledger
            .record(handle, 0.8, 1000, 1000, "sonnet", UsageSource::Direct)
            .await
            .unwrap();
        assert_eq!(ledger.outstanding_count().await, 0);
        let usage = ledger.usage("proj-a", &current_period()).await.unwrap();
        assert!((usage.total_cost_usd - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reserve_over_quota_is_rejected() {
        let ledger = BudgetLedger::open(":memory:").await.unwrap();
        ledger.set_quota("proj-a", Some(0.10)).await.unwrap();
        assert!(ledger.reserve("proj-a", 0.05).await.is_ok());
        // second reservation would push outstanding past quota
        assert!(matches!(
            ledger.reserve("proj-a", 0.10).await,
            Err(BudgetError::Exceeded { .. })
        ));
    }

    #[tokio::test]
    async fn refund_releases_without_committing_cost() {
        let ledger = BudgetLedger::open(":memory:").await.unwrap();
        ledger.set_quota("proj-a", Some(0.10)).await.unwrap();
        let handle = ledger.reserve("proj-a", 0.05).await.unwrap();
        ledger.refund(handle).await.unwrap();
        assert_eq!(ledger.outstanding_count().await, 0);
        let usage = ledger.usage("proj-a", &current_period()).await.unwrap();
        assert_eq!(usage.request_count, 0);
        // quota is free again
        assert!(ledger.reserve("proj-a", 0.10).await.is_ok());
    }

    #[tokio::test]
    async fn no_quota_means_unlimited() {
        let ledger = BudgetLedger::open(":memory:").await.unwrap();
        assert!(ledger.reserve("proj-unmetered", 1_000_000.0).await.is_ok());
    }

    #[tokio::test]
    async fn default_quota_applies_to_a_project_with_no_explicit_row() {
        let ledger = BudgetLedger::open_with_default_quota(":memory:", Some(0.10))
            .await
            .unwrap();
        assert!(ledger.reserve("proj-new", 0.05).await.is_ok());
        assert!(matches!(
            ledger.reserve("proj-new", 0.10).await,
            Err(BudgetError::Exceeded { .. })
        ));
    }

    #[tokio::test]
    async fn explicit_unlimited_quota_overrides_the_configured_default() {
        let ledger = BudgetLedger::open_with_default_quota(":memory:", Some(0.01))
            .await
            .unwrap();
        ledger.set_quota("proj-unlimited", None).await.unwrap();
        assert!(ledger.reserve("proj-unlimited", 1_000_000.0).await.is_ok());
    }

    #[tokio::test]
    async fn record_or_refund_on_unknown_handle_errors() {
        let ledger = BudgetLedger::open(":memory:").await.unwrap();
        let bogus = ReservationHandle(Uuid::new_v4());
        assert!(ledger.refund(bogus).await.is_err());
    }
}
