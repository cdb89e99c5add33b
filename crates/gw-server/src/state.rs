use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use gw_auth::AuthStore;
use gw_budget::BudgetLedger;
use gw_orchestrator::AgenticExecutor;
use gw_permissions::PermissionStore;
use gw_pool::WorkerPool;
use gw_providers::{DirectProvider, MessagesApiProvider};
use gw_registry::CapabilityRegistry;
use tokio::sync::broadcast;

use crate::audit::AuditLog;
use crate::config::GatewayConfig;

/// Fires once when the server starts draining, so every open `/v1/stream`
/// session can close with a going-away frame instead of being torn down
/// silently once its subprocess happens to finish.
#[derive(Clone)]
pub struct ShutdownSignal(broadcast::Sender<()>);

impl ShutdownSignal {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self(tx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.0.subscribe()
    }

    fn fire(&self) {
        let _ = self.0.send(());
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub auth: AuthStore,
    pub permissions: PermissionStore,
    pub budget: BudgetLedger,
    pub pool: WorkerPool,
    pub direct_provider: Arc<dyn DirectProvider>,
    pub orchestrator: Arc<AgenticExecutor>,
    pub registry: Arc<CapabilityRegistry>,
    pub audit: AuditLog,
    pub shutdown: ShutdownSignal,
    started_at: Instant,
    ready: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
}

impl AppState {
    pub async fn bootstrap(config: GatewayConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;
        let auth = AuthStore::open(config.state_dir.join("auth.sqlite3")).await?;
        let permissions = PermissionStore::open(config.state_dir.join("permissions.sqlite3")).await?;
        let budget = BudgetLedger::open_with_default_quota(
            config.state_dir.join("budget.sqlite3"),
            config.default_monthly_quota_usd,
        )
        .await?;
        let audit = AuditLog::open(config.state_dir.join("audit.sqlite3")).await?;

        let pool = WorkerPool::with_monitor_interval(
            config.max_workers,
            config.max_queue_depth,
            config.cli_command.clone(),
            std::time::Duration::from_millis(config.monitor_interval_ms),
        );
        let direct_provider: Arc<dyn DirectProvider> = Arc::new(MessagesApiProvider::new(
            config.upstream_base_url.clone(),
            config.upstream_api_key.clone(),
        ));
        let orchestrator = Arc::new(AgenticExecutor::new(
            pool.clone(),
            gw_pricing::rate_for_alias(gw_types::ModelAlias::Sonnet),
        ));
        let registry = Arc::new(CapabilityRegistry::builtin());

        Ok(Self {
            config: Arc::new(config),
            auth,
            permissions,
            budget,
            pool,
            direct_provider,
            orchestrator,
            registry,
            audit,
            shutdown: ShutdownSignal::new(),
            started_at: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_draining()
    }

    /// Flips the draining flag and wakes every open streaming session so it
    /// can close with a going-away frame instead of running until its
    /// in-flight subprocess happens to finish.
    pub fn mark_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.shutdown.fire();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
