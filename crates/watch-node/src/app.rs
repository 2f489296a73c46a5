//! Component wiring shared by the daemon and its tests.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use prometheus::Registry;
use tracing::{info, warn};
use watch_engine::{
    BalanceSource, BscScanClient, KeyLocks, LoggingSink, NotificationSink, ReconcilerMetrics,
    ReconciliationLoop, StorageHealth, TelegramSink, WatchRegistry,
};
use watch_storage::SubscriptionStore;

use crate::config::{AppConfig, NotifyKind};

/// Everything the daemon runs, assembled over one store.
#[derive(Clone)]
pub struct Components {
    pub store: SubscriptionStore,
    pub registry: Arc<WatchRegistry>,
    pub reconciler: Arc<ReconciliationLoop>,
    pub metrics: Registry,
    pub health: StorageHealth,
    pub started: Instant,
}

impl Components {
    /// Wire registry and loop over shared locks and health.
    pub fn assemble(
        cfg: &AppConfig,
        store: SubscriptionStore,
        source: Arc<dyn BalanceSource>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let locks = Arc::new(KeyLocks::new());
        let health = StorageHealth::new();
        let metrics = Registry::new();
        let reconciler_metrics =
            ReconcilerMetrics::register(&metrics).context("failed registering metrics")?;

        let registry = WatchRegistry::new(
            cfg.registry(),
            store.clone(),
            Arc::clone(&source),
            Arc::clone(&locks),
            health.clone(),
        );
        let reconciler = ReconciliationLoop::new(
            cfg.reconciler(),
            store.clone(),
            source,
            sink,
            locks,
            health.clone(),
        )
        .with_metrics(reconciler_metrics);

        Ok(Self {
            store,
            registry: Arc::new(registry),
            reconciler: Arc::new(reconciler),
            metrics,
            health,
            started: Instant::now(),
        })
    }

    /// Open the store and build the production collaborators from config.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let store = SubscriptionStore::open(&cfg.storage.path)
            .with_context(|| format!("failed opening store at {}", cfg.storage.path))?;
        info!(
            path = %cfg.storage.path,
            subscriptions = store.len(),
            "opened subscription store"
        );

        if cfg.upstream.api_key.is_none() {
            warn!("upstream.api_key is not set; the provider may rate-limit anonymous calls");
        }
        let source: Arc<dyn BalanceSource> =
            Arc::new(BscScanClient::new(cfg.bscscan()).context("invalid upstream config")?);

        let sink: Arc<dyn NotificationSink> = match cfg.notify.kind {
            NotifyKind::Log => Arc::new(LoggingSink),
            NotifyKind::Telegram => {
                Arc::new(TelegramSink::new(cfg.telegram()).context("invalid notify config")?)
            }
        };

        Self::assemble(cfg, store, source, sink)
    }
}
