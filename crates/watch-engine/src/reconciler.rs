//! Periodic balance reconciliation.
//!
//! Each cycle enumerates every subscription, looks up the current balance
//! and, on an exact integer mismatch, notifies the subscriber and then
//! persists the new value. Notification is at-most-once: a failed delivery
//! is logged and the new balance is stored anyway.
//!
//! Per-record failures (lookup errors, timeouts, storage errors on one key)
//! are contained to that record and retried on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use watch_core::{now_ms, NotificationEvent, SubscriptionRecord, DEFAULT_OBSERVATION_WINDOW_MS};
use watch_storage::SubscriptionStore;

use crate::balance::{BalanceSource, TimeoutSource};
use crate::health::StorageHealth;
use crate::locks::KeyLocks;
use crate::metrics::ReconcilerMetrics;
use crate::notify::NotificationSink;

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between cycles.
    pub interval: Duration,
    /// Upper bound on one balance lookup.
    pub fetch_timeout: Duration,
    /// Upper bound on one notification delivery.
    pub notify_timeout: Duration,
    /// Subscriptions older than this are removed; `0` disables expiry.
    pub observation_window_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(10),
            observation_window_ms: DEFAULT_OBSERVATION_WINDOW_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
}

/// Counts from one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records returned by the snapshot.
    pub total: u64,
    /// Records whose balance was fetched successfully.
    pub checked: u64,
    /// Balance changes detected and persisted.
    pub changed: u64,
    pub unchanged: u64,
    pub fetch_failed: u64,
    /// Records removed by another caller while the cycle ran.
    pub vanished: u64,
    /// Records replaced by another caller between lookup and write.
    pub superseded: u64,
    pub expired: u64,
    pub notify_failed: u64,
    pub storage_failed: u64,
    pub started_at_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(CycleReport),
    /// A cycle was already running; this tick was dropped.
    Skipped,
}

pub struct ReconciliationLoop {
    config: ReconcilerConfig,
    store: SubscriptionStore,
    source: Arc<dyn BalanceSource>,
    sink: Arc<dyn NotificationSink>,
    locks: Arc<KeyLocks>,
    health: StorageHealth,
    metrics: Option<ReconcilerMetrics>,
    running: AtomicBool,
    last_report: Mutex<Option<CycleReport>>,
}

/// Clears the running flag even if the cycle future is dropped mid-way.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReconciliationLoop {
    pub fn new(
        config: ReconcilerConfig,
        store: SubscriptionStore,
        source: Arc<dyn BalanceSource>,
        sink: Arc<dyn NotificationSink>,
        locks: Arc<KeyLocks>,
        health: StorageHealth,
    ) -> Self {
        let source: Arc<dyn BalanceSource> =
            Arc::new(TimeoutSource::new(source, config.fetch_timeout));
        Self {
            config,
            store,
            source,
            sink,
            locks,
            health,
            metrics: None,
            running: AtomicBool::new(false),
            last_report: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: ReconcilerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        if self.running.load(Ordering::SeqCst) {
            LoopState::Polling
        } else {
            LoopState::Idle
        }
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run one cycle unless another is in progress.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconciliation still running; tick skipped");
            if let Some(m) = &self.metrics {
                m.skipped_ticks.inc();
            }
            return TickOutcome::Skipped;
        }
        let _running = RunningGuard(&self.running);

        let report = self.run_cycle().await;
        if let Some(m) = &self.metrics {
            m.observe_cycle(&report);
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        TickOutcome::Completed(report)
    }

    async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let now = now_ms();
        let mut report = CycleReport {
            started_at_ms: now,
            ..CycleReport::default()
        };

        let records = match self.store.list_all() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to enumerate subscriptions");
                self.health.mark_degraded(&e.to_string());
                report.storage_failed += 1;
                return report;
            }
        };
        report.total = u64::try_from(records.len()).unwrap_or(u64::MAX);
        if !records.is_empty() {
            debug!(count = records.len(), "reconciling subscriptions");
        }

        for record in records {
            if record.is_expired(now, self.config.observation_window_ms) {
                self.expire(&record, now, &mut report).await;
                continue;
            }
            self.reconcile_one(&record, &mut report).await;
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if report.changed > 0 || report.fetch_failed > 0 || report.expired > 0 {
            info!(
                total = report.total,
                changed = report.changed,
                fetch_failed = report.fetch_failed,
                expired = report.expired,
                duration_ms = report.duration_ms,
                "reconciliation cycle finished"
            );
        }
        report
    }

    async fn reconcile_one(&self, snapshot: &SubscriptionRecord, report: &mut CycleReport) {
        let key = snapshot.key();

        // Lookup runs outside the key lock so a slow upstream never blocks
        // subscribe/unsubscribe on the same key.
        let fetched = match self.source.fetch(&snapshot.address).await {
            Ok(balance) => balance,
            Err(e) => {
                debug!(key = %key, error = %e, "balance lookup failed; retrying next cycle");
                report.fetch_failed += 1;
                return;
            }
        };
        report.checked += 1;

        let _guard = self.locks.lock(&key).await;
        let current = match self.store.get(&key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(key = %key, "subscription removed mid-cycle");
                report.vanished += 1;
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to re-read subscription");
                report.storage_failed += 1;
                return;
            }
        };

        // The lookup answered for the snapshot. A record re-created or
        // updated since then is left to the next cycle.
        if current != *snapshot {
            debug!(key = %key, "subscription replaced mid-cycle");
            report.superseded += 1;
            return;
        }

        let Some(event) = NotificationEvent::from_change(&current, fetched) else {
            report.unchanged += 1;
            return;
        };

        self.notify(&event, report).await;

        match self.store.put(&current.with_balance(fetched)) {
            Ok(()) => report.changed += 1,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to persist new balance");
                self.health.mark_degraded(&e.to_string());
                report.storage_failed += 1;
            }
        }
    }

    async fn notify(&self, event: &NotificationEvent, report: &mut CycleReport) {
        let delivery = tokio::time::timeout(self.config.notify_timeout, self.sink.deliver(event));
        let failure = match delivery.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "delivery timed out".to_string(),
        };
        warn!(
            subscriber = %event.subscriber_id,
            address = %event.address,
            error = %failure,
            "notification delivery failed; not retried"
        );
        report.notify_failed += 1;
    }

    async fn expire(&self, snapshot: &SubscriptionRecord, now: u64, report: &mut CycleReport) {
        let key = snapshot.key();
        let _guard = self.locks.lock(&key).await;
        // Re-check under the lock: the record may have been removed.
        match self.store.get(&key) {
            Ok(Some(current)) if current.is_expired(now, self.config.observation_window_ms) => {}
            Ok(_) => return,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to re-read expiring subscription");
                report.storage_failed += 1;
                return;
            }
        }
        match self.store.delete(&key) {
            Ok(_) => {
                info!(
                    key = %key,
                    age_ms = snapshot.age_ms(now),
                    "subscription expired"
                );
                report.expired += 1;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to remove expired subscription");
                report.storage_failed += 1;
            }
        }
    }
}

/// Handle for the background reconciliation task.
pub struct LoopHandle {
    reconciler: Arc<ReconciliationLoop>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub fn reconciler(&self) -> &Arc<ReconciliationLoop> {
        &self.reconciler
    }

    pub fn state(&self) -> LoopState {
        self.reconciler.state()
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.reconciler.last_report()
    }

    /// Stop after the in-flight cycle (if any) completes.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "reconciler task ended abnormally");
        }
    }
}

/// Spawn the reconciliation loop. The first cycle runs immediately.
pub fn spawn(reconciler: Arc<ReconciliationLoop>) -> LoopHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(run_loop(Arc::clone(&reconciler), cancel_rx));
    LoopHandle {
        reconciler,
        cancel: cancel_tx,
        task,
    }
}

async fn run_loop(reconciler: Arc<ReconciliationLoop>, mut cancel_rx: watch::Receiver<bool>) {
    let interval_ms = u64::try_from(reconciler.config.interval.as_millis()).unwrap_or(u64::MAX);
    info!(
        interval_ms,
        observation_window_ms = reconciler.config.observation_window_ms,
        "starting reconciliation loop"
    );

    let mut ticker = tokio::time::interval(reconciler.config.interval);
    // Ticks that fire while a cycle runs are dropped, not queued.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconciler.tick().await;
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    info!("reconciliation loop shutting down");
                    break;
                }
            }
        }
    }
}
