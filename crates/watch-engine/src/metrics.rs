//! Prometheus counters for the reconciliation loop.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

use crate::reconciler::CycleReport;

#[derive(Clone)]
pub struct ReconcilerMetrics {
    pub cycles: IntCounter,
    pub skipped_ticks: IntCounter,
    pub notifications: IntCounter,
    pub notify_failures: IntCounter,
    pub fetch_failures: IntCounter,
    pub expired: IntCounter,
    pub storage_failures: IntCounter,
    pub subscriptions: IntGauge,
}

impl ReconcilerMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let subscriptions = IntGauge::with_opts(Opts::new(
            "watch_subscriptions",
            "Subscriptions seen by the last reconciliation cycle",
        ))?;
        registry.register(Box::new(subscriptions.clone()))?;

        Ok(Self {
            cycles: counter("watch_cycles_total", "Completed reconciliation cycles")?,
            skipped_ticks: counter(
                "watch_skipped_ticks_total",
                "Ticks dropped because a cycle was still running",
            )?,
            notifications: counter(
                "watch_notifications_total",
                "Balance changes detected and persisted",
            )?,
            notify_failures: counter(
                "watch_notify_failures_total",
                "Notifications the sink failed to deliver",
            )?,
            fetch_failures: counter(
                "watch_fetch_failures_total",
                "Balance lookups that failed or timed out",
            )?,
            expired: counter(
                "watch_expired_total",
                "Subscriptions removed by the expiry sweep",
            )?,
            storage_failures: counter(
                "watch_storage_failures_total",
                "Store operations that failed during reconciliation",
            )?,
            subscriptions,
        })
    }

    pub fn observe_cycle(&self, report: &CycleReport) {
        self.cycles.inc();
        self.notifications.inc_by(report.changed);
        self.notify_failures.inc_by(report.notify_failed);
        self.fetch_failures.inc_by(report.fetch_failed);
        self.expired.inc_by(report.expired);
        self.storage_failures.inc_by(report.storage_failed);
        self.subscriptions
            .set(i64::try_from(report.total).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once_per_registry() {
        let registry = Registry::new();
        let metrics = ReconcilerMetrics::register(&registry).expect("register");
        metrics.observe_cycle(&CycleReport {
            total: 3,
            changed: 2,
            fetch_failed: 1,
            ..CycleReport::default()
        });
        assert_eq!(metrics.cycles.get(), 1);
        assert_eq!(metrics.notifications.get(), 2);
        assert_eq!(metrics.subscriptions.get(), 3);
        assert!(ReconcilerMetrics::register(&registry).is_err());
    }
}
