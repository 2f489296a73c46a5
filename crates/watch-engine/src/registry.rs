//! Subscriber-facing operations over the subscription store.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use watch_core::{
    now_ms, Address, AddressError, Balance, SubscriberId, SubscriberIdError, SubscriptionKey,
    SubscriptionRecord,
};
use watch_storage::{StorageError, SubscriptionStore};

use crate::balance::{BalanceError, BalanceSource, TimeoutSource};
use crate::health::StorageHealth;
use crate::locks::KeyLocks;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("invalid subscriber: {0}")]
    InvalidSubscriber(#[from] SubscriberIdError),
    #[error("balance source unavailable: {0}")]
    UpstreamUnavailable(#[source] BalanceError),
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),
    #[error("storage is degraded; new subscriptions are refused")]
    StorageDegraded,
    #[error("subscriber already watches {limit} addresses")]
    LimitReached { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// A new record was written with the freshly fetched balance.
    Created(SubscriptionRecord),
    /// The key was already watched; the stored record is untouched.
    AlreadyWatching(SubscriptionRecord),
}

impl SubscribeOutcome {
    pub fn record(&self) -> &SubscriptionRecord {
        match self {
            Self::Created(r) | Self::AlreadyWatching(r) => r,
        }
    }

    /// Balance to show the caller.
    pub fn balance(&self) -> Balance {
        self.record().last_known_balance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Removed,
    NotWatching,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on one upstream lookup during subscribe.
    pub fetch_timeout: Duration,
    /// `0` disables the limit.
    pub max_subscriptions_per_subscriber: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            max_subscriptions_per_subscriber: 20,
        }
    }
}

/// Domain API over [`SubscriptionStore`]: validation, one record per
/// `(subscriber, address)`, and fail-closed subscribe.
pub struct WatchRegistry {
    store: SubscriptionStore,
    source: Arc<dyn BalanceSource>,
    locks: Arc<KeyLocks>,
    health: StorageHealth,
    config: RegistryConfig,
}

impl WatchRegistry {
    pub fn new(
        config: RegistryConfig,
        store: SubscriptionStore,
        source: Arc<dyn BalanceSource>,
        locks: Arc<KeyLocks>,
        health: StorageHealth,
    ) -> Self {
        let source: Arc<dyn BalanceSource> =
            Arc::new(TimeoutSource::new(source, config.fetch_timeout));
        Self {
            store,
            source,
            locks,
            health,
            config,
        }
    }

    /// Start watching `address_text` for `subscriber`.
    ///
    /// Idempotent: an existing subscription is returned as-is. A new one is
    /// only written once the upstream balance is known.
    pub async fn subscribe(
        &self,
        subscriber: &str,
        address_text: &str,
    ) -> Result<SubscribeOutcome, WatchError> {
        let key = parse_key(subscriber, address_text)?;
        if self.health.is_degraded() {
            return Err(WatchError::StorageDegraded);
        }

        let _guard = self.locks.lock(&key).await;

        if let Some(existing) = self.store.get(&key).map_err(|e| self.storage_failure(e))? {
            debug!(key = %key, "already watching");
            return Ok(SubscribeOutcome::AlreadyWatching(existing));
        }

        let limit = self.config.max_subscriptions_per_subscriber;
        if limit > 0 {
            let count = self
                .store
                .count_for_subscriber(&key.subscriber)
                .map_err(|e| self.storage_failure(e))?;
            if count >= limit {
                return Err(WatchError::LimitReached { limit });
            }
        }

        let balance = self.source.fetch(&key.address).await.map_err(|e| {
            warn!(key = %key, error = %e, "balance lookup failed during subscribe");
            WatchError::UpstreamUnavailable(e)
        })?;

        let record = SubscriptionRecord::new(key.subscriber, key.address, balance, now_ms());
        self.store.put(&record).map_err(|e| self.storage_failure(e))?;
        info!(
            subscriber = %record.subscriber_id,
            address = %record.address,
            balance = %record.last_known_balance,
            "subscription created"
        );
        Ok(SubscribeOutcome::Created(record))
    }

    pub async fn unsubscribe(
        &self,
        subscriber: &str,
        address_text: &str,
    ) -> Result<UnsubscribeOutcome, WatchError> {
        let key = parse_key(subscriber, address_text)?;
        let _guard = self.locks.lock(&key).await;
        let removed = self.store.delete(&key).map_err(|e| self.storage_failure(e))?;
        if removed {
            info!(key = %key, "subscription removed");
            Ok(UnsubscribeOutcome::Removed)
        } else {
            Ok(UnsubscribeOutcome::NotWatching)
        }
    }

    /// All subscriptions of one subscriber, in store order.
    pub fn list_for(&self, subscriber: &str) -> Result<Vec<SubscriptionRecord>, WatchError> {
        let subscriber = SubscriberId::new(subscriber)?;
        self.store
            .list_for_subscriber(&subscriber)
            .map_err(|e| self.storage_failure(e))
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn is_accepting(&self) -> bool {
        !self.health.is_degraded()
    }

    fn storage_failure(&self, err: StorageError) -> WatchError {
        self.health.mark_degraded(&err.to_string());
        WatchError::StorageFailure(err)
    }
}

/// Validate in the order the caller sees errors: address first.
fn parse_key(subscriber: &str, address_text: &str) -> Result<SubscriptionKey, WatchError> {
    let address = Address::parse(address_text)?;
    let subscriber = SubscriberId::new(subscriber)?;
    Ok(SubscriptionKey::new(subscriber, address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::StaticBalanceSource;

    const ADDR: &str = "0xB91986a9854be250aC681f6737836945D7afF6Fa";

    fn registry(source: Arc<StaticBalanceSource>, limit: usize) -> WatchRegistry {
        WatchRegistry::new(
            RegistryConfig {
                fetch_timeout: Duration::from_secs(1),
                max_subscriptions_per_subscriber: limit,
            },
            SubscriptionStore::open_temporary().expect("store"),
            source,
            Arc::new(KeyLocks::new()),
            StorageHealth::new(),
        )
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let source = Arc::new(StaticBalanceSource::new());
        let addr = Address::parse(ADDR).unwrap();
        source.set(&addr, 7);
        let reg = registry(Arc::clone(&source), 0);

        let first = reg.subscribe("42", ADDR).await.unwrap();
        assert!(matches!(first, SubscribeOutcome::Created(_)));
        assert_eq!(first.balance(), 7);

        source.set(&addr, 9);
        let second = reg.subscribe("42", &ADDR.to_lowercase()).await.unwrap();
        assert!(matches!(second, SubscribeOutcome::AlreadyWatching(_)));
        assert_eq!(second.balance(), 7);
        assert_eq!(reg.list_for("42").unwrap().len(), 1);
        // The second call never consulted upstream.
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_address_has_no_side_effects() {
        let source = Arc::new(StaticBalanceSource::new());
        let reg = registry(Arc::clone(&source), 0);
        let err = reg.subscribe("42", "not-an-address").await.unwrap_err();
        assert!(matches!(err, WatchError::InvalidAddress(_)));
        assert!(reg.store().is_empty());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_failure_writes_nothing() {
        let source = Arc::new(StaticBalanceSource::new());
        source.fail(&Address::parse(ADDR).unwrap(), BalanceError::Timeout);
        let reg = registry(source, 0);
        let err = reg.subscribe("42", ADDR).await.unwrap_err();
        assert!(matches!(
            err,
            WatchError::UpstreamUnavailable(BalanceError::Timeout)
        ));
        assert!(reg.list_for("42").unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_round_trip() {
        let source = Arc::new(StaticBalanceSource::new());
        let addr = Address::parse(ADDR).unwrap();
        source.set(&addr, 1);
        let reg = registry(source, 0);

        assert_eq!(
            reg.unsubscribe("42", ADDR).await.unwrap(),
            UnsubscribeOutcome::NotWatching
        );
        reg.subscribe("42", ADDR).await.unwrap();
        assert_eq!(
            reg.unsubscribe("42", ADDR).await.unwrap(),
            UnsubscribeOutcome::Removed
        );
        assert!(reg.list_for("42").unwrap().is_empty());
        let key = SubscriptionKey::new(SubscriberId::new("42").unwrap(), addr);
        assert!(reg.store().get(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn per_subscriber_limit() {
        let source = Arc::new(StaticBalanceSource::new());
        let a = "0x1111111111111111111111111111111111111111";
        let b = "0x2222222222222222222222222222222222222222";
        source.set(&Address::parse(a).unwrap(), 1);
        source.set(&Address::parse(b).unwrap(), 2);
        let reg = registry(source, 1);

        reg.subscribe("42", a).await.unwrap();
        assert!(matches!(
            reg.subscribe("42", b).await,
            Err(WatchError::LimitReached { limit: 1 })
        ));
        // Re-subscribing to an existing key is not counted against the limit.
        assert!(reg.subscribe("42", a).await.is_ok());
        // Other subscribers are unaffected.
        assert!(reg.subscribe("43", b).await.is_ok());
    }

    #[tokio::test]
    async fn degraded_storage_refuses_new_subscriptions() {
        let source = Arc::new(StaticBalanceSource::new());
        source.set(&Address::parse(ADDR).unwrap(), 1);
        let health = StorageHealth::new();
        let reg = WatchRegistry::new(
            RegistryConfig::default(),
            SubscriptionStore::open_temporary().unwrap(),
            source,
            Arc::new(KeyLocks::new()),
            health.clone(),
        );
        health.mark_degraded("disk full");
        assert!(!reg.is_accepting());
        assert!(matches!(
            reg.subscribe("42", ADDR).await,
            Err(WatchError::StorageDegraded)
        ));
        // Removal still works.
        assert_eq!(
            reg.unsubscribe("42", ADDR).await.unwrap(),
            UnsubscribeOutcome::NotWatching
        );
    }

    #[tokio::test]
    async fn store_error_latches_degraded() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let addr = Address::parse(ADDR).unwrap();
        let key = SubscriptionKey::new(SubscriberId::new("42").unwrap(), addr.clone());
        {
            // Undecodable row under the key the first subscribe will read.
            let db = sled::open(dir.path()).expect("open sled");
            db.open_tree("subscriptions")
                .unwrap()
                .insert(key.to_bytes(), b"{not json".to_vec())
                .unwrap();
            db.flush().unwrap();
        }

        let source = Arc::new(StaticBalanceSource::new());
        source.set(&addr, 1);
        let health = StorageHealth::new();
        let reg = WatchRegistry::new(
            RegistryConfig::default(),
            SubscriptionStore::open(dir.path()).expect("store"),
            source,
            Arc::new(KeyLocks::new()),
            health.clone(),
        );

        assert!(matches!(
            reg.subscribe("42", ADDR).await,
            Err(WatchError::StorageFailure(_))
        ));
        assert!(health.is_degraded());
        assert!(!reg.is_accepting());
        assert!(matches!(
            reg.subscribe("43", ADDR).await,
            Err(WatchError::StorageDegraded)
        ));
    }
}
