//! Per-key write serialisation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use watch_core::SubscriptionKey;

/// Table of async mutexes, one per subscription key, created on demand.
///
/// Holding the guard for a key excludes every other registry or
/// reconciler write to that key. Idle entries are pruned on each acquire.
#[derive(Debug, Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<SubscriptionKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &SubscriptionKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Only the map holds a reference: nobody is waiting or locked.
            map.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            Arc::clone(map.entry(key.clone()).or_default())
        };
        slot.lock_owned().await
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use watch_core::{Address, SubscriberId};

    fn key(sub: &str) -> SubscriptionKey {
        SubscriptionKey::new(
            SubscriberId::new(sub).unwrap(),
            Address::parse("0x1111111111111111111111111111111111111111").unwrap(),
        )
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.lock(&key("1")).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock(&key("1")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender acquires after release")
            .expect("join");
    }

    #[tokio::test]
    async fn different_keys_do_not_block_and_idle_entries_are_pruned() {
        let locks = KeyLocks::new();
        let a = locks.lock(&key("a")).await;
        let _b = locks.lock(&key("b")).await;
        assert_eq!(locks.len(), 2);
        drop(a);
        let _c = locks.lock(&key("c")).await;
        // "a" was idle and got pruned; "b" is still held.
        assert_eq!(locks.len(), 2);
    }
}
