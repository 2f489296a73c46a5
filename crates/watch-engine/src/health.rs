//! Latched storage health shared by the registry and the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

/// Once the durable medium has failed, the process can no longer promise
/// that new subscriptions survive, so intake stops until restart.
#[derive(Debug, Clone, Default)]
pub struct StorageHealth {
    degraded: Arc<AtomicBool>,
}

impl StorageHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            error!(reason, "storage failure; refusing new subscriptions until restart");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}
