//! In-memory collaborators for tests and local dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use watch_core::{Address, Balance, NotificationEvent};

use crate::balance::{BalanceError, BalanceSource};
use crate::notify::{NotificationSink, NotifyError};

/// Balance source answering from a mutable table. Unknown addresses fail
/// with a provider error, as do addresses explicitly marked failing.
#[derive(Debug, Default)]
pub struct StaticBalanceSource {
    balances: Mutex<HashMap<Address, Result<Balance, BalanceError>>>,
    calls: Mutex<u64>,
}

impl StaticBalanceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: &Address, balance: Balance) {
        self.balances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), Ok(balance));
    }

    pub fn fail(&self, address: &Address, error: BalanceError) {
        self.balances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), Err(error));
    }

    /// Total number of `fetch` calls served.
    pub fn calls(&self) -> u64 {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BalanceSource for StaticBalanceSource {
    async fn fetch(&self, address: &Address) -> Result<Balance, BalanceError> {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.balances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
            .unwrap_or_else(|| Err(BalanceError::Provider(format!("unknown address {address}"))))
    }
}

/// Sink that records every event; can be switched to fail deliveries.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
    failing: Mutex<bool>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    /// Events handed to the sink, including ones whose delivery failed.
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(NotifyError::Rejected("sink offline".to_string()));
        }
        Ok(())
    }
}
