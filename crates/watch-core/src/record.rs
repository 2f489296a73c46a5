//! Subscription records, their composite key and change notifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Address, Balance};

/// Storage key prefix for subscription records.
pub const KEY_PREFIX: &str = "sub:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriberIdError {
    #[error("subscriber id must not be empty")]
    Empty,
}

/// Opaque identity of a watcher (one chat or channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Result<Self, SubscriberIdError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(SubscriberIdError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SubscriberId {
    type Error = SubscriberIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubscriberId> for String {
    fn from(value: SubscriberId) -> Self {
        value.0
    }
}

/// Composite key `(subscriber, address)`; at most one record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub subscriber: SubscriberId,
    pub address: Address,
}

impl SubscriptionKey {
    pub fn new(subscriber: SubscriberId, address: Address) -> Self {
        Self {
            subscriber,
            address,
        }
    }

    /// Storage encoding: `sub:<subscriber>:<address>`.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{KEY_PREFIX}{}:{}", self.subscriber, self.address).into_bytes()
    }

    /// Prefix shared by every key of one subscriber.
    ///
    /// Subscriber ids may themselves contain `:`, so a prefix scan can also
    /// return keys of a longer id; callers filter on the decoded subscriber.
    pub fn subscriber_prefix(subscriber: &SubscriberId) -> Vec<u8> {
        format!("{KEY_PREFIX}{subscriber}:").into_bytes()
    }

    /// Decode a storage key. The address never contains `:`, so the last
    /// separator splits subscriber from address.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let rest = text.strip_prefix(KEY_PREFIX)?;
        let (subscriber, address) = rest.rsplit_once(':')?;
        Some(Self {
            subscriber: SubscriberId::new(subscriber).ok()?,
            address: Address::parse(address).ok()?,
        })
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subscriber, self.address)
    }
}

/// Persisted watch entry. The schema is flat and fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscriber_id: SubscriberId,
    pub address: Address,
    /// Last balance observed, in smallest units.
    pub last_known_balance: Balance,
    /// Time of first subscription (ms since epoch).
    pub created_at_ms: u64,
}

impl SubscriptionRecord {
    pub fn new(
        subscriber_id: SubscriberId,
        address: Address,
        balance: Balance,
        created_at_ms: u64,
    ) -> Self {
        Self {
            subscriber_id,
            address,
            last_known_balance: balance,
            created_at_ms,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.subscriber_id.clone(), self.address.clone())
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// A zero window never expires.
    pub fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
        window_ms > 0 && self.age_ms(now_ms) >= window_ms
    }

    /// Copy of this record carrying a newly observed balance.
    pub fn with_balance(&self, balance: Balance) -> Self {
        Self {
            last_known_balance: balance,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceDirection {
    Increased,
    Decreased,
}

/// A detected balance change for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub subscriber_id: SubscriberId,
    pub address: Address,
    pub old_balance: Balance,
    pub new_balance: Balance,
}

impl NotificationEvent {
    /// Build an event if the balances differ; equal balances yield `None`.
    pub fn from_change(record: &SubscriptionRecord, new_balance: Balance) -> Option<Self> {
        if record.last_known_balance == new_balance {
            return None;
        }
        Some(Self {
            subscriber_id: record.subscriber_id.clone(),
            address: record.address.clone(),
            old_balance: record.last_known_balance,
            new_balance,
        })
    }

    pub fn direction(&self) -> BalanceDirection {
        if self.new_balance > self.old_balance {
            BalanceDirection::Increased
        } else {
            BalanceDirection::Decreased
        }
    }

    /// Absolute size of the change.
    pub fn delta(&self) -> Balance {
        self.new_balance.abs_diff(self.old_balance)
    }
}
