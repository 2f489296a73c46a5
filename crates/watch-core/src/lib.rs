#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Core types for the address balance watcher.
//!
//! This crate defines the identifiers and records shared by the
//! subscription store, the watch registry and the reconciliation loop.
//! Balances are always integers in the chain's smallest unit (wei).

pub mod address;
pub mod record;
pub mod units;

pub use address::{Address, AddressError};
pub use record::{
    BalanceDirection, NotificationEvent, SubscriberId, SubscriberIdError, SubscriptionKey,
    SubscriptionRecord, KEY_PREFIX,
};
pub use units::{format_units, NATIVE_DECIMALS, NATIVE_SYMBOL};

/// Balance in smallest-denomination units.
pub type Balance = u128;

/// Default observation window for a subscription (24 hours).
pub const DEFAULT_OBSERVATION_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Get current timestamp in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
