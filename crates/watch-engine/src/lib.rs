#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Watch-list reconciliation engine.
//!
//! - [`WatchRegistry`]: subscribe / unsubscribe / list over the store
//! - [`ReconciliationLoop`]: periodic fetch, diff and notify pass
//! - [`BalanceSource`] and [`NotificationSink`]: the two external seams
//!
//! Registry and loop share one [`KeyLocks`] table so every write to a
//! given `(subscriber, address)` key is serialised.

pub mod balance;
pub mod health;
pub mod locks;
pub mod metrics;
pub mod mock;
pub mod notify;
pub mod reconciler;
pub mod registry;

pub use balance::{BalanceError, BalanceSource, BscScanClient, BscScanConfig, TimeoutSource};
pub use health::StorageHealth;
pub use locks::KeyLocks;
pub use metrics::ReconcilerMetrics;
pub use notify::{
    render_change_message, LoggingSink, NotificationSink, NotifyError, TelegramConfig,
    TelegramSink,
};
pub use reconciler::{
    spawn, CycleReport, LoopHandle, LoopState, ReconcilerConfig, ReconciliationLoop,
    TickOutcome,
};
pub use registry::{RegistryConfig, SubscribeOutcome, UnsubscribeOutcome, WatchError, WatchRegistry};
