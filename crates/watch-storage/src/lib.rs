#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Durable subscription store.
//!
//! One sled tree holds every [`SubscriptionRecord`] keyed by
//! `sub:<subscriber>:<address>`; values are flat JSON. A `meta` tree carries
//! the schema version. Every mutation is flushed before returning, so a
//! successful `put`/`delete` survives a crash immediately afterwards.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use sled::Tree;
use thiserror::Error;
use tracing::{info, warn};
use watch_core::{SubscriberId, SubscriptionKey, SubscriptionRecord};

pub const SCHEMA_VERSION: &str = "1";
const META_SCHEMA_KEY: &[u8] = b"schema_version";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("schema mismatch: expected {expected}, found {found:?}")]
    SchemaMismatch {
        expected: String,
        found: Option<String>,
    },
}

/// Persistent map from [`SubscriptionKey`] to [`SubscriptionRecord`].
///
/// Cloning is cheap; clones share the same underlying database.
#[derive(Clone)]
pub struct SubscriptionStore {
    #[allow(dead_code)]
    db: sled::Db,
    subscriptions: Tree,
    meta: Tree,
}

impl SubscriptionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a store that is deleted when dropped.
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let subscriptions = db.open_tree("subscriptions")?;
        let meta = db.open_tree("meta")?;
        let store = Self {
            db,
            subscriptions,
            meta,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Insert or overwrite the record under its own key.
    pub fn put(&self, record: &SubscriptionRecord) -> Result<(), StorageError> {
        let key = record.key();
        let bytes = encode(record)?;
        self.subscriptions.insert(key.to_bytes(), bytes)?;
        self.subscriptions.flush()?;
        Ok(())
    }

    pub fn get(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionRecord>, StorageError> {
        self.subscriptions
            .get(key.to_bytes())?
            .map(|ivec| decode(&ivec))
            .transpose()
    }

    /// Remove a record; returns whether one existed.
    pub fn delete(&self, key: &SubscriptionKey) -> Result<bool, StorageError> {
        let existed = self.subscriptions.remove(key.to_bytes())?.is_some();
        if existed {
            self.subscriptions.flush()?;
        }
        Ok(existed)
    }

    pub fn exists(&self, key: &SubscriptionKey) -> Result<bool, StorageError> {
        Ok(self.subscriptions.contains_key(key.to_bytes())?)
    }

    /// Snapshot of every record, in key order.
    ///
    /// Each entry is fully decoded before it is returned, so concurrent
    /// writers can never be observed half-applied. Entries that fail to
    /// decode are logged and skipped rather than aborting the scan.
    pub fn list_all(&self) -> Result<Vec<SubscriptionRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.subscriptions.iter() {
            let (key, value) = item?;
            if let Some(record) = decode_entry(&key, &value) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Every record owned by `subscriber`, in key order.
    pub fn list_for_subscriber(
        &self,
        subscriber: &SubscriberId,
    ) -> Result<Vec<SubscriptionRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self
            .subscriptions
            .scan_prefix(SubscriptionKey::subscriber_prefix(subscriber))
        {
            let (key, value) = item?;
            match decode_entry(&key, &value) {
                Some(record) if &record.subscriber_id == subscriber => out.push(record),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn count_for_subscriber(&self, subscriber: &SubscriberId) -> Result<usize, StorageError> {
        Ok(self.list_for_subscriber(subscriber)?.len())
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn schema_version(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .meta
            .get(META_SCHEMA_KEY)?
            .map(|v| String::from_utf8_lossy(&v).to_string()))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.subscriptions.flush()?;
        self.meta.flush()?;
        Ok(())
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let existing = self.meta.get(META_SCHEMA_KEY)?;
        match existing {
            Some(val) => {
                let current = String::from_utf8_lossy(&val).to_string();
                if current != SCHEMA_VERSION {
                    return Err(StorageError::SchemaMismatch {
                        expected: SCHEMA_VERSION.to_string(),
                        found: Some(current),
                    });
                }
            }
            None => {
                self.meta.insert(META_SCHEMA_KEY, SCHEMA_VERSION.as_bytes())?;
                self.meta.flush()?;
                info!(schema = SCHEMA_VERSION, "initialized schema version");
            }
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode one stored entry, checking the record agrees with its key.
fn decode_entry(key: &[u8], value: &[u8]) -> Option<SubscriptionRecord> {
    let Some(parsed_key) = SubscriptionKey::from_bytes(key) else {
        warn!(key = %String::from_utf8_lossy(key), "skipping entry with malformed key");
        return None;
    };
    let record: SubscriptionRecord = match decode(value) {
        Ok(record) => record,
        Err(err) => {
            warn!(key = %parsed_key, error = %err, "skipping undecodable record");
            return None;
        }
    };
    if record.key() != parsed_key {
        warn!(key = %parsed_key, "skipping record stored under a foreign key");
        return None;
    }
    Some(record)
}
