//!  Storage is a small key-value store holding one json document per key.
//!  The basic idea is:
//!   - The daemon owns the only writer, the cli reads some keys directly.
//!   - [file_store::FileStore] keeps documents under `<app-dir>/store/<key>.json`,
//!     guarded by advisory file locks so readers don't observe partial writes.
//!   - [InMemoryStore] is the degraded fallback when the directory can't be created.

pub mod file_store;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Key holding the per-domain accumulated seconds.
pub const SITE_TIME_KEY: &str = "siteTime";
/// Key holding productivity goals. Opaque to the tracker, read and written by the cli.
pub const SETTINGS_KEY: &str = "productivitySettings";
/// Key holding focus timer stats. Opaque to the tracker, written by external timer UIs.
pub const TIMER_STATS_KEY: &str = "timerStats";

/// Interface for abstracting durable key-value storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&mut self, key: &str, value: Value) -> Result<()>;
}

/// Ephemeral store used when file storage is unavailable. Clones share the same map, which
/// also makes it convenient for inspecting persisted state in tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().expect("Store lock poisoned").get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.values
            .lock()
            .expect("Store lock poisoned")
            .insert(key.to_owned(), value);
        Ok(())
    }
}
