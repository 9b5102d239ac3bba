//! Keyed blob persistence for run state.
//!
//! Every persisted piece of state (plan, budget counts, cached places,
//! emitted keys, enqueue cursor) lives under its own key and is recovered
//! independently; a missing or unreadable blob never blocks the others.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use placegrid_common::Result;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Shared state that flushes a snapshot of itself to its store. Snapshots
/// are taken under the owner's lock and written after it is released.
#[async_trait]
pub trait Persist: Send + Sync {
    fn name(&self) -> &'static str;

    async fn persist(&self) -> Result<()>;
}

/// Read and decode a JSON blob. `Ok(None)` when the key was never written.
pub async fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}

/// Key names for each persisted blob.
pub struct StateKeys;

impl StateKeys {
    pub fn plan(run_id: &str) -> String {
        format!("plan:{run_id}")
    }

    pub fn budget(run_id: &str) -> String {
        format!("budget:{run_id}")
    }

    pub fn emitted(run_id: &str) -> String {
        format!("emitted:{run_id}")
    }

    pub fn cursor(run_id: &str) -> String {
        format!("cursor:{run_id}")
    }

    /// Cached places are shared by every run using the same cache key.
    pub fn cache(cache_key: &str) -> String {
        format!("cache:{cache_key}")
    }
}
