//! Emitted-key tracking for duplicate-free output.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use placegrid_common::{PlannerError, Result};

use crate::store::{load_json, save_json, Persist, StateKeys, StateStore};

/// Chosen once at construction. `Passthrough` lets every key through.
pub enum ResultDeduper {
    Tracking(EmittedKeys),
    Passthrough,
}

impl ResultDeduper {
    pub async fn open(enabled: bool, store: Arc<dyn StateStore>, run_id: &str) -> Self {
        if enabled {
            ResultDeduper::Tracking(EmittedKeys::load(store, run_id).await)
        } else {
            ResultDeduper::Passthrough
        }
    }

    /// Check-and-mark in one step. True exactly once per distinct key.
    pub fn try_emit(&self, key: &str) -> bool {
        match self {
            ResultDeduper::Tracking(keys) => keys.try_emit(key),
            ResultDeduper::Passthrough => true,
        }
    }

    /// Un-mark a key whose output was never written.
    pub fn forget(&self, key: &str) {
        if let ResultDeduper::Tracking(keys) = self {
            keys.forget(key);
        }
    }

    pub fn emitted_count(&self) -> usize {
        match self {
            ResultDeduper::Tracking(keys) => keys.len(),
            ResultDeduper::Passthrough => 0,
        }
    }
}

#[async_trait]
impl Persist for ResultDeduper {
    fn name(&self) -> &'static str {
        "emitted_keys"
    }

    async fn persist(&self) -> Result<()> {
        match self {
            ResultDeduper::Tracking(keys) => keys.persist().await,
            ResultDeduper::Passthrough => Ok(()),
        }
    }
}

pub struct EmittedKeys {
    store: Arc<dyn StateStore>,
    key: String,
    emitted: Mutex<HashSet<String>>,
}

impl EmittedKeys {
    pub async fn load(store: Arc<dyn StateStore>, run_id: &str) -> Self {
        let key = StateKeys::emitted(run_id);
        let emitted = match load_json::<Vec<String>>(store.as_ref(), &key).await {
            Ok(Some(keys)) => {
                info!(run_id, emitted = keys.len(), "Resuming emitted-key set");
                keys.into_iter().collect()
            }
            Ok(None) => HashSet::new(),
            Err(e) => {
                let err = PlannerError::Storage(e.to_string());
                warn!(run_id, error = %err, "Emitted-key set unreadable, starting empty");
                HashSet::new()
            }
        };
        Self {
            store,
            key,
            emitted: Mutex::new(emitted),
        }
    }

    fn try_emit(&self, key: &str) -> bool {
        let mut emitted = self.emitted.lock().unwrap_or_else(|e| e.into_inner());
        emitted.insert(key.to_string())
    }

    fn forget(&self, key: &str) {
        let mut emitted = self.emitted.lock().unwrap_or_else(|e| e.into_inner());
        emitted.remove(key);
    }

    fn len(&self) -> usize {
        self.emitted.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn persist(&self) -> Result<()> {
        let mut snapshot: Vec<String> = {
            let emitted = self.emitted.lock().unwrap_or_else(|e| e.into_inner());
            emitted.iter().cloned().collect()
        };
        snapshot.sort();
        save_json(self.store.as_ref(), &self.key, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    #[tokio::test]
    async fn emits_each_key_once() {
        let deduper = ResultDeduper::open(true, Arc::new(MemoryStateStore::new()), "run").await;
        assert!(deduper.try_emit("a"));
        assert!(!deduper.try_emit("a"));
        assert!(deduper.try_emit("b"));
        assert_eq!(deduper.emitted_count(), 2);
    }

    #[tokio::test]
    async fn passthrough_always_emits() {
        let deduper = ResultDeduper::open(false, Arc::new(MemoryStateStore::new()), "run").await;
        assert!(deduper.try_emit("a"));
        assert!(deduper.try_emit("a"));
    }

    #[tokio::test]
    async fn forgotten_key_can_be_emitted_again() {
        let deduper = ResultDeduper::open(true, Arc::new(MemoryStateStore::new()), "run").await;
        assert!(deduper.try_emit("a"));
        deduper.forget("a");
        assert!(deduper.try_emit("a"));
    }

    #[tokio::test]
    async fn emitted_keys_survive_restart() {
        let store = MemoryStateStore::new();
        let deduper = ResultDeduper::open(true, Arc::new(store.clone()), "run").await;
        assert!(deduper.try_emit("a"));
        deduper.persist().await.unwrap();
        drop(deduper);

        let restarted = ResultDeduper::open(true, Arc::new(store.clone()), "run").await;
        assert!(!restarted.try_emit("a"));
        assert!(restarted.try_emit("b"));
    }

    #[test]
    fn concurrent_emits_admit_one_winner() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let deduper = rt.block_on(ResultDeduper::open(true, Arc::new(MemoryStateStore::new()), "run"));
        let winners = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        if deduper.try_emit("same") {
                            winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(winners.into_inner(), 1);
    }
}
