use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use placegrid_common::Result;

use super::StateStore;

/// In-process store. Clones share the same map, so a test can drop every
/// component built on it and rebuild them to simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = blobs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.remove(key);
        Ok(())
    }
}
