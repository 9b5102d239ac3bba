use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use placegrid_common::PlaceResult;

use crate::traits::ResultSink;

/// Keeps accepted results in memory.
#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<PlaceResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<PlaceResult> {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn push(&self, result: &PlaceResult) -> Result<()> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.results.lock().unwrap_or_else(|e| e.into_inner()).len())
    }
}

/// Appends accepted results to a JSON-lines file, one place per line.
pub struct DatasetSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    written: AtomicUsize,
}

impl DatasetSink {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening dataset {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
            written: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for DatasetSink {
    async fn push(&self, result: &PlaceResult) -> Result<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Lines written by this sink, not by earlier runs.
    async fn count(&self) -> Result<usize> {
        Ok(self.written.load(Ordering::Relaxed))
    }
}
