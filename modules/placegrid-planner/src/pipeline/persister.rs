use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::Persist;

/// Saves every registered participant on an interval and once more at
/// shutdown. A failed save is logged and retried on the next tick.
pub struct StatePersister {
    participants: Vec<Arc<dyn Persist>>,
    interval: Duration,
}

impl StatePersister {
    pub fn new(interval: Duration) -> Self {
        Self {
            participants: Vec::new(),
            interval,
        }
    }

    pub fn register(&mut self, participant: Arc<dyn Persist>) {
        self.participants.push(participant);
    }

    /// Persist everything once. Returns the number of failures.
    pub async fn persist_all(&self) -> usize {
        let mut failures = 0;
        for participant in &self.participants {
            match participant.persist().await {
                Ok(()) => debug!(state = participant.name(), "Persisted"),
                Err(e) => {
                    failures += 1;
                    warn!(state = participant.name(), error = %e, "Failed to persist state");
                }
            }
        }
        failures
    }

    pub fn spawn(self) -> PersisterHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.persist_all().await;
                    }
                    _ = &mut stop_rx => {
                        let failures = self.persist_all().await;
                        info!(
                            participants = self.participants.len(),
                            failures,
                            "Final state persisted"
                        );
                        return failures;
                    }
                }
            }
        });
        PersisterHandle { stop: stop_tx, task }
    }
}

pub struct PersisterHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<usize>,
}

impl PersisterHandle {
    /// Stop the loop after one final save. Returns the final save's failures.
    pub async fn shutdown(self) -> usize {
        let _ = self.stop.send(());
        match self.task.await {
            Ok(failures) => failures,
            Err(e) => {
                warn!(error = %e, "State persister task failed");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::{BudgetSnapshot, BudgetTracker};
    use crate::store::{load_json, MemoryStateStore, StateKeys};
    use crate::testing::FailingPersist;

    #[tokio::test]
    async fn shutdown_writes_final_state() {
        let store = Arc::new(MemoryStateStore::new());
        let tracker = Arc::new(
            BudgetTracker::load(store.clone(), "run", &["pizza".to_string()], Some(5), None).await,
        );

        let mut persister = StatePersister::new(Duration::from_secs(3600));
        persister.register(tracker.clone());
        let handle = persister.spawn();

        assert!(tracker.try_accept("pizza"));
        assert_eq!(handle.shutdown().await, 0);

        let saved: BudgetSnapshot = load_json(store.as_ref(), &StateKeys::budget("run"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.accepted.get("pizza"), Some(&1));
    }

    #[tokio::test]
    async fn saves_on_every_interval() {
        let store = Arc::new(MemoryStateStore::new());
        let tracker = Arc::new(
            BudgetTracker::load(store.clone(), "run", &["pizza".to_string()], None, None).await,
        );
        let mut persister = StatePersister::new(Duration::from_millis(10));
        persister.register(tracker.clone());
        let handle = persister.spawn();

        assert!(tracker.try_accept("pizza"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let saved: Option<BudgetSnapshot> = load_json(store.as_ref(), &StateKeys::budget("run")).await.unwrap();
        assert_eq!(saved.map(|s| s.global), Some(1));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let mut persister = StatePersister::new(Duration::from_secs(60));
        persister.register(Arc::new(FailingPersist));
        persister.register(Arc::new(BudgetTracker::new(&[], None, None)));
        assert_eq!(persister.persist_all().await, 1);
    }
}
