use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use placegrid_common::{PlannerError, Result};

use crate::store::{load_json, save_json, Persist, StateKeys, StateStore};

/// Persisted accepted counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub accepted: BTreeMap<String, u64>,
    pub global: u64,
    pub saved_at: DateTime<Utc>,
}

#[derive(Default)]
struct BudgetState {
    /// Results written to output.
    accepted: HashMap<String, u64>,
    global: u64,
    /// Slots held by results whose write is still pending.
    reserved: HashMap<String, u64>,
    global_reserved: u64,
}

impl BudgetState {
    fn accepted(&self, search_id: &str) -> u64 {
        self.accepted.get(search_id).copied().unwrap_or(0)
    }

    fn reserved(&self, search_id: &str) -> u64 {
        self.reserved.get(search_id).copied().unwrap_or(0)
    }
}

/// Per-search and global result caps.
///
/// Admission is two-phase: `try_reserve` holds a slot while the result is
/// written, then `commit` or `release` settles it. Reserved slots count
/// against the caps for admission, but a search is only finished once its
/// committed count reaches the cap. Every transition happens under one lock
/// so concurrent workers can never both see headroom for the last slot.
pub struct BudgetTracker {
    /// Cap for every logical search. `u64::MAX` = unlimited.
    per_search_cap: u64,
    /// Cap across all searches. `u64::MAX` = unlimited.
    global_cap: u64,
    searches: Vec<String>,
    state: Mutex<BudgetState>,
    store: Option<(Arc<dyn StateStore>, String)>,
}

impl BudgetTracker {
    /// In-memory tracker. Global cap is `min(total, per_search * searches)`.
    pub fn new(searches: &[String], per_search_cap: Option<u64>, total: Option<u64>) -> Self {
        let mut ids: Vec<String> = Vec::new();
        for id in searches {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        let per_search_cap = per_search_cap.unwrap_or(u64::MAX);
        let summed = if per_search_cap == u64::MAX {
            u64::MAX
        } else {
            per_search_cap.saturating_mul(ids.len().max(1) as u64)
        };
        let global_cap = total.unwrap_or(u64::MAX).min(summed);
        let accepted = ids.iter().map(|id| (id.clone(), 0)).collect();

        Self {
            per_search_cap,
            global_cap,
            searches: ids,
            state: Mutex::new(BudgetState {
                accepted,
                ..Default::default()
            }),
            store: None,
        }
    }

    /// Tracker backed by `store`, resuming persisted counts for `run_id`.
    /// Unreadable counts resume from zero.
    pub async fn load(
        store: Arc<dyn StateStore>,
        run_id: &str,
        searches: &[String],
        per_search_cap: Option<u64>,
        total: Option<u64>,
    ) -> Self {
        let mut tracker = Self::new(searches, per_search_cap, total);
        let key = StateKeys::budget(run_id);

        match load_json::<BudgetSnapshot>(store.as_ref(), &key).await {
            Ok(Some(snapshot)) => {
                info!(
                    run_id,
                    global = snapshot.global,
                    searches = snapshot.accepted.len(),
                    "Resuming budget counts"
                );
                let state = tracker.state.get_mut().unwrap_or_else(|e| e.into_inner());
                let summed: u64 = snapshot.accepted.values().sum();
                state.global = snapshot.global.max(summed);
                state.accepted.extend(snapshot.accepted);
            }
            Ok(None) => {}
            Err(e) => {
                let err = PlannerError::BudgetPersistence(e.to_string());
                warn!(run_id, error = %err, "Budget counts unreadable, resuming from zero");
            }
        }

        tracker.store = Some((store, key));
        tracker
    }

    /// Hold one slot for `search_id` if both its cap and the global cap have
    /// headroom, counting slots already held. Reserves both or neither.
    pub fn try_reserve(&self, search_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.global + state.global_reserved >= self.global_cap {
            return false;
        }
        if state.accepted(search_id) + state.reserved(search_id) >= self.per_search_cap {
            return false;
        }
        *state.reserved.entry(search_id.to_string()).or_insert(0) += 1;
        state.global_reserved += 1;
        true
    }

    /// Turn a held slot into an accepted result.
    pub fn commit(&self, search_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if take_reservation(&mut state, search_id) {
            *state.accepted.entry(search_id.to_string()).or_insert(0) += 1;
            state.global += 1;
        }
    }

    /// Give a held slot back without accepting anything.
    pub fn release(&self, search_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        take_reservation(&mut state, search_id);
    }

    /// Reserve and commit in one step.
    pub fn try_accept(&self, search_id: &str) -> bool {
        if !self.try_reserve(search_id) {
            return false;
        }
        self.commit(search_id);
        true
    }

    /// Give back one accepted slot.
    pub fn refund(&self, search_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let refunded = match state.accepted.get_mut(search_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        };
        if refunded {
            state.global = state.global.saturating_sub(1);
        }
    }

    pub fn accepted(&self, search_id: &str) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).accepted(search_id)
    }

    pub fn reserved(&self, search_id: &str) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).reserved(search_id)
    }

    pub fn total_accepted(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).global
    }

    /// Whether `search_id` has accepted all it ever will, either because its
    /// own cap is reached or because the global cap is. Pending reservations
    /// do not count: a failed write hands its slot back.
    pub fn is_finished(&self, search_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.global >= self.global_cap {
            return true;
        }
        state.accepted(search_id) >= self.per_search_cap
    }

    /// Global cap reached, or every planned search reached its own cap.
    /// Counts accepted results only.
    pub fn is_globally_finished(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.global >= self.global_cap {
            return true;
        }
        !self.searches.is_empty()
            && self
                .searches
                .iter()
                .all(|id| state.accepted(id) >= self.per_search_cap)
    }

    pub fn per_search_cap(&self) -> Option<u64> {
        (self.per_search_cap != u64::MAX).then_some(self.per_search_cap)
    }

    pub fn global_cap(&self) -> Option<u64> {
        (self.global_cap != u64::MAX).then_some(self.global_cap)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        BudgetSnapshot {
            accepted: state
                .accepted
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            global: state.global,
            saved_at: Utc::now(),
        }
    }

    pub fn log_status(&self) {
        let snapshot = self.snapshot();
        info!(
            accepted = snapshot.global,
            global_cap = ?self.global_cap(),
            per_search_cap = ?self.per_search_cap(),
            searches = snapshot.accepted.len(),
            "Budget status"
        );
        for (search, count) in &snapshot.accepted {
            info!(search = search.as_str(), accepted = count, "Search budget");
        }
    }
}

fn take_reservation(state: &mut BudgetState, search_id: &str) -> bool {
    match state.reserved.get_mut(search_id) {
        Some(count) if *count > 0 => {
            *count -= 1;
            state.global_reserved = state.global_reserved.saturating_sub(1);
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Persist for BudgetTracker {
    fn name(&self) -> &'static str {
        "budget"
    }

    async fn persist(&self) -> Result<()> {
        let Some((store, key)) = &self.store else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        save_json(store.as_ref(), key, &snapshot).await
    }
}
