use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::errors::MemoryResult;
use crate::resource::BudgetExceededCallback;
use crate::tracker::MemoryTracker;

/// Creates memory trackers and keeps a weak registry of them for reporting.
#[derive(Default)]
pub struct MemoryTrackerManager {
    trackers: Mutex<Vec<Weak<MemoryTracker>>>,
}

impl MemoryTrackerManager {
    pub fn new() -> Self {
        MemoryTrackerManager::default()
    }

    /// Creates a tracker with an unlimited budget and no budget callback.
    pub fn create_tracker(&self) -> Arc<MemoryTracker> {
        self.create_tracker_with_budget(u64::MAX, Arc::new(|| {}))
    }

    /// Creates a tracker whose allocations are capped at `budget` bytes.
    ///
    /// `on_budget_exceeded` runs on the allocating thread every time an
    /// allocation is refused.
    pub fn create_tracker_with_budget(
        &self,
        budget: u64,
        on_budget_exceeded: BudgetExceededCallback,
    ) -> Arc<MemoryTracker> {
        let tracker = Arc::new(MemoryTracker::new(budget, on_budget_exceeded));
        self.trackers.lock().push(Arc::downgrade(&tracker));
        tracker
    }

    /// Number of trackers still alive.
    pub fn tracker_count(&self) -> usize {
        self.trackers
            .lock()
            .iter()
            .filter(|tracker| tracker.strong_count() > 0)
            .count()
    }

    pub(crate) fn snapshot(&self) -> MemoryResult<serde_json::Value> {
        let live: Vec<Arc<MemoryTracker>> = self
            .trackers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        let entries = live
            .iter()
            .map(|tracker| tracker.to_json())
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(serde_json::Value::Array(entries))
    }

    /// JSON array describing every live tracker. Expired trackers are skipped.
    pub fn to_json(&self) -> MemoryResult<String> {
        Ok(self.snapshot()?.to_string())
    }
}
