use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::errors::MemoryResult;
use crate::memory_type::{MemoryTrackerType, MemoryType};
use crate::pmr::Allocator;
use crate::resource::{
    system_resource, BudgetExceededCallback, BudgetState, MemoryResource, MemoryTrackerResource,
};

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(0);

fn generate_id() -> u64 {
    NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed)
}

struct LegacyState {
    memory_usage: u64,
    memory_budget: u64,
    memory_usage_by_type: HashMap<MemoryType, u64>,
}

/// Memory accounting for one logical consumer, such as an open array.
///
/// A tracker carries two independent mechanisms:
///
/// - the legacy aggregate pair, driven by explicit [`take_memory`] and
///   [`release_memory`] calls and guarded by a mutex;
/// - the modern per-[`MemoryType`] counters, updated transparently by every
///   allocation made through a resource from [`get_resource`].
///
/// Trackers are created through
/// [`MemoryTrackerManager`](crate::manager::MemoryTrackerManager) so that
/// every live tracker can be reported.
///
/// [`take_memory`]: MemoryTracker::take_memory
/// [`release_memory`]: MemoryTracker::release_memory
/// [`get_resource`]: MemoryTracker::get_resource
pub struct MemoryTracker {
    id: u64,
    tracker_type: RwLock<MemoryTrackerType>,
    upstream: Arc<dyn MemoryResource>,
    budget_state: Arc<BudgetState>,
    resources: Mutex<HashMap<MemoryType, Arc<MemoryTrackerResource>>>,
    legacy: Mutex<LegacyState>,
}

#[derive(Serialize)]
struct TrackerSnapshot {
    tracker_id: String,
    tracker_type: String,
    total_memory: u64,
    counters: BTreeMap<String, u64>,
}

impl MemoryTracker {
    pub(crate) fn new(budget: u64, on_budget_exceeded: BudgetExceededCallback) -> Self {
        let id = generate_id();
        log::debug!("Created memory tracker {} with budget {}", id, budget);
        MemoryTracker {
            id,
            tracker_type: RwLock::new(MemoryTrackerType::default()),
            upstream: system_resource(),
            budget_state: Arc::new(BudgetState::new(budget, on_budget_exceeded)),
            resources: Mutex::new(HashMap::new()),
            legacy: Mutex::new(LegacyState {
                memory_usage: 0,
                memory_budget: u64::MAX,
                memory_usage_by_type: HashMap::new(),
            }),
        }
    }

    pub fn get_id(&self) -> u64 {
        self.id
    }

    pub fn get_type(&self) -> MemoryTrackerType {
        *self.tracker_type.read()
    }

    pub fn set_type(&self, tracker_type: MemoryTrackerType) {
        *self.tracker_type.write() = tracker_type;
    }

    /// Returns the resource for `memory_type`, creating it on first use.
    ///
    /// Repeated calls with the same type return the same resource.
    pub fn get_resource(&self, memory_type: MemoryType) -> Arc<MemoryTrackerResource> {
        let mut resources = self.resources.lock();
        let resource = resources.entry(memory_type).or_insert_with(|| {
            Arc::new(MemoryTrackerResource::new(
                self.id,
                memory_type,
                Arc::clone(&self.upstream),
                Arc::clone(&self.budget_state),
            ))
        });
        Arc::clone(resource)
    }

    /// Allocator handle charging to `memory_type`.
    pub fn get_allocator(&self, memory_type: MemoryType) -> Allocator {
        let resource: Arc<dyn MemoryResource> = self.get_resource(memory_type);
        Allocator::new(resource)
    }

    /// Records `size` bytes against the legacy budget.
    ///
    /// Returns `false`, with no side effect, when the budget would be exceeded.
    pub fn take_memory(&self, size: u64, memory_type: MemoryType) -> bool {
        let mut legacy = self.legacy.lock();
        let fits = legacy
            .memory_usage
            .checked_add(size)
            .is_some_and(|total| total <= legacy.memory_budget);
        if !fits {
            log::warn!(
                "Tracker {} refused to take {} bytes of {}; usage {} of budget {}",
                self.id,
                size,
                memory_type,
                legacy.memory_usage,
                legacy.memory_budget
            );
            return false;
        }

        legacy.memory_usage += size;
        *legacy.memory_usage_by_type.entry(memory_type).or_insert(0) += size;
        true
    }

    /// Returns `size` bytes to the legacy budget. Callers must only release
    /// what they took.
    pub fn release_memory(&self, size: u64, memory_type: MemoryType) {
        let mut legacy = self.legacy.lock();
        legacy.memory_usage = legacy.memory_usage.wrapping_sub(size);
        let by_type = legacy.memory_usage_by_type.entry(memory_type).or_insert(0);
        *by_type = by_type.wrapping_sub(size);
    }

    /// Installs a new legacy budget unless current usage already exceeds it.
    pub fn set_budget(&self, size: u64) -> bool {
        let mut legacy = self.legacy.lock();
        if legacy.memory_usage > size {
            log::warn!(
                "Tracker {} cannot lower budget to {}; {} bytes already in use",
                self.id,
                size,
                legacy.memory_usage
            );
            return false;
        }
        legacy.memory_budget = size;
        true
    }

    pub fn get_memory_budget(&self) -> u64 {
        self.legacy.lock().memory_budget
    }

    pub fn get_memory_usage(&self) -> u64 {
        self.legacy.lock().memory_usage
    }

    pub fn get_memory_usage_by_type(&self, memory_type: MemoryType) -> u64 {
        self.legacy
            .lock()
            .memory_usage_by_type
            .get(&memory_type)
            .copied()
            .unwrap_or(0)
    }

    /// Legacy headroom, less whatever the modern tile offsets counter holds.
    pub fn get_memory_available(&self) -> u64 {
        let offsets = self.modern_count(MemoryType::TileOffsets);
        let legacy = self.legacy.lock();
        legacy
            .memory_budget
            .saturating_sub(legacy.memory_usage)
            .saturating_sub(offsets)
    }

    fn modern_count(&self, memory_type: MemoryType) -> u64 {
        self.resources
            .lock()
            .get(&memory_type)
            .map(|resource| resource.get_count())
            .unwrap_or(0)
    }

    /// Snapshot of the running total and every per-type counter.
    pub fn get_counts(&self) -> (u64, BTreeMap<MemoryType, u64>) {
        let resources = self.resources.lock();
        let total = self.budget_state.total_counter.load(Ordering::Relaxed);
        let counts = resources
            .iter()
            .map(|(memory_type, resource)| (*memory_type, resource.get_count()))
            .collect();
        (total, counts)
    }

    pub fn get_modern_budget(&self) -> u64 {
        self.budget_state.memory_budget.load(Ordering::Relaxed)
    }

    /// Replaces the allocation budget. Relaxed: concurrent allocations may
    /// still check against the previous value.
    pub fn refresh_memory_budget(&self, new_budget: u64) {
        self.budget_state
            .memory_budget
            .store(new_budget, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> MemoryResult<serde_json::Value> {
        let (total, counts) = self.get_counts();
        let snapshot = TrackerSnapshot {
            tracker_id: self.id.to_string(),
            tracker_type: self.get_type().to_string(),
            total_memory: total,
            counters: counts
                .into_iter()
                .map(|(memory_type, count)| (memory_type.to_string(), count))
                .collect(),
        };
        Ok(serde_json::to_value(snapshot)?)
    }
}

impl Drop for MemoryTracker {
    fn drop(&mut self) {
        let total = self.budget_state.total_counter.load(Ordering::Relaxed);
        if total != 0 {
            log::warn!(
                "Memory tracker {} dropped with {} bytes still allocated",
                self.id,
                total
            );
        }
    }
}
