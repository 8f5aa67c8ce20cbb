//! Pluggable allocation hooks.
//!
//! A [`MemoryResource`] hands out raw, aligned byte buffers. The
//! [`SystemResource`] forwards to the global allocator, while a
//! [`MemoryTrackerResource`] intercepts every request, charges it to one
//! [`MemoryType`] counter of its tracker and refuses requests that would push
//! the tracker's running total above its budget.

use std::alloc::{self, Layout};
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use crate::errors::{ErrorKind, MemoryError, MemoryResult};
use crate::memory_type::MemoryType;

/// Callback invoked when a tracked allocation is refused for budget.
pub type BudgetExceededCallback = Arc<dyn Fn() + Send + Sync>;

/// A source of raw memory.
///
/// Implementations must be safe to call from many threads at once.
pub trait MemoryResource: Send + Sync {
    /// Allocates `bytes` bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceeded` when a budget refuses the request and
    /// `AllocationFailed` when the underlying allocator is exhausted or the
    /// layout is invalid.
    fn allocate(&self, bytes: usize, alignment: usize) -> MemoryResult<NonNull<u8>>;

    /// Returns a buffer previously handed out by [`MemoryResource::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on a resource that
    /// `is_equal` to this one, with the same `bytes` and `alignment`, and must
    /// not have been deallocated already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize);

    /// Two resources are equal when memory allocated by one can be released
    /// through the other.
    fn is_equal(&self, other: &dyn MemoryResource) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Upstream resource backed by the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResource;

static SYSTEM_RESOURCE: LazyLock<Arc<dyn MemoryResource>> =
    LazyLock::new(|| Arc::new(SystemResource));

/// Returns the process-wide system resource.
pub fn system_resource() -> Arc<dyn MemoryResource> {
    Arc::clone(&SYSTEM_RESOURCE)
}

impl MemoryResource for SystemResource {
    fn allocate(&self, bytes: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, alignment)?;
        if layout.size() == 0 {
            // zero-sized requests get a well-aligned dangling pointer
            return NonNull::new(layout.align() as *mut u8).ok_or_else(|| {
                MemoryError::new("Invalid zero alignment", ErrorKind::InternalError)
            });
        }

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            MemoryError::new(
                &format!("System allocator could not provide {} bytes", bytes),
                ErrorKind::AllocationFailed,
            )
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        if bytes == 0 {
            return;
        }
        // SAFETY: the caller guarantees `ptr` came from `allocate` with this
        // exact size and alignment, which therefore form a valid layout.
        let layout = Layout::from_size_align_unchecked(bytes, alignment);
        alloc::dealloc(ptr.as_ptr(), layout);
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        other.as_any().is::<SystemResource>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Budget state shared between a tracker and all of its resources.
pub(crate) struct BudgetState {
    pub(crate) total_counter: AtomicU64,
    pub(crate) memory_budget: AtomicU64,
    pub(crate) on_budget_exceeded: BudgetExceededCallback,
}

impl BudgetState {
    pub(crate) fn new(budget: u64, on_budget_exceeded: BudgetExceededCallback) -> Self {
        BudgetState {
            total_counter: AtomicU64::new(0),
            memory_budget: AtomicU64::new(budget),
            on_budget_exceeded,
        }
    }
}

/// A resource bound to one `(tracker, MemoryType)` pair.
///
/// Allocation checks the tracker-wide running total against the budget
/// before delegating to the upstream resource; counters are rolled back if
/// either the budget or the upstream refuses the request. Deallocation never
/// fails.
pub struct MemoryTrackerResource {
    tracker_id: u64,
    memory_type: MemoryType,
    upstream: Arc<dyn MemoryResource>,
    budget: Arc<BudgetState>,
    type_counter: AtomicU64,
}

impl MemoryTrackerResource {
    pub(crate) fn new(
        tracker_id: u64,
        memory_type: MemoryType,
        upstream: Arc<dyn MemoryResource>,
        budget: Arc<BudgetState>,
    ) -> Self {
        MemoryTrackerResource {
            tracker_id,
            memory_type,
            upstream,
            budget,
            type_counter: AtomicU64::new(0),
        }
    }

    /// Bytes currently charged to this resource's memory type.
    pub fn get_count(&self) -> u64 {
        self.type_counter.load(Ordering::Relaxed)
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn tracker_id(&self) -> u64 {
        self.tracker_id
    }
}

impl Debug for MemoryTrackerResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTrackerResource")
            .field("tracker_id", &self.tracker_id)
            .field("memory_type", &self.memory_type)
            .field("count", &self.get_count())
            .finish()
    }
}

impl MemoryResource for MemoryTrackerResource {
    fn allocate(&self, bytes: usize, alignment: usize) -> MemoryResult<NonNull<u8>> {
        let size = bytes as u64;
        let budget = self.budget.memory_budget.load(Ordering::Relaxed);
        let new_total = self
            .budget
            .total_counter
            .fetch_add(size, Ordering::Relaxed)
            .saturating_add(size);

        if new_total > budget {
            self.budget.total_counter.fetch_sub(size, Ordering::Relaxed);
            log::warn!(
                "Tracker {} refused {} bytes of {}; budget is {} bytes",
                self.tracker_id,
                bytes,
                self.memory_type,
                budget
            );
            (self.budget.on_budget_exceeded)();
            return Err(MemoryError::new(
                &format!(
                    "Cannot allocate {} bytes of {}; memory budget of {} bytes exceeded",
                    bytes, self.memory_type, budget
                ),
                ErrorKind::BudgetExceeded,
            ));
        }

        self.type_counter.fetch_add(size, Ordering::Relaxed);
        match self.upstream.allocate(bytes, alignment) {
            Ok(ptr) => Ok(ptr),
            Err(err) => {
                self.type_counter.fetch_sub(size, Ordering::Relaxed);
                self.budget.total_counter.fetch_sub(size, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        self.upstream.deallocate(ptr, bytes, alignment);
        let size = bytes as u64;
        self.type_counter.fetch_sub(size, Ordering::Relaxed);
        self.budget.total_counter.fetch_sub(size, Ordering::Relaxed);
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        match other.as_any().downcast_ref::<MemoryTrackerResource>() {
            Some(other) => {
                self.tracker_id == other.tracker_id
                    && self.upstream.is_equal(other.upstream.as_ref())
            }
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FailingResource;

    impl MemoryResource for FailingResource {
        fn allocate(&self, _bytes: usize, _alignment: usize) -> MemoryResult<NonNull<u8>> {
            Err(MemoryError::new("exhausted", ErrorKind::AllocationFailed))
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _bytes: usize, _alignment: usize) {}

        fn is_equal(&self, other: &dyn MemoryResource) -> bool {
            other.as_any().is::<FailingResource>()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn budget(limit: u64) -> Arc<BudgetState> {
        Arc::new(BudgetState::new(limit, Arc::new(|| {})))
    }

    #[test]
    fn system_resource_round_trip() {
        let resource = SystemResource;
        let ptr = resource.allocate(64, 8).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        unsafe { resource.deallocate(ptr, 64, 8) };
    }

    #[test]
    fn system_resource_zero_bytes_is_aligned_dangling() {
        let resource = SystemResource;
        let ptr = resource.allocate(0, 16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        unsafe { resource.deallocate(ptr, 0, 16) };
    }

    #[test]
    fn system_resource_rejects_bad_alignment() {
        let err = SystemResource.allocate(8, 3).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AllocationFailed);
    }

    #[test]
    fn tracker_resource_counts_and_releases() {
        let state = budget(u64::MAX);
        let resource =
            MemoryTrackerResource::new(1, MemoryType::RTree, system_resource(), state.clone());
        let ptr = resource.allocate(128, 8).unwrap();
        assert_eq!(resource.get_count(), 128);
        assert_eq!(state.total_counter.load(Ordering::Relaxed), 128);

        unsafe { resource.deallocate(ptr, 128, 8) };
        assert_eq!(resource.get_count(), 0);
        assert_eq!(state.total_counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tracker_resource_refuses_over_budget_and_calls_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let state = Arc::new(BudgetState::new(
            100,
            Arc::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        let resource =
            MemoryTrackerResource::new(2, MemoryType::TileData, system_resource(), state.clone());

        let err = resource.allocate(1000, 8).unwrap_err();
        assert!(err.is_budget_exceeded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resource.get_count(), 0);
        assert_eq!(state.total_counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tracker_resource_allows_exactly_the_budget() {
        let state = budget(100);
        let resource =
            MemoryTrackerResource::new(3, MemoryType::TileData, system_resource(), state.clone());
        let ptr = resource.allocate(100, 1).unwrap();
        assert!(resource.allocate(1, 1).is_err());
        unsafe { resource.deallocate(ptr, 100, 1) };
        assert_eq!(state.total_counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tracker_resource_rolls_back_on_upstream_failure() {
        let state = budget(u64::MAX);
        let resource = MemoryTrackerResource::new(
            4,
            MemoryType::Footer,
            Arc::new(FailingResource),
            state.clone(),
        );
        let err = resource.allocate(32, 8).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::AllocationFailed);
        assert_eq!(resource.get_count(), 0);
        assert_eq!(state.total_counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tracker_resource_equality_uses_tracker_and_upstream() {
        let state = budget(u64::MAX);
        let a = MemoryTrackerResource::new(5, MemoryType::RTree, system_resource(), state.clone());
        let b = MemoryTrackerResource::new(5, MemoryType::RTree, system_resource(), state.clone());
        let other_tracker =
            MemoryTrackerResource::new(6, MemoryType::RTree, system_resource(), state.clone());
        let other_upstream =
            MemoryTrackerResource::new(5, MemoryType::RTree, Arc::new(FailingResource), state);

        assert!(a.is_equal(&b));
        assert!(!a.is_equal(&other_tracker));
        assert!(!a.is_equal(&other_upstream));
        assert!(!a.is_equal(&SystemResource));
        assert!(SystemResource.is_equal(system_resource().as_ref()));
    }
}
