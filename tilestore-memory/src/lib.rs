//! Budgeted memory tracking for the tile store.
//!
//! Every long-lived buffer the storage engine keeps (R-tree levels, tile
//! offsets, footers) is allocated through a [`MemoryTrackerResource`] owned
//! by a [`MemoryTracker`]. The tracker charges each allocation to a
//! [`MemoryType`] and refuses allocations that would exceed its budget.
//! Trackers are handed out by a [`MemoryTrackerManager`], which a
//! [`MemoryTrackerReporter`] can periodically dump to a JSON-lines file.
//!
//! ```rust
//! use tilestore_memory::{pmr, MemoryTrackerManager, MemoryType};
//!
//! let manager = MemoryTrackerManager::new();
//! let tracker = manager.create_tracker();
//! let mut offsets = pmr::Vec::new_in(tracker.get_allocator(MemoryType::TileOffsets));
//! offsets.push(42u64).unwrap();
//! assert!(tracker.get_counts().0 > 0);
//! ```

pub mod config;
pub mod errors;
pub mod manager;
pub mod memory_type;
pub mod pmr;
pub mod reporter;
pub mod resource;
pub mod tracker;

pub use config::MemoryTrackerReporterConfig;
pub use errors::{ErrorKind, MemoryError, MemoryResult};
pub use manager::MemoryTrackerManager;
pub use memory_type::{MemoryTrackerType, MemoryType};
pub use reporter::MemoryTrackerReporter;
pub use resource::{
    system_resource, BudgetExceededCallback, MemoryResource, MemoryTrackerResource,
    SystemResource,
};
pub use tracker::MemoryTracker;
