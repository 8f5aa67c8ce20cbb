//! # Tilestore R-tree - Tile Indexing for Fragments
//!
//! This crate indexes the tiles of a fragment by their minimum bounding
//! rectangles (MBRs) and answers which tiles a query range touches.
//!
//! ## Features
//!
//! - **Heterogeneous Domains**: every dimension has its own coordinate type,
//!   including variable-length ASCII strings
//! - **Bulk Loading**: the tree is built bottom-up from a complete leaf level
//! - **Overlap Ratios**: partially overlapping tiles report the fraction of
//!   their MBR the query covers
//! - **Budgeted Memory**: all long-lived buffers are allocated through a
//!   [`tilestore_memory::MemoryTracker`]
//! - **Lazy Fragment Metadata**: R-tree, tile offsets and tile min/max
//!   values are read from a [`GenericTileSource`] on first use
//!
//! ## R-Tree API
//!
//! ```rust
//! use tilestore_memory::{pmr::Allocator, MemoryTrackerManager};
//! use tilestore_rtree::{ndrange_in, Datatype, Dimension, Domain, RTree, Range};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let domain = Domain::new(vec![Dimension::new("d", Datatype::Int32).with_domain(1i32, 1000i32)?]);
//! let manager = MemoryTrackerManager::new();
//! let alloc = Allocator::default();
//! let mbr = |start: i32, end: i32| -> Result<_, Box<dyn std::error::Error>> {
//!     Ok(ndrange_in([Range::from_values_in(start, end, alloc.clone())?], alloc.clone())?)
//! };
//!
//! let mut tree = RTree::new(Some(&domain), 3, manager.create_tracker());
//! tree.set_leaves(&[mbr(1, 3)?, mbr(5, 10)?, mbr(20, 22)?])?;
//! tree.build_tree()?;
//!
//! let overlap = tree.get_tile_overlap(&mbr(2, 9)?, &[false]);
//! assert_eq!(overlap.tiles.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod datatype;
pub mod dimension;
pub mod domain;
pub mod fragment;
pub mod range;
pub mod rtree;
pub mod serialization;

pub use datatype::{Coord, Datatype};
pub use dimension::Dimension;
pub use domain::Domain;
pub use fragment::{
    create_fragment_metadata, FragmentMetadata, GenericTileSource, InMemoryTileSource,
    LoadedMetadata, OndemandFragmentMetadata, V1V2PreloadedFragmentMetadata,
};
pub use range::{ndrange_in, Level, NDRange, Range};
pub use rtree::{RTree, RTreeError, RTreeResult, TileOverlap, RTREE_FANOUT};
pub use serialization::{Deserializer, Serializer};
