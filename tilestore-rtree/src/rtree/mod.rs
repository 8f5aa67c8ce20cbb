//! Static R-tree over the tile MBRs of a fragment.
//!
//! The tree is bulk-loaded from a complete leaf level, never updated in
//! place, and answers two kinds of queries:
//! - which tiles overlap an N-dimensional range, and by how much
//! - which tiles overlap a one-dimensional range, as a bitmap

pub mod rtree_constants;
pub mod rtree_types;
mod rtree_impl;

pub use rtree_constants::{
    ONDEMAND_FORMAT_VERSION, RTREE_FANOUT, TILE_METADATA_FORMAT_VERSION, VAR_SIZE_FORMAT_VERSION,
};
pub use rtree_impl::RTree;
pub use rtree_types::{RTreeError, RTreeResult, TileOverlap};
