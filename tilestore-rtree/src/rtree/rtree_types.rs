//! Error and result types shared by the R-tree and fragment metadata.

use std::io;

use thiserror::Error;
use tilestore_memory::{ErrorKind, MemoryError};

/// Errors raised while building, querying or (de)serializing an R-tree, or
/// while loading fragment metadata.
#[derive(Debug, Error)]
pub enum RTreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Not loaded: {0}")]
    NotLoaded(String),

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),
}

impl RTreeError {
    /// True when the error comes from a refused memory budget, either from a
    /// tracked allocation or from an explicit reservation.
    pub fn is_budget_exceeded(&self) -> bool {
        match self {
            RTreeError::Memory(err) => err.is_budget_exceeded(),
            _ => false,
        }
    }
}

impl From<RTreeError> for MemoryError {
    fn from(err: RTreeError) -> Self {
        match err {
            RTreeError::Io(io_err) => {
                MemoryError::new(&format!("R-tree I/O error: {}", io_err), ErrorKind::IOError)
            }
            RTreeError::Serialization(msg) => MemoryError::new(&msg, ErrorKind::EncodingError),
            RTreeError::InvalidOperation(msg) | RTreeError::NotLoaded(msg) => {
                MemoryError::new(&msg, ErrorKind::InvalidOperation)
            }
            RTreeError::Memory(err) => err,
            RTreeError::UnsupportedVersion(version) => MemoryError::new(
                &format!("Unsupported format version {}", version),
                ErrorKind::EncodingError,
            ),
        }
    }
}

/// Result type for R-tree operations
pub type RTreeResult<T> = Result<T, RTreeError>;

/// Tiles of a fragment that overlap a query range.
///
/// `tile_ranges` lists inclusive runs of tile ids fully covered by the query.
/// `tiles` lists single tiles that are only partially covered, together with
/// the fraction of the tile the query covers, in `(0, 1)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileOverlap {
    pub tiles: Vec<(u64, f64)>,
    pub tile_ranges: Vec<(u64, u64)>,
}

impl TileOverlap {
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty() && self.tile_ranges.is_empty()
    }

    /// Number of distinct tiles referenced by both lists.
    pub fn tile_count(&self) -> u64 {
        let ranged: u64 = self
            .tile_ranges
            .iter()
            .map(|(start, end)| end - start + 1)
            .sum();
        ranged + self.tiles.len() as u64
    }
}

/// A node visited while traversing the tree: its level (0 is the root) and
/// its index within that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub level: usize,
    pub mbr_idx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_error_round_trip_keeps_budget_kind() {
        let err: RTreeError = MemoryError::new("refused", ErrorKind::BudgetExceeded).into();
        assert!(err.is_budget_exceeded());
        let back: MemoryError = err.into();
        assert_eq!(back.kind(), &ErrorKind::BudgetExceeded);
    }

    #[test]
    fn error_kinds_map_to_memory_kinds() {
        let err: MemoryError = RTreeError::Serialization("short".into()).into();
        assert_eq!(err.kind(), &ErrorKind::EncodingError);
        let err: MemoryError = RTreeError::NotLoaded("offsets".into()).into();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
        let err: MemoryError = RTreeError::UnsupportedVersion(0).into();
        assert_eq!(err.message(), "Unsupported format version 0");
    }

    #[test]
    fn tile_overlap_counts() {
        let overlap = TileOverlap {
            tiles: vec![(9, 0.5)],
            tile_ranges: vec![(0, 2), (5, 5)],
        };
        assert_eq!(overlap.tile_count(), 5);
        assert!(!overlap.is_empty());
        assert!(TileOverlap::default().is_empty());
    }
}
