use parking_lot::MappedRwLockReadGuard;

use super::offsets::{LoadedMetadata, OffsetsFragmentMetadata};
use crate::datatype::Coord;
use crate::range::{NDRange, Range};
use crate::rtree::{RTree, RTreeResult, TileOverlap};

/// The loading and query surface of one fragment's metadata.
///
/// Each format family implements the loaders; everything else is answered
/// from the shared [`OffsetsFragmentMetadata`] state.
pub trait FragmentMetadata<'a>: Send + Sync {
    fn offsets(&self) -> &OffsetsFragmentMetadata<'a>;

    fn load_rtree(&self) -> RTreeResult<()>;

    fn load_tile_offsets(&self, idx: usize) -> RTreeResult<()>;

    fn load_tile_var_offsets(&self, idx: usize) -> RTreeResult<()>;

    fn load_tile_min_values(&self, idx: usize) -> RTreeResult<()>;

    fn load_tile_max_values(&self, idx: usize) -> RTreeResult<()>;

    fn format_version(&self) -> u32 {
        self.offsets().version()
    }

    fn loaded_metadata(&self) -> LoadedMetadata {
        self.offsets().loaded_metadata()
    }

    fn rtree(&self) -> MappedRwLockReadGuard<'_, RTree<'a>> {
        self.offsets().rtree()
    }

    fn get_tile_overlap(&self, range: &NDRange, is_default: &[bool]) -> RTreeResult<TileOverlap> {
        self.offsets().get_tile_overlap(range, is_default)
    }

    fn compute_tile_bitmap(&self, range: &Range, d: usize, tile_bitmap: &mut [u8]) -> RTreeResult<()> {
        self.offsets().compute_tile_bitmap(range, d, tile_bitmap)
    }

    fn free_rtree(&self) -> u64 {
        self.offsets().free_rtree()
    }

    fn tile_offset(&self, idx: usize, tile_idx: u64) -> RTreeResult<u64> {
        self.offsets().tile_offset(idx, tile_idx)
    }

    fn tile_var_offset(&self, idx: usize, tile_idx: u64) -> RTreeResult<u64> {
        self.offsets().tile_var_offset(idx, tile_idx)
    }

    fn get_tile_min_as<T: Coord>(&self, idx: usize, tile_idx: u64) -> RTreeResult<T>
    where
        Self: Sized,
    {
        self.offsets().get_tile_min_as(idx, tile_idx)
    }

    fn get_tile_max_as<T: Coord>(&self, idx: usize, tile_idx: u64) -> RTreeResult<T>
    where
        Self: Sized,
    {
        self.offsets().get_tile_max_as(idx, tile_idx)
    }
}
