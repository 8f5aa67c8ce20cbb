use std::sync::Arc;

use tilestore_memory::MemoryTracker;

use super::metadata::FragmentMetadata;
use super::offsets::{OffsetsFragmentMetadata, OffsetsKind};
use super::tile_source::GenericTileSource;
use crate::domain::Domain;
use crate::rtree::RTreeResult;

/// Metadata of a fragment in format version 1 or 2.
///
/// These fragments keep their metadata in one file that is read as a whole
/// by [`load_all`](V1V2PreloadedFragmentMetadata::load_all). Their R-tree
/// carries no domain, so overlap queries find nothing and tile bitmaps are
/// left untouched. Tile min and max values do not exist in these formats.
pub struct V1V2PreloadedFragmentMetadata<'a> {
    offsets: OffsetsFragmentMetadata<'a>,
}

impl<'a> V1V2PreloadedFragmentMetadata<'a> {
    pub fn new(
        domain: &'a Domain,
        memory_tracker: Arc<MemoryTracker>,
        source: Arc<dyn GenericTileSource>,
        attribute_num: usize,
    ) -> Self {
        V1V2PreloadedFragmentMetadata {
            offsets: OffsetsFragmentMetadata::new(domain, None, memory_tracker, source, attribute_num),
        }
    }

    /// Loads the tile offsets of every attribute. Idempotent.
    pub fn load_all(&self) -> RTreeResult<()> {
        if self.is_loaded() {
            return Ok(());
        }
        for idx in 0..self.offsets.attribute_num() {
            self.offsets
                .load_tile_offsets_from_source(OffsetsKind::Fixed, idx)?;
        }
        self.offsets.mark_rtree_loaded();
        log::debug!(
            "Preloaded metadata of a version {} fragment with {} attributes",
            self.offsets.version(),
            self.offsets.attribute_num()
        );
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.offsets.loaded_metadata().rtree
    }
}

impl<'a> FragmentMetadata<'a> for V1V2PreloadedFragmentMetadata<'a> {
    fn offsets(&self) -> &OffsetsFragmentMetadata<'a> {
        &self.offsets
    }

    fn load_rtree(&self) -> RTreeResult<()> {
        self.load_all()
    }

    fn load_tile_offsets(&self, _idx: usize) -> RTreeResult<()> {
        self.load_all()
    }

    fn load_tile_var_offsets(&self, idx: usize) -> RTreeResult<()> {
        self.offsets
            .load_tile_offsets_from_source(OffsetsKind::Var, idx)
    }

    fn load_tile_min_values(&self, _idx: usize) -> RTreeResult<()> {
        Ok(())
    }

    fn load_tile_max_values(&self, _idx: usize) -> RTreeResult<()> {
        Ok(())
    }
}
