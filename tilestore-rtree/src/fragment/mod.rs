//! Fragment metadata: the per-fragment R-tree, tile offsets and tile
//! min/max values, loaded lazily from a [`GenericTileSource`] and charged to
//! the fragment's memory tracker.
//!
//! Fragments written in format version 1 or 2 are handled by
//! [`V1V2PreloadedFragmentMetadata`]; later versions by
//! [`OndemandFragmentMetadata`]. [`create_fragment_metadata`] picks the
//! variant from the source's format version.

mod metadata;
mod offsets;
mod ondemand;
pub mod tile_source;
mod v1v2;

use std::sync::Arc;

use tilestore_memory::MemoryTracker;

pub use metadata::FragmentMetadata;
pub use offsets::{LoadedMetadata, OffsetsFragmentMetadata};
pub use ondemand::OndemandFragmentMetadata;
pub use tile_source::{encode_tile_min_max, encode_tile_offsets, GenericTileSource, InMemoryTileSource};
pub use v1v2::V1V2PreloadedFragmentMetadata;

use crate::domain::Domain;
use crate::rtree::{RTreeError, RTreeResult, ONDEMAND_FORMAT_VERSION};

/// Creates the metadata variant matching `source`'s format version. Nothing
/// is read until one of the loaders is called.
pub fn create_fragment_metadata<'a>(
    domain: &'a Domain,
    memory_tracker: Arc<MemoryTracker>,
    source: Arc<dyn GenericTileSource>,
    attribute_num: usize,
) -> RTreeResult<Box<dyn FragmentMetadata<'a> + 'a>> {
    let version = source.format_version();
    if version == 0 {
        return Err(RTreeError::UnsupportedVersion(version));
    }

    log::debug!("Creating metadata for a version {} fragment", version);
    if version < ONDEMAND_FORMAT_VERSION {
        Ok(Box::new(V1V2PreloadedFragmentMetadata::new(
            domain,
            memory_tracker,
            source,
            attribute_num,
        )))
    } else {
        Ok(Box::new(OndemandFragmentMetadata::new(
            domain,
            memory_tracker,
            source,
            attribute_num,
        )))
    }
}
