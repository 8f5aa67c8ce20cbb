use std::sync::Arc;

use tilestore_memory::MemoryTracker;

use super::metadata::FragmentMetadata;
use super::offsets::{Bound, OffsetsFragmentMetadata, OffsetsKind};
use super::tile_source::GenericTileSource;
use crate::domain::Domain;
use crate::rtree::{RTreeResult, TILE_METADATA_FORMAT_VERSION};

/// Metadata of a fragment in format version 3 or later. Every piece is read
/// from the source the first time it is asked for, and only once.
pub struct OndemandFragmentMetadata<'a> {
    offsets: OffsetsFragmentMetadata<'a>,
}

impl<'a> OndemandFragmentMetadata<'a> {
    pub fn new(
        domain: &'a Domain,
        memory_tracker: Arc<MemoryTracker>,
        source: Arc<dyn GenericTileSource>,
        attribute_num: usize,
    ) -> Self {
        OndemandFragmentMetadata {
            offsets: OffsetsFragmentMetadata::new(
                domain,
                Some(domain),
                memory_tracker,
                source,
                attribute_num,
            ),
        }
    }

    fn has_tile_metadata(&self) -> bool {
        self.offsets.version() >= TILE_METADATA_FORMAT_VERSION
    }
}

impl<'a> FragmentMetadata<'a> for OndemandFragmentMetadata<'a> {
    fn offsets(&self) -> &OffsetsFragmentMetadata<'a> {
        &self.offsets
    }

    fn load_rtree(&self) -> RTreeResult<()> {
        self.offsets.load_rtree_from_source()
    }

    fn load_tile_offsets(&self, idx: usize) -> RTreeResult<()> {
        self.offsets
            .load_tile_offsets_from_source(OffsetsKind::Fixed, idx)
    }

    fn load_tile_var_offsets(&self, idx: usize) -> RTreeResult<()> {
        self.offsets
            .load_tile_offsets_from_source(OffsetsKind::Var, idx)
    }

    fn load_tile_min_values(&self, idx: usize) -> RTreeResult<()> {
        if !self.has_tile_metadata() {
            return Ok(());
        }
        self.offsets.load_tile_values_from_source(Bound::Min, idx)
    }

    fn load_tile_max_values(&self, idx: usize) -> RTreeResult<()> {
        if !self.has_tile_metadata() {
            return Ok(());
        }
        self.offsets.load_tile_values_from_source(Bound::Max, idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Coord;
    use crate::dimension::Dimension;
    use crate::fragment::tile_source::{encode_tile_min_max, encode_tile_offsets, InMemoryTileSource};
    use crate::range::{ndrange_in, NDRange, Range};
    use crate::rtree::{RTree, RTreeError};
    use crate::serialization::Serializer;
    use tilestore_memory::pmr::Allocator;
    use tilestore_memory::{MemoryTrackerManager, MemoryType};

    fn domain() -> Domain {
        Domain::new(vec![Dimension::new("d", i32::DATATYPE)
            .with_domain(1i32, 1000i32)
            .unwrap()])
    }

    fn mbr(start: i32, end: i32) -> NDRange {
        let alloc = Allocator::default();
        ndrange_in([Range::from_values_in(start, end, alloc.clone()).unwrap()], alloc).unwrap()
    }

    fn rtree_tile(domain: &Domain) -> Vec<u8> {
        let manager = MemoryTrackerManager::new();
        let mut tree = RTree::new(Some(domain), 3, manager.create_tracker());
        tree.set_leaves(&[mbr(1, 3), mbr(5, 10), mbr(20, 22)])
            .unwrap();
        tree.build_tree().unwrap();
        let mut serializer = Serializer::new();
        tree.serialize(&mut serializer).unwrap();
        serializer.into_inner()
    }

    fn values(items: &[i32]) -> Vec<u8> {
        items.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn source(domain: &Domain, version: u32) -> Arc<InMemoryTileSource> {
        Arc::new(
            InMemoryTileSource::new(version)
                .with_rtree(rtree_tile(domain))
                .with_tile_offsets(0, encode_tile_offsets(&[0, 100, 250]))
                .with_tile_var_offsets(0, encode_tile_offsets(&[0, 7, 9]))
                .with_tile_min(0, encode_tile_min_max(&values(&[1, 5, 20]), &[]))
                .with_tile_max(0, encode_tile_min_max(&values(&[3, 10, 22]), &[])),
        )
    }

    #[test]
    fn test_rtree_loads_once() {
        let domain = domain();
        let source = source(&domain, 12);
        let manager = MemoryTrackerManager::new();
        let tracker = manager.create_tracker();
        let metadata =
            OndemandFragmentMetadata::new(&domain, Arc::clone(&tracker), source.clone(), 1);

        assert!(matches!(
            metadata.get_tile_overlap(&mbr(6, 21), &[false]),
            Err(RTreeError::NotLoaded(_))
        ));

        metadata.load_rtree().unwrap();
        metadata.load_rtree().unwrap();
        assert_eq!(source.read_count(), 1);
        assert!(metadata.loaded_metadata().rtree);
        assert_eq!(metadata.rtree().leaf_num(), 3);

        let tile_len = rtree_tile(&domain).len() as u64;
        assert_eq!(tracker.get_memory_usage_by_type(MemoryType::RTree), tile_len);

        let overlap = metadata.get_tile_overlap(&mbr(6, 21), &[false]).unwrap();
        assert_eq!(overlap.tiles, vec![(1, 5.0 / 6.0), (2, 2.0 / 3.0)]);

        let mut bitmap = vec![0u8; 3];
        let range = Range::from_values_in(4i32, 6i32, Allocator::default()).unwrap();
        metadata.compute_tile_bitmap(&range, 0, &mut bitmap).unwrap();
        assert_eq!(bitmap, vec![0, 1, 0]);

        assert_eq!(metadata.free_rtree(), tile_len);
        assert_eq!(tracker.get_memory_usage(), 0);
        assert!(!metadata.loaded_metadata().rtree);
        assert_eq!(metadata.rtree().height(), 0);

        metadata.load_rtree().unwrap();
        assert_eq!(source.read_count(), 2);
    }

    #[test]
    fn test_rtree_budget_refusal() {
        let domain = domain();
        let manager = MemoryTrackerManager::new();
        let tracker = manager.create_tracker();
        assert!(tracker.set_budget(16));
        let metadata = OndemandFragmentMetadata::new(&domain, Arc::clone(&tracker), source(&domain, 12), 1);

        let err = metadata.load_rtree().err().unwrap();
        assert!(err.is_budget_exceeded());
        let message = err.to_string();
        assert!(message.contains("Cannot load R-tree; Insufficient memory budget; Needed"));
        assert!(message.contains("from budget 16"));
        assert!(!metadata.loaded_metadata().rtree);
        assert_eq!(tracker.get_memory_usage(), 0);
    }

    #[test]
    fn test_tile_offsets() {
        let domain = domain();
        let manager = MemoryTrackerManager::new();
        let tracker = manager.create_tracker();
        let metadata = OndemandFragmentMetadata::new(&domain, Arc::clone(&tracker), source(&domain, 12), 1);

        let err = metadata.tile_offset(0, 1).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Not loaded: Trying to access tile offsets metadata that's not loaded"
        );

        metadata.load_tile_offsets(0).unwrap();
        metadata.load_tile_var_offsets(0).unwrap();
        assert_eq!(metadata.tile_offset(0, 1).unwrap(), 100);
        assert_eq!(metadata.tile_var_offset(0, 2).unwrap(), 9);
        assert!(metadata.tile_offset(0, 3).is_err());
        assert!(metadata.load_tile_offsets(1).is_err());
        assert!(tracker.get_counts().1[&MemoryType::TileOffsets] >= 48);

        metadata.offsets().free_tile_offsets();
        assert!(metadata.tile_offset(0, 1).is_err());
        assert_eq!(tracker.get_counts().1[&MemoryType::TileOffsets], 0);
    }

    #[test]
    fn test_tile_min_max_values() {
        let domain = domain();
        let manager = MemoryTrackerManager::new();
        let tracker = manager.create_tracker();
        let metadata = OndemandFragmentMetadata::new(&domain, Arc::clone(&tracker), source(&domain, 12), 1);

        assert!(matches!(
            metadata.get_tile_min_as::<i32>(0, 0),
            Err(RTreeError::NotLoaded(_))
        ));
        assert!(matches!(
            metadata.get_tile_max_as::<i32>(0, 0),
            Err(RTreeError::NotLoaded(_))
        ));

        metadata.load_tile_min_values(0).unwrap();
        metadata.load_tile_max_values(0).unwrap();
        assert_eq!(metadata.get_tile_min_as::<i32>(0, 1).unwrap(), 5);
        assert_eq!(metadata.get_tile_max_as::<i32>(0, 2).unwrap(), 22);
        assert!(metadata.get_tile_min_as::<i32>(0, 3).is_err());
        assert_eq!(tracker.get_memory_usage_by_type(MemoryType::TileMinVals), 12);
        assert_eq!(tracker.get_memory_usage_by_type(MemoryType::TileMaxVals), 12);

        drop(metadata);
        assert_eq!(tracker.get_memory_usage(), 0);
    }

    #[test]
    fn test_min_values_budget_refusal() {
        let domain = domain();
        let manager = MemoryTrackerManager::new();
        let tracker = manager.create_tracker();
        assert!(tracker.set_budget(4));
        let metadata = OndemandFragmentMetadata::new(&domain, Arc::clone(&tracker), source(&domain, 12), 1);

        let err = metadata.load_tile_min_values(0).err().unwrap();
        assert!(err
            .to_string()
            .contains("Cannot load min values; Insufficient memory budget; Needed 12"));
        assert!(!metadata.loaded_metadata().tile_min[0]);
    }

    #[test]
    fn test_old_versions_have_no_tile_values() {
        let domain = domain();
        let manager = MemoryTrackerManager::new();
        let metadata = OndemandFragmentMetadata::new(&domain, manager.create_tracker(), source(&domain, 10), 1);
        metadata.load_tile_min_values(0).unwrap();
        metadata.load_tile_max_values(0).unwrap();
        assert!(matches!(
            metadata.get_tile_min_as::<i32>(0, 0),
            Err(RTreeError::NotLoaded(_))
        ));
    }
}
