use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tilestore_memory::pmr;
use tilestore_memory::{ErrorKind, MemoryError, MemoryTracker, MemoryType};

use super::tile_source::GenericTileSource;
use crate::datatype::Coord;
use crate::domain::Domain;
use crate::range::{NDRange, Range};
use crate::rtree::{RTree, RTreeError, RTreeResult, TileOverlap, RTREE_FANOUT};
use crate::serialization::Deserializer;

/// Which pieces of a fragment's metadata are currently in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedMetadata {
    pub rtree: bool,
    pub tile_offsets: Vec<bool>,
    pub tile_var_offsets: Vec<bool>,
    pub tile_min: Vec<bool>,
    pub tile_max: Vec<bool>,
}

impl LoadedMetadata {
    fn new(attribute_num: usize) -> Self {
        LoadedMetadata {
            rtree: false,
            tile_offsets: vec![false; attribute_num],
            tile_var_offsets: vec![false; attribute_num],
            tile_min: vec![false; attribute_num],
            tile_max: vec![false; attribute_num],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OffsetsKind {
    Fixed,
    Var,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bound {
    Min,
    Max,
}

impl Bound {
    fn memory_type(self) -> MemoryType {
        match self {
            Bound::Min => MemoryType::TileMinVals,
            Bound::Max => MemoryType::TileMaxVals,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Bound::Min => "min",
            Bound::Max => "max",
        }
    }
}

struct TileValues {
    buffer: pmr::Vec<u8>,
    var_buffer: pmr::Vec<u8>,
    // Bytes charged to the tracker's legacy usage for this buffer pair.
    charged: u64,
}

struct MetadataState<'a> {
    rtree: RTree<'a>,
    loaded: LoadedMetadata,
    tile_offsets: Vec<pmr::Vec<u64>>,
    tile_var_offsets: Vec<pmr::Vec<u64>>,
    tile_min: Vec<TileValues>,
    tile_max: Vec<TileValues>,
}

/// State shared by every fragment metadata variant: the R-tree, the
/// per-attribute tile offsets and the per-attribute tile min and max values.
///
/// Long-lived buffers are allocated through the fragment's memory tracker.
/// Loading is serialized by an internal mutex; readers only take a shared
/// lock on the loaded state.
pub struct OffsetsFragmentMetadata<'a> {
    domain: &'a Domain,
    memory_tracker: Arc<MemoryTracker>,
    source: Arc<dyn GenericTileSource>,
    version: u32,
    attribute_num: usize,
    load_lock: Mutex<()>,
    state: RwLock<MetadataState<'a>>,
}

impl<'a> OffsetsFragmentMetadata<'a> {
    /// `rtree_domain` is the domain the R-tree starts out with; pass `None`
    /// for fragments whose R-tree is never loaded.
    pub(crate) fn new(
        domain: &'a Domain,
        rtree_domain: Option<&'a Domain>,
        memory_tracker: Arc<MemoryTracker>,
        source: Arc<dyn GenericTileSource>,
        attribute_num: usize,
    ) -> Self {
        let offsets_alloc = memory_tracker.get_allocator(MemoryType::TileOffsets);
        let values = |bound: Bound| {
            let alloc = memory_tracker.get_allocator(bound.memory_type());
            (0..attribute_num)
                .map(|_| TileValues {
                    buffer: pmr::Vec::new_in(alloc.clone()),
                    var_buffer: pmr::Vec::new_in(alloc.clone()),
                    charged: 0,
                })
                .collect::<Vec<_>>()
        };

        let state = MetadataState {
            rtree: RTree::new(rtree_domain, RTREE_FANOUT, Arc::clone(&memory_tracker)),
            loaded: LoadedMetadata::new(attribute_num),
            tile_offsets: (0..attribute_num)
                .map(|_| pmr::Vec::new_in(offsets_alloc.clone()))
                .collect(),
            tile_var_offsets: (0..attribute_num)
                .map(|_| pmr::Vec::new_in(offsets_alloc.clone()))
                .collect(),
            tile_min: values(Bound::Min),
            tile_max: values(Bound::Max),
        };

        OffsetsFragmentMetadata {
            domain,
            version: source.format_version(),
            memory_tracker,
            source,
            attribute_num,
            load_lock: Mutex::new(()),
            state: RwLock::new(state),
        }
    }

    pub fn domain(&self) -> &'a Domain {
        self.domain
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn attribute_num(&self) -> usize {
        self.attribute_num
    }

    pub fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.memory_tracker
    }

    pub fn loaded_metadata(&self) -> LoadedMetadata {
        self.state.read().loaded.clone()
    }

    /// Shared access to the R-tree. Hold the guard briefly; loaders wait on it.
    pub fn rtree(&self) -> MappedRwLockReadGuard<'_, RTree<'a>> {
        RwLockReadGuard::map(self.state.read(), |state| &state.rtree)
    }

    /// Number of tiles, i.e. R-tree leaves.
    pub fn tile_num(&self) -> u64 {
        self.state.read().rtree.leaf_num()
    }

    /// Tiles overlapping `range`. Empty for fragments whose R-tree has no
    /// domain; fails if the R-tree has not been loaded.
    pub fn get_tile_overlap(&self, range: &NDRange, is_default: &[bool]) -> RTreeResult<TileOverlap> {
        let state = self.state.read();
        if state.rtree.domain().is_none() {
            return Ok(TileOverlap::default());
        }
        if !state.loaded.rtree {
            return Err(not_loaded("R-tree"));
        }
        Ok(state.rtree.get_tile_overlap(range, is_default))
    }

    pub fn compute_tile_bitmap(&self, range: &Range, d: usize, tile_bitmap: &mut [u8]) -> RTreeResult<()> {
        let state = self.state.read();
        if state.rtree.domain().is_none() {
            return Ok(());
        }
        if !state.loaded.rtree {
            return Err(not_loaded("R-tree"));
        }
        state.rtree.compute_tile_bitmap(range, d, tile_bitmap)
    }

    /// Frees the R-tree and returns its bytes to the tracker's legacy usage.
    /// Returns the number of bytes released.
    pub fn free_rtree(&self) -> u64 {
        let _guard = self.load_lock.lock();
        let mut state = self.state.write();
        let freed = state.rtree.free_memory();
        self.memory_tracker.release_memory(freed, MemoryType::RTree);
        state.loaded.rtree = false;
        freed
    }

    /// Drops every loaded tile offsets buffer.
    pub fn free_tile_offsets(&self) {
        let _guard = self.load_lock.lock();
        let mut state = self.state.write();
        let state = &mut *state;
        for offsets in state
            .tile_offsets
            .iter_mut()
            .chain(state.tile_var_offsets.iter_mut())
        {
            offsets.release();
        }
        state.loaded.tile_offsets.fill(false);
        state.loaded.tile_var_offsets.fill(false);
    }

    pub fn tile_offset(&self, idx: usize, tile_idx: u64) -> RTreeResult<u64> {
        self.offset(OffsetsKind::Fixed, idx, tile_idx)
    }

    pub fn tile_var_offset(&self, idx: usize, tile_idx: u64) -> RTreeResult<u64> {
        self.offset(OffsetsKind::Var, idx, tile_idx)
    }

    fn offset(&self, kind: OffsetsKind, idx: usize, tile_idx: u64) -> RTreeResult<u64> {
        self.check_idx(idx)?;
        let state = self.state.read();
        let (loaded, offsets, name) = match kind {
            OffsetsKind::Fixed => (
                state.loaded.tile_offsets[idx],
                &state.tile_offsets[idx],
                "tile offsets",
            ),
            OffsetsKind::Var => (
                state.loaded.tile_var_offsets[idx],
                &state.tile_var_offsets[idx],
                "tile var offsets",
            ),
        };
        if !loaded {
            return Err(not_loaded(name));
        }
        offsets.get(tile_idx as usize).copied().ok_or_else(|| {
            RTreeError::InvalidOperation(format!(
                "Tile index {} is out of bounds for {} tiles",
                tile_idx,
                offsets.len()
            ))
        })
    }

    /// Minimum value of fixed-size attribute `idx` in tile `tile_idx`.
    pub fn get_tile_min_as<T: Coord>(&self, idx: usize, tile_idx: u64) -> RTreeResult<T> {
        self.tile_value(Bound::Min, idx, tile_idx)
    }

    /// Maximum value of fixed-size attribute `idx` in tile `tile_idx`.
    pub fn get_tile_max_as<T: Coord>(&self, idx: usize, tile_idx: u64) -> RTreeResult<T> {
        self.tile_value(Bound::Max, idx, tile_idx)
    }

    fn tile_value<T: Coord>(&self, bound: Bound, idx: usize, tile_idx: u64) -> RTreeResult<T> {
        self.check_idx(idx)?;
        let state = self.state.read();
        let (loaded, values) = match bound {
            Bound::Min => (state.loaded.tile_min[idx], &state.tile_min[idx]),
            Bound::Max => (state.loaded.tile_max[idx], &state.tile_max[idx]),
        };
        if !loaded {
            return Err(not_loaded(&format!("tile {} values", bound.name())));
        }
        if !values.var_buffer.is_empty() {
            return Err(RTreeError::InvalidOperation(format!(
                "Tile {} values of attribute {} are variable-sized",
                bound.name(),
                idx
            )));
        }

        let start = (tile_idx as usize).saturating_mul(T::SIZE);
        values
            .buffer
            .get(start..start.saturating_add(T::SIZE))
            .and_then(T::from_le_slice)
            .ok_or_else(|| {
                RTreeError::InvalidOperation(format!(
                    "Tile index {} is out of bounds for tile {} values of attribute {}",
                    tile_idx,
                    bound.name(),
                    idx
                ))
            })
    }

    fn check_idx(&self, idx: usize) -> RTreeResult<()> {
        if idx >= self.attribute_num {
            return Err(RTreeError::InvalidOperation(format!(
                "Attribute index {} is out of bounds for {} attributes",
                idx, self.attribute_num
            )));
        }
        Ok(())
    }

    pub(crate) fn load_lock(&self) -> MutexGuard<'_, ()> {
        self.load_lock.lock()
    }

    /// Reads and deserializes the R-tree, charging its serialized size to
    /// the tracker's legacy usage.
    pub(crate) fn load_rtree_from_source(&self) -> RTreeResult<()> {
        let _guard = self.load_lock();
        if self.state.read().loaded.rtree {
            return Ok(());
        }

        let tile = self.source.read_rtree()?;
        let size = tile.len() as u64;
        if !self.memory_tracker.take_memory(size, MemoryType::RTree) {
            return Err(self.budget_error("R-tree", size));
        }

        let mut state = self.state.write();
        let mut deserializer = Deserializer::new(&tile);
        if let Err(err) = state
            .rtree
            .deserialize(&mut deserializer, self.domain, self.version)
        {
            self.memory_tracker.release_memory(size, MemoryType::RTree);
            return Err(err);
        }
        // free_rtree releases what the tree consumed; drop the charge for any
        // trailing bytes now.
        let consumed = state.rtree.deserialized_buffer_size();
        if consumed < size {
            self.memory_tracker
                .release_memory(size - consumed, MemoryType::RTree);
        }
        state.loaded.rtree = true;
        Ok(())
    }

    pub(crate) fn load_tile_offsets_from_source(&self, kind: OffsetsKind, idx: usize) -> RTreeResult<()> {
        self.check_idx(idx)?;
        if self.offsets_loaded(kind, idx) {
            return Ok(());
        }
        let _guard = self.load_lock();
        if self.offsets_loaded(kind, idx) {
            return Ok(());
        }

        let tile = match kind {
            OffsetsKind::Fixed => self.source.read_tile_offsets(idx)?,
            OffsetsKind::Var => self.source.read_tile_var_offsets(idx)?,
        };
        let alloc = self.memory_tracker.get_allocator(MemoryType::TileOffsets);
        let mut deserializer = Deserializer::new(&tile);
        let num = deserializer.read_len()?;
        if num > deserializer.remaining() / 8 {
            return Err(RTreeError::Serialization(format!(
                "Tile offsets tile claims {} offsets but holds {} bytes",
                num,
                deserializer.remaining()
            )));
        }
        let mut offsets = pmr::Vec::with_capacity_in(num, alloc)?;
        for _ in 0..num {
            offsets.push(deserializer.read_u64()?)?;
        }

        let mut state = self.state.write();
        match kind {
            OffsetsKind::Fixed => {
                state.tile_offsets[idx] = offsets;
                state.loaded.tile_offsets[idx] = true;
            }
            OffsetsKind::Var => {
                state.tile_var_offsets[idx] = offsets;
                state.loaded.tile_var_offsets[idx] = true;
            }
        }
        Ok(())
    }

    fn offsets_loaded(&self, kind: OffsetsKind, idx: usize) -> bool {
        let state = self.state.read();
        match kind {
            OffsetsKind::Fixed => state.loaded.tile_offsets[idx],
            OffsetsKind::Var => state.loaded.tile_var_offsets[idx],
        }
    }

    /// Reads tile min or max values. A tile with an empty fixed buffer loads
    /// as empty without touching the budget.
    pub(crate) fn load_tile_values_from_source(&self, bound: Bound, idx: usize) -> RTreeResult<()> {
        self.check_idx(idx)?;
        let _guard = self.load_lock();
        if self.values_loaded(bound, idx) {
            return Ok(());
        }

        let tile = match bound {
            Bound::Min => self.source.read_tile_min(idx)?,
            Bound::Max => self.source.read_tile_max(idx)?,
        };
        let mut deserializer = Deserializer::new(&tile);
        let buffer_size = deserializer.read_len()?;
        let var_buffer_size = deserializer.read_len()?;

        let memory_type = bound.memory_type();
        let alloc = self.memory_tracker.get_allocator(memory_type);
        let mut values = TileValues {
            buffer: pmr::Vec::new_in(alloc.clone()),
            var_buffer: pmr::Vec::new_in(alloc.clone()),
            charged: 0,
        };

        if buffer_size != 0 {
            let buffer = deserializer.read_bytes(buffer_size)?;
            let var_buffer = deserializer.read_bytes(var_buffer_size)?;
            let size = (buffer_size + var_buffer_size) as u64;
            if !self.memory_tracker.take_memory(size, memory_type) {
                return Err(self.budget_error(&format!("{} values", bound.name()), size));
            }
            values.charged = size;

            let copied = pmr::Vec::from_slice_in(buffer, alloc.clone()).and_then(|buffer| {
                Ok((buffer, pmr::Vec::from_slice_in(var_buffer, alloc.clone())?))
            });
            match copied {
                Ok((buffer, var_buffer)) => {
                    values.buffer = buffer;
                    values.var_buffer = var_buffer;
                }
                Err(err) => {
                    self.memory_tracker.release_memory(size, memory_type);
                    return Err(err.into());
                }
            }
        }

        let mut state = self.state.write();
        let state = &mut *state;
        let (slot, loaded) = match bound {
            Bound::Min => (&mut state.tile_min[idx], &mut state.loaded.tile_min[idx]),
            Bound::Max => (&mut state.tile_max[idx], &mut state.loaded.tile_max[idx]),
        };
        *slot = values;
        *loaded = true;
        Ok(())
    }

    fn values_loaded(&self, bound: Bound, idx: usize) -> bool {
        let state = self.state.read();
        match bound {
            Bound::Min => state.loaded.tile_min[idx],
            Bound::Max => state.loaded.tile_max[idx],
        }
    }

    /// Marks the R-tree as loaded without reading it.
    pub(crate) fn mark_rtree_loaded(&self) {
        self.state.write().loaded.rtree = true;
    }

    fn budget_error(&self, what: &str, needed: u64) -> RTreeError {
        RTreeError::Memory(MemoryError::new(
            &format!(
                "Cannot load {}; Insufficient memory budget; Needed {} but only had {} from budget {}",
                what,
                needed,
                self.memory_tracker.get_memory_available(),
                self.memory_tracker.get_memory_budget()
            ),
            ErrorKind::BudgetExceeded,
        ))
    }
}

impl Drop for OffsetsFragmentMetadata<'_> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let freed = state.rtree.free_memory();
        self.memory_tracker.release_memory(freed, MemoryType::RTree);
        for (bound, values) in [(Bound::Min, &state.tile_min), (Bound::Max, &state.tile_max)] {
            let charged: u64 = values.iter().map(|v| v.charged).sum();
            self.memory_tracker
                .release_memory(charged, bound.memory_type());
        }
    }
}

fn not_loaded(what: &str) -> RTreeError {
    RTreeError::NotLoaded(format!(
        "Trying to access {} metadata that's not loaded",
        what
    ))
}
