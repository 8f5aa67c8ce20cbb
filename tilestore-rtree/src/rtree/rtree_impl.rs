//! Bulk-loaded R-tree over the MBRs of a fragment's tiles.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tilestore_memory::pmr::{self, Allocator, TryCloneIn};
use tilestore_memory::{MemoryTracker, MemoryType};

use super::rtree_constants::VAR_SIZE_FORMAT_VERSION;
use super::rtree_types::{Entry, RTreeError, RTreeResult, TileOverlap};
use crate::domain::Domain;
use crate::range::{Level, NDRange, Range};
use crate::serialization::{Deserializer, Serializer};

/// A static R-tree whose leaves are the MBRs of a fragment's tiles.
///
/// The tree is built bottom-up from a complete leaf level: every `fanout`
/// consecutive nodes of a level are merged into one parent, until a single
/// root remains. Levels are stored root first, so `levels[0]` holds the root
/// and the last level holds the leaves. A tree with no levels is empty.
///
/// All level storage is charged to the tracker's [`MemoryType::RTree`]
/// counter.
pub struct RTree<'a> {
    domain: Option<&'a Domain>,
    fanout: u32,
    levels: pmr::Vec<Level>,
    memory_tracker: Arc<MemoryTracker>,
    alloc: Allocator,
    deserialized_buffer_size: u64,
}

impl<'a> RTree<'a> {
    /// Creates an empty tree. Nothing is allocated until leaves are set.
    pub fn new(domain: Option<&'a Domain>, fanout: u32, memory_tracker: Arc<MemoryTracker>) -> Self {
        let alloc = memory_tracker.get_allocator(MemoryType::RTree);
        RTree {
            domain,
            fanout,
            levels: pmr::Vec::new_in(alloc.clone()),
            memory_tracker,
            alloc,
            deserialized_buffer_size: 0,
        }
    }

    pub fn domain(&self) -> Option<&'a Domain> {
        self.domain
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn dim_num(&self) -> usize {
        self.domain.map(Domain::dim_num).unwrap_or(0)
    }

    pub fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.memory_tracker
    }

    /// Bytes of serialized input consumed by the last [`RTree::deserialize`],
    /// or 0 if the tree was not deserialized.
    pub fn deserialized_buffer_size(&self) -> u64 {
        self.deserialized_buffer_size
    }

    /// The leaf level; empty if the tree is empty.
    pub fn leaves(&self) -> &[NDRange] {
        self.levels.last().map(|level| level.as_slice()).unwrap_or(&[])
    }

    pub fn leaf_num(&self) -> u64 {
        self.leaves().len() as u64
    }

    pub fn leaf(&self, leaf_idx: u64) -> RTreeResult<&NDRange> {
        self.leaves().get(leaf_idx as usize).ok_or_else(|| {
            RTreeError::InvalidOperation(format!(
                "Leaf index {} is out of bounds; the tree has {} leaves",
                leaf_idx,
                self.leaf_num()
            ))
        })
    }

    /// Number of leaves under one node of `level`; 0 past the leaf level.
    pub fn subtree_leaf_num(&self, level: usize) -> u64 {
        let height = self.height();
        if level >= height {
            return 0;
        }
        let exponent = u32::try_from(height - level - 1).unwrap_or(u32::MAX);
        (self.fanout as u64).saturating_pow(exponent)
    }

    /// Replaces leaf `leaf_id`. Only valid while the tree holds just its leaf
    /// level, i.e. after [`RTree::set_leaf_num`] and before
    /// [`RTree::build_tree`].
    pub fn set_leaf(&mut self, leaf_id: u64, mbr: &NDRange) -> RTreeResult<()> {
        if self.levels.len() != 1 {
            return Err(RTreeError::InvalidOperation(
                "Cannot set leaf; the tree must contain exactly the leaf level".to_string(),
            ));
        }
        let copy = mbr.try_clone_in(&self.alloc)?;
        let leaves = &mut self.levels[0];
        let leaf_num = leaves.len();
        match leaves.get_mut(leaf_id as usize) {
            Some(slot) => {
                *slot = copy;
                Ok(())
            }
            None => Err(RTreeError::InvalidOperation(format!(
                "Cannot set leaf; leaf index {} is out of bounds for {} leaves",
                leaf_id, leaf_num
            ))),
        }
    }

    /// Sizes the leaf level to `num` leaves. New leaves are empty MBRs. The
    /// leaf level can only grow.
    pub fn set_leaf_num(&mut self, num: u64) -> RTreeResult<()> {
        if self.levels.len() != 1 {
            self.levels.clear();
            self.levels.push(Level::new_in(self.alloc.clone()))?;
        }
        let current = self.levels[0].len() as u64;
        if num < current {
            return Err(RTreeError::InvalidOperation(format!(
                "Cannot set number of leaves; {} is smaller than the current leaf number {}",
                num, current
            )));
        }
        let num = usize::try_from(num).map_err(|_| {
            RTreeError::InvalidOperation(format!("Cannot set number of leaves to {}", num))
        })?;
        let alloc = self.alloc.clone();
        self.levels[0].resize_with(num, || NDRange::new_in(alloc.clone()))?;
        Ok(())
    }

    /// Discards the tree and installs a copy of `leaves` as its only level.
    pub fn set_leaves(&mut self, leaves: &[NDRange]) -> RTreeResult<()> {
        self.levels.clear();
        let mut level = Level::with_capacity_in(leaves.len(), self.alloc.clone())?;
        for leaf in leaves {
            level.push(leaf.try_clone_in(&self.alloc)?)?;
        }
        self.levels.push(level)?;
        Ok(())
    }

    /// Builds the upper levels from the leaf level.
    ///
    /// An empty tree, or one with at most one leaf, is left as is. Fails if
    /// the tree already has more than one level or the fanout is below 2.
    pub fn build_tree(&mut self) -> RTreeResult<()> {
        if self.levels.is_empty() {
            return Ok(());
        }
        if self.levels.len() != 1 {
            return Err(RTreeError::InvalidOperation(
                "Cannot build R-tree; the tree must contain only the leaf level".to_string(),
            ));
        }
        let leaf_num = self.levels[0].len();
        if leaf_num <= 1 {
            return Ok(());
        }
        if self.fanout < 2 {
            return Err(RTreeError::InvalidOperation(format!(
                "Cannot build R-tree; fanout {} must be at least 2",
                self.fanout
            )));
        }
        let domain = self.domain.ok_or_else(|| {
            RTreeError::InvalidOperation("Cannot build R-tree without a domain".to_string())
        })?;

        // Levels are built leaf first and flipped at the end.
        while let Some(last) = self.levels.last() {
            if last.len() <= 1 {
                break;
            }
            let parent = build_level(domain, self.fanout as usize, &self.alloc, last)?;
            self.levels.push(parent)?;
        }
        self.levels.reverse();

        log::debug!(
            "Built R-tree with {} leaves, fanout {} and height {}",
            leaf_num,
            self.fanout,
            self.height()
        );
        Ok(())
    }

    /// Tiles whose MBRs overlap `range`.
    ///
    /// Nodes fully covered by `range` contribute their whole run of leaves as
    /// a tile range; partially covered leaves are reported with their
    /// overlap ratio. Dimensions flagged in `is_default` are ignored. A tree
    /// without a domain or without levels overlaps nothing.
    pub fn get_tile_overlap(&self, range: &NDRange, is_default: &[bool]) -> TileOverlap {
        let mut overlap = TileOverlap::default();
        let Some(domain) = self.domain else {
            return overlap;
        };
        if self.levels.is_empty() {
            return overlap;
        }

        let leaf_level = self.height() - 1;
        let leaf_num = self.leaf_num();
        let fanout = self.fanout as u64;
        let mut stack = vec![Entry {
            level: 0,
            mbr_idx: 0,
        }];

        while let Some(entry) = stack.pop() {
            let Some(mbr) = self.levels[entry.level].get(entry.mbr_idx as usize) else {
                continue;
            };
            let ratio = domain.overlap_ratio(range, is_default, mbr);

            if ratio == 0.0 {
                continue;
            }

            if ratio == 1.0 {
                let subtree_leaf_num = self.subtree_leaf_num(entry.level);
                let start = entry.mbr_idx * subtree_leaf_num;
                let end = start + subtree_leaf_num.min(leaf_num - start) - 1;
                overlap.tile_ranges.push((start, end));
                continue;
            }

            if entry.level == leaf_level {
                overlap.tiles.push((entry.mbr_idx, ratio));
                continue;
            }

            push_children(&mut stack, entry, fanout, self.levels[entry.level + 1].len());
        }

        overlap
    }

    /// Sets `tile_bitmap[i] = 1` for every tile `i` whose MBR overlaps
    /// `range` on dimension `dim_idx`. Other entries are left untouched.
    pub fn compute_tile_bitmap(
        &self,
        range: &Range,
        dim_idx: usize,
        tile_bitmap: &mut [u8],
    ) -> RTreeResult<()> {
        let Some(domain) = self.domain else {
            return Ok(());
        };
        if self.levels.is_empty() {
            return Ok(());
        }
        let dim = domain.dimension_ptr(dim_idx).ok_or_else(|| {
            RTreeError::InvalidOperation(format!(
                "Dimension index {} is out of bounds for {} dimensions",
                dim_idx,
                domain.dim_num()
            ))
        })?;
        let leaf_num = self.leaf_num();
        if (tile_bitmap.len() as u64) < leaf_num {
            return Err(RTreeError::InvalidOperation(format!(
                "Tile bitmap holds {} entries but the tree has {} leaves",
                tile_bitmap.len(),
                leaf_num
            )));
        }

        let leaf_level = self.height() - 1;
        let fanout = self.fanout as u64;
        let mut stack = vec![Entry {
            level: 0,
            mbr_idx: 0,
        }];

        while let Some(entry) = stack.pop() {
            let Some(mbr) = self.levels[entry.level]
                .get(entry.mbr_idx as usize)
                .and_then(|mbr| mbr.get(dim_idx))
            else {
                continue;
            };
            if !dim.overlap(range, mbr) {
                continue;
            }

            if dim.covered(mbr, range) {
                let subtree_leaf_num = self.subtree_leaf_num(entry.level);
                let start = entry.mbr_idx * subtree_leaf_num;
                let end = (start + subtree_leaf_num).min(leaf_num);
                tile_bitmap[start as usize..end as usize].fill(1);
                continue;
            }

            if entry.level == leaf_level {
                tile_bitmap[entry.mbr_idx as usize] = 1;
                continue;
            }

            push_children(&mut stack, entry, fanout, self.levels[entry.level + 1].len());
        }

        Ok(())
    }

    /// Writes the tree in the current format.
    ///
    /// Layout: `fanout: u32`, `level_num: u32`, then per level
    /// `mbr_num: u64` followed by every MBR. A fixed-size range is written as
    /// its raw bytes; a variable-size range as `size: u64`,
    /// `start_size: u64` and its bytes.
    pub fn serialize(&self, serializer: &mut Serializer) -> RTreeResult<()> {
        serializer.write_u32(self.fanout);
        serializer.write_u32(self.levels.len() as u32);
        if self.levels.is_empty() {
            return Ok(());
        }

        let domain = self.domain.ok_or_else(|| {
            RTreeError::Serialization("Cannot serialize R-tree without a domain".to_string())
        })?;

        for level in self.levels.iter() {
            serializer.write_u64(level.len() as u64);
            for mbr in level.iter() {
                for (d, dim) in domain.dimensions().iter().enumerate() {
                    let range = mbr.get(d).ok_or_else(|| {
                        RTreeError::Serialization(format!("MBR is missing dimension {}", d))
                    })?;
                    if dim.var_size() {
                        serializer.write_u64(range.size());
                        serializer.write_u64(range.start_size());
                    } else if range.size() as usize != 2 * dim.coord_size() {
                        return Err(RTreeError::Serialization(format!(
                            "MBR range on dimension {} holds {} bytes; expected {}",
                            dim.name(),
                            range.size(),
                            2 * dim.coord_size()
                        )));
                    }
                    serializer.write_bytes(range.data());
                }
            }
        }
        Ok(())
    }

    /// Replaces the tree with one read from `deserializer`, written in format
    /// `version`, and adopts `domain`.
    ///
    /// On failure the tree is left empty.
    pub fn deserialize(
        &mut self,
        deserializer: &mut Deserializer<'_>,
        domain: &'a Domain,
        version: u32,
    ) -> RTreeResult<()> {
        if version == 0 {
            return Err(RTreeError::UnsupportedVersion(version));
        }

        self.levels.clear();
        self.deserialized_buffer_size = 0;
        let start = deserializer.consumed();

        let (fanout, levels) = if version < VAR_SIZE_FORMAT_VERSION {
            self.deserialize_v1_v4(deserializer, domain)?
        } else {
            self.deserialize_v5(deserializer, domain)?
        };
        if levels.len() > 1 && fanout < 2 {
            return Err(RTreeError::Serialization(format!(
                "R-tree with {} levels has fanout {}; it must be at least 2",
                levels.len(),
                fanout
            )));
        }

        self.fanout = fanout;
        self.levels = levels;
        self.domain = Some(domain);
        self.deserialized_buffer_size = (deserializer.consumed() - start) as u64;
        log::debug!(
            "Deserialized R-tree of height {} from {} bytes (format version {})",
            self.height(),
            self.deserialized_buffer_size,
            version
        );
        Ok(())
    }

    fn deserialize_v1_v4(
        &self,
        deserializer: &mut Deserializer<'_>,
        domain: &Domain,
    ) -> RTreeResult<(u32, pmr::Vec<Level>)> {
        if let Some(dim) = domain.dimensions().iter().find(|dim| dim.var_size()) {
            return Err(RTreeError::Serialization(format!(
                "Dimension {} is variable-sized, which format versions before {} do not support",
                dim.name(),
                VAR_SIZE_FORMAT_VERSION
            )));
        }

        let _dim_num = deserializer.read_u32()?;
        let fanout = deserializer.read_u32()?;
        let _datatype = deserializer.read_u8()?;
        let level_num = deserializer.read_u32()?;

        let mbr_size: usize = domain
            .dimensions()
            .iter()
            .map(|dim| 2 * dim.coord_size())
            .sum();
        let mut levels = pmr::Vec::new_in(self.alloc.clone());
        for _ in 0..level_num {
            let mbr_num = read_mbr_num(deserializer, mbr_size)?;
            let mut level = Level::with_capacity_in(mbr_num, self.alloc.clone())?;
            for _ in 0..mbr_num {
                let mut mbr = NDRange::with_capacity_in(domain.dim_num(), self.alloc.clone())?;
                for dim in domain.dimensions() {
                    let bytes = deserializer.read_bytes(2 * dim.coord_size())?;
                    mbr.push(Range::from_bytes_in(bytes, self.alloc.clone())?)?;
                }
                level.push(mbr)?;
            }
            levels.push(level)?;
        }
        Ok((fanout, levels))
    }

    fn deserialize_v5(
        &self,
        deserializer: &mut Deserializer<'_>,
        domain: &Domain,
    ) -> RTreeResult<(u32, pmr::Vec<Level>)> {
        let fanout = deserializer.read_u32()?;
        let level_num = deserializer.read_u32()?;

        let min_mbr_size: usize = domain
            .dimensions()
            .iter()
            .map(|dim| if dim.var_size() { 16 } else { 2 * dim.coord_size() })
            .sum();
        let mut levels = pmr::Vec::new_in(self.alloc.clone());
        for _ in 0..level_num {
            let mbr_num = read_mbr_num(deserializer, min_mbr_size)?;
            let mut level = Level::with_capacity_in(mbr_num, self.alloc.clone())?;
            for _ in 0..mbr_num {
                let mut mbr = NDRange::with_capacity_in(domain.dim_num(), self.alloc.clone())?;
                for dim in domain.dimensions() {
                    let range = if dim.var_size() {
                        let size = deserializer.read_len()?;
                        let start_size = deserializer.read_u64()?;
                        let bytes = deserializer.read_bytes(size)?;
                        Range::from_var_bytes_in(bytes, start_size, self.alloc.clone())?
                    } else {
                        let bytes = deserializer.read_bytes(2 * dim.coord_size())?;
                        Range::from_bytes_in(bytes, self.alloc.clone())?
                    };
                    mbr.push(range)?;
                }
                level.push(mbr)?;
            }
            levels.push(level)?;
        }
        Ok((fanout, levels))
    }

    /// Drops every level and returns the serialized size recorded by the
    /// last [`RTree::deserialize`], which is then reset to 0.
    pub fn free_memory(&mut self) -> u64 {
        let freed = self.deserialized_buffer_size;
        self.levels.release();
        self.deserialized_buffer_size = 0;
        freed
    }

    /// Adopts a new domain and fanout and frees the tree. Returns what
    /// [`RTree::free_memory`] returned.
    pub fn reset(&mut self, domain: Option<&'a Domain>, fanout: u32) -> u64 {
        self.domain = domain;
        self.fanout = fanout;
        self.free_memory()
    }
}

impl Debug for RTree<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RTree")
            .field("fanout", &self.fanout)
            .field("height", &self.height())
            .field("leaf_num", &self.leaf_num())
            .field("dim_num", &self.dim_num())
            .field("tracker_id", &self.memory_tracker.get_id())
            .finish()
    }
}

fn build_level(
    domain: &Domain,
    fanout: usize,
    alloc: &Allocator,
    level: &Level,
) -> RTreeResult<Level> {
    let mut parent = Level::with_capacity_in(level.len().div_ceil(fanout), alloc.clone())?;
    for group in level.chunks(fanout) {
        let mut mbr = NDRange::new_in(alloc.clone());
        for child in group {
            domain.expand_ndrange(child, &mut mbr)?;
        }
        parent.push(mbr)?;
    }
    Ok(parent)
}

/// Pushes the children of `entry` so that the leftmost child is popped first.
fn push_children(stack: &mut Vec<Entry>, entry: Entry, fanout: u64, next_level_len: usize) {
    if next_level_len == 0 {
        return;
    }
    let first = entry.mbr_idx * fanout;
    let last = (first + fanout - 1).min(next_level_len as u64 - 1);
    for mbr_idx in (first..=last).rev() {
        stack.push(Entry {
            level: entry.level + 1,
            mbr_idx,
        });
    }
}

fn read_mbr_num(deserializer: &mut Deserializer<'_>, min_mbr_size: usize) -> RTreeResult<usize> {
    let mbr_num = deserializer.read_len()?;
    if mbr_num == 0 {
        return Ok(0);
    }
    if min_mbr_size == 0 || mbr_num > deserializer.remaining() / min_mbr_size {
        return Err(RTreeError::Serialization(format!(
            "R-tree level claims {} MBRs but only {} bytes remain",
            mbr_num,
            deserializer.remaining()
        )));
    }
    Ok(mbr_num)
}
