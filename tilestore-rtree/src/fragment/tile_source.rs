use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::rtree::{RTreeError, RTreeResult};
use crate::serialization::Serializer;

/// Where fragment metadata reads its generic tiles from.
///
/// Every method returns the decoded (decompressed, decrypted) bytes of one
/// tile. `idx` is the attribute or dimension index the tile belongs to.
pub trait GenericTileSource: Send + Sync {
    /// Format version the fragment was written with.
    fn format_version(&self) -> u32;

    fn read_rtree(&self) -> RTreeResult<Vec<u8>>;

    fn read_tile_offsets(&self, idx: usize) -> RTreeResult<Vec<u8>>;

    fn read_tile_var_offsets(&self, idx: usize) -> RTreeResult<Vec<u8>>;

    fn read_tile_min(&self, idx: usize) -> RTreeResult<Vec<u8>>;

    fn read_tile_max(&self, idx: usize) -> RTreeResult<Vec<u8>>;
}

/// Encodes a tile-offsets tile: `count: u64` followed by `count` offsets.
pub fn encode_tile_offsets(offsets: &[u64]) -> Vec<u8> {
    let mut serializer = Serializer::new();
    serializer.write_u64(offsets.len() as u64);
    for offset in offsets {
        serializer.write_u64(*offset);
    }
    serializer.into_inner()
}

/// Encodes a tile min or max values tile: `buffer_size: u64`,
/// `var_buffer_size: u64`, the fixed buffer, then the var buffer.
pub fn encode_tile_min_max(buffer: &[u8], var_buffer: &[u8]) -> Vec<u8> {
    let mut serializer = Serializer::new();
    serializer.write_u64(buffer.len() as u64);
    serializer.write_u64(var_buffer.len() as u64);
    serializer.write_bytes(buffer);
    serializer.write_bytes(var_buffer);
    serializer.into_inner()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TileKind {
    Offsets,
    VarOffsets,
    Min,
    Max,
}

/// A [`GenericTileSource`] over tiles held in memory.
///
/// Counts every read so callers can check that metadata is loaded only once.
#[derive(Debug, Default)]
pub struct InMemoryTileSource {
    version: u32,
    rtree: Option<Vec<u8>>,
    tiles: HashMap<(TileKind, usize), Vec<u8>>,
    reads: AtomicUsize,
}

impl InMemoryTileSource {
    pub fn new(version: u32) -> Self {
        InMemoryTileSource {
            version,
            ..Default::default()
        }
    }

    pub fn with_rtree(mut self, tile: Vec<u8>) -> Self {
        self.rtree = Some(tile);
        self
    }

    pub fn with_tile_offsets(mut self, idx: usize, tile: Vec<u8>) -> Self {
        self.tiles.insert((TileKind::Offsets, idx), tile);
        self
    }

    pub fn with_tile_var_offsets(mut self, idx: usize, tile: Vec<u8>) -> Self {
        self.tiles.insert((TileKind::VarOffsets, idx), tile);
        self
    }

    pub fn with_tile_min(mut self, idx: usize, tile: Vec<u8>) -> Self {
        self.tiles.insert((TileKind::Min, idx), tile);
        self
    }

    pub fn with_tile_max(mut self, idx: usize, tile: Vec<u8>) -> Self {
        self.tiles.insert((TileKind::Max, idx), tile);
        self
    }

    /// Number of tiles handed out so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    fn read(&self, kind: TileKind, idx: usize) -> RTreeResult<Vec<u8>> {
        let tile = self.tiles.get(&(kind, idx)).ok_or_else(|| {
            RTreeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No {:?} tile for index {}", kind, idx),
            ))
        })?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(tile.clone())
    }
}

impl GenericTileSource for InMemoryTileSource {
    fn format_version(&self) -> u32 {
        self.version
    }

    fn read_rtree(&self) -> RTreeResult<Vec<u8>> {
        let tile = self.rtree.as_ref().ok_or_else(|| {
            RTreeError::Io(io::Error::new(io::ErrorKind::NotFound, "No R-tree tile"))
        })?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(tile.clone())
    }

    fn read_tile_offsets(&self, idx: usize) -> RTreeResult<Vec<u8>> {
        self.read(TileKind::Offsets, idx)
    }

    fn read_tile_var_offsets(&self, idx: usize) -> RTreeResult<Vec<u8>> {
        self.read(TileKind::VarOffsets, idx)
    }

    fn read_tile_min(&self, idx: usize) -> RTreeResult<Vec<u8>> {
        self.read(TileKind::Min, idx)
    }

    fn read_tile_max(&self, idx: usize) -> RTreeResult<Vec<u8>> {
        self.read(TileKind::Max, idx)
    }
}
