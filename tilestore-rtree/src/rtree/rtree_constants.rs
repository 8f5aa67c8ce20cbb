//! Constants for the R-tree and its on-disk format.

/// Fanout used for fragment R-trees.
pub const RTREE_FANOUT: u32 = 10;

/// First format version whose R-tree encoding supports variable-sized
/// dimensions. Older versions store every MBR as a fixed `2 * coord_size`
/// blob behind a small legacy header.
pub const VAR_SIZE_FORMAT_VERSION: u32 = 5;

/// First format version whose fragment metadata is loaded lazily, piece by
/// piece. Earlier fragments are loaded in one go.
pub const ONDEMAND_FORMAT_VERSION: u32 = 3;

/// First format version that stores per-tile minimum and maximum values.
pub const TILE_METADATA_FORMAT_VERSION: u32 = 11;
