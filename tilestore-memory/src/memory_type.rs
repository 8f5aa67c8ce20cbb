//! Memory categories and tracker tags.

use std::fmt::{Display, Formatter};

/// The category an allocation is charged to.
///
/// Every [`MemoryTrackerResource`](crate::resource::MemoryTrackerResource) is
/// bound to exactly one category, and the tracker keeps one counter per
/// category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    RTree,
    Footer,
    GenericTileIo,
    TileData,
    TileOffsets,
    TileMinVals,
    TileMaxVals,
    TileSums,
    TileNullCounts,
    Enumeration,
    EnumerationPaths,
    CoordinateTiles,
    Attributes,
    DimensionLabels,
    Dimensions,
    Domains,
    TileWriterData,
    QueryCondition,
    ConsolidationBuffers,
    Metadata,
}

impl MemoryType {
    /// Canonical name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::RTree => "RTree",
            MemoryType::Footer => "Footer",
            MemoryType::GenericTileIo => "GenericTileIO",
            MemoryType::TileData => "TileData",
            MemoryType::TileOffsets => "TileOffsets",
            MemoryType::TileMinVals => "TileMinVals",
            MemoryType::TileMaxVals => "TileMaxVals",
            MemoryType::TileSums => "TileSums",
            MemoryType::TileNullCounts => "TileNullCounts",
            MemoryType::Enumeration => "Enumeration",
            MemoryType::EnumerationPaths => "EnumerationPaths",
            MemoryType::CoordinateTiles => "CoordinateTiles",
            MemoryType::Attributes => "Attributes",
            MemoryType::DimensionLabels => "DimensionLabels",
            MemoryType::Dimensions => "Dimensions",
            MemoryType::Domains => "Domains",
            MemoryType::TileWriterData => "TileWriterData",
            MemoryType::QueryCondition => "QueryCondition",
            MemoryType::ConsolidationBuffers => "ConsolidationBuffers",
            MemoryType::Metadata => "Metadata",
        }
    }
}

impl Display for MemoryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag describing which subsystem owns a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryTrackerType {
    #[default]
    Anonymous,
    ArrayCreate,
    ArrayLoad,
    ArrayRead,
    ArrayWrite,
    Consolidator,
    EnumerationCreate,
    Ephemeral,
    FragmentInfoLoad,
    Group,
    QueryRead,
    QueryWrite,
    RestClient,
    SchemaEvolution,
}

impl MemoryTrackerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTrackerType::Anonymous => "Anonymous",
            MemoryTrackerType::ArrayCreate => "ArrayCreate",
            MemoryTrackerType::ArrayLoad => "ArrayLoad",
            MemoryTrackerType::ArrayRead => "ArrayRead",
            MemoryTrackerType::ArrayWrite => "ArrayWrite",
            MemoryTrackerType::Consolidator => "Consolidator",
            MemoryTrackerType::EnumerationCreate => "EnumerationCreate",
            MemoryTrackerType::Ephemeral => "Ephemeral",
            MemoryTrackerType::FragmentInfoLoad => "FragmentInfoLoad",
            MemoryTrackerType::Group => "Group",
            MemoryTrackerType::QueryRead => "QueryRead",
            MemoryTrackerType::QueryWrite => "QueryWrite",
            MemoryTrackerType::RestClient => "RestClient",
            MemoryTrackerType::SchemaEvolution => "SchemaEvolution",
        }
    }
}

impl Display for MemoryTrackerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
