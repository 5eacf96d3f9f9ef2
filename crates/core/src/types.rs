//! Core types for livemerge
//!
//! This module defines the foundational types:
//! - LayerId / ChainId: UUID-backed identities for image layers and chains
//! - JobId: monotonically allocated merge job identifier
//! - ImageFormat: on-disk format of a layer
//! - LayerLocation / BackingRef: where a layer lives and how children point at it
//! - BlockRange: half-open byte range `[start, end)`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an image layer
///
/// Layers keep their identity across relinks; the name and location are
/// attributes of the layer, not its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(Uuid);

impl LayerId {
    /// Create a new random LayerId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a LayerId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this LayerId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a backing chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(Uuid);

impl ChainId {
    /// Create a new random ChainId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a ChainId from its string form
    ///
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a merge job, unique within one coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// On-disk format of a layer
///
/// Raw layers hold every byte themselves and can never defer to a backing
/// layer. Qcow2 layers are copy-on-write: unallocated blocks are read from
/// the backing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Flat image, every block allocated
    Raw,
    /// Copy-on-write image with an allocation map
    Qcow2,
}

impl ImageFormat {
    /// Format name as reported by image inspection
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }

    /// Whether layers of this format may carry a backing reference
    pub fn supports_backing(&self) -> bool {
        matches!(self, ImageFormat::Qcow2)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            other => Err(format!("unknown image format '{}'", other)),
        }
    }
}

/// Where a layer's bytes are stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerLocation {
    /// Regular image file, always stored as an absolute path
    File(PathBuf),
    /// Block device node (e.g. `/dev/loop3`)
    Block(String),
}

impl LayerLocation {
    /// Whether this location is a block device
    pub fn is_block(&self) -> bool {
        matches!(self, LayerLocation::Block(_))
    }

    /// Absolute form of the location, as handed to a hypervisor
    pub fn absolute(&self) -> String {
        match self {
            LayerLocation::File(path) => path.display().to_string(),
            LayerLocation::Block(dev) => dev.clone(),
        }
    }

    /// File name relative to the directory of `from`
    ///
    /// Returns None for block devices, or when the two files do not share a
    /// parent directory.
    pub fn relative_to(&self, from: &LayerLocation) -> Option<String> {
        match (self, from) {
            (LayerLocation::File(target), LayerLocation::File(origin)) => {
                let dir = origin.parent()?;
                let rel = target.strip_prefix(dir).ok()?;
                Some(rel.display().to_string())
            }
            _ => None,
        }
    }

    /// Resolve a stored backing path against this (referencing) location
    pub fn resolve_backing_path(&self, stored: &str) -> String {
        let stored_path = Path::new(stored);
        if stored_path.is_absolute() {
            return stored.to_string();
        }
        match self {
            LayerLocation::File(origin) => match origin.parent() {
                Some(dir) => dir.join(stored_path).display().to_string(),
                None => stored.to_string(),
            },
            LayerLocation::Block(_) => stored.to_string(),
        }
    }
}

impl fmt::Display for LayerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute())
    }
}

/// How a backing reference is written into the referencing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingMode {
    /// Absolute path or device node
    #[default]
    Absolute,
    /// Path relative to the referencing layer's own directory
    Relative,
}

/// A layer's pointer to its parent
///
/// `path` is the reference exactly as stored in the referencing layer. Two
/// references to the same layer compare unequal when their modes differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackingRef {
    /// Identity of the backing layer
    pub layer: LayerId,
    /// Absolute or relative encoding
    pub mode: BackingMode,
    /// Stored reference string
    pub path: String,
    /// Declared format of the backing layer
    pub format: ImageFormat,
}

impl BackingRef {
    /// The stored reference, as image inspection reports it
    pub fn display_path(&self) -> &str {
        &self.path
    }
}

/// Direction of a merge job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeDirection {
    /// Forward merge: ancestors are pulled up into the active layer
    Pull,
    /// Backward merge: a sub-chain is committed down into a base layer
    Commit,
}

impl fmt::Display for MergeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeDirection::Pull => f.write_str("pull"),
            MergeDirection::Commit => f.write_str("commit"),
        }
    }
}

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    /// First byte of the range
    pub start: u64,
    /// One past the last byte of the range
    pub end: u64,
}

impl BlockRange {
    /// Create a range; `end` is clamped to be at least `start`
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Create a range from an offset and a length
    pub fn at(offset: u64, len: u64) -> Self {
        Self::new(offset, offset.saturating_add(len))
    }

    /// Length in bytes
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check if the range covers no bytes
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Check if `offset` falls inside the range
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// Indices of every block touched by this range
    pub fn blocks(&self, block_size: u64) -> Range<u64> {
        if self.is_empty() {
            let idx = self.start / block_size;
            return idx..idx;
        }
        (self.start / block_size)..self.end.div_ceil(block_size)
    }

    /// Whether both ends fall on block boundaries
    pub fn is_aligned(&self, block_size: u64) -> bool {
        self.start % block_size == 0 && self.end % block_size == 0
    }

    /// Intersection of two ranges (empty when disjoint)
    pub fn intersect(&self, other: &BlockRange) -> BlockRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        BlockRange::new(start, end.max(start))
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
