//! Block allocation maps
//!
//! Every copy-on-write layer records, per aligned block, whether it holds
//! authoritative data (`Present`), defers to its backing layer (`Absent`), or
//! is the destination of a copy that has not finished yet (`InFlight`).
//!
//! # Design
//!
//! - Sparse layers keep a `BTreeMap<block, state>` holding only non-absent
//!   blocks, so extent scans run in offset order without touching holes.
//! - Raw layers are *dense*: every block below the declared size is present
//!   and mark operations are no-ops.
//! - `ChainAllocation` groups the maps of one chain and resolves a logical
//!   offset by walking a path from the active layer toward the base.
//!
//! `InFlight` blocks are never authoritative. `resolve` treats them like
//! `Absent`, so a reader that slips in between a copy's start and end still
//! sees the old data from further down the chain.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Range;

use livemerge_core::{BlockRange, Error, LayerId, Result};
use rustc_hash::FxHashMap;

/// Allocation state of one block in one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Deferred to the backing layer
    Absent,
    /// Authoritative data lives in this layer
    Present,
    /// Currently being copied into this layer by a merge job
    InFlight,
}

/// Per-layer block allocation map
#[derive(Debug, Clone)]
pub struct BlockAllocationMap {
    block_size: u64,
    size: u64,
    dense: bool,
    /// Non-absent blocks only
    blocks: BTreeMap<u64, BlockState>,
}

impl BlockAllocationMap {
    /// Map for a copy-on-write layer with nothing allocated
    pub fn sparse(block_size: u64, size: u64) -> Self {
        Self {
            block_size,
            size,
            dense: false,
            blocks: BTreeMap::new(),
        }
    }

    /// Map for a raw layer: every block is present
    pub fn dense(block_size: u64, size: u64) -> Self {
        Self {
            block_size,
            size,
            dense: true,
            blocks: BTreeMap::new(),
        }
    }

    /// Allocation granularity in bytes
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Declared size of the layer in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this is a raw (fully allocated) layer
    pub fn is_dense(&self) -> bool {
        self.dense
    }

    /// Number of blocks covering the declared size
    pub fn block_count(&self) -> u64 {
        self.size.div_ceil(self.block_size)
    }

    /// State of `block`; blocks past the declared size are always absent
    pub fn state(&self, block: u64) -> BlockState {
        if block >= self.block_count() {
            return BlockState::Absent;
        }
        if self.dense {
            return BlockState::Present;
        }
        self.blocks.get(&block).copied().unwrap_or(BlockState::Absent)
    }

    /// Check if `block` holds authoritative data
    #[inline]
    pub fn is_present(&self, block: u64) -> bool {
        self.state(block) == BlockState::Present
    }

    /// Mark every block touched by `range` as present
    ///
    /// Returns the number of blocks whose state changed. Blocks past the
    /// declared size are ignored.
    pub fn mark_present(&mut self, range: BlockRange) -> usize {
        self.set_range(range, BlockState::Present)
    }

    /// Mark every block touched by `range` as absent
    pub fn mark_absent(&mut self, range: BlockRange) -> usize {
        self.set_range(range, BlockState::Absent)
    }

    /// Mark a single block as the destination of an unfinished copy
    pub fn mark_in_flight(&mut self, block: u64) {
        self.set_block(block, BlockState::InFlight);
    }

    /// Set the state of one block, returning whether it changed
    pub fn set_block(&mut self, block: u64, state: BlockState) -> bool {
        if self.dense || block >= self.block_count() {
            return false;
        }
        match state {
            BlockState::Absent => self.blocks.remove(&block).is_some(),
            other => self.blocks.insert(block, other) != Some(other),
        }
    }

    fn set_range(&mut self, range: BlockRange, state: BlockState) -> usize {
        let blocks = self.clip(range.blocks(self.block_size));
        blocks.filter(|&b| self.set_block(b, state)).count()
    }

    fn clip(&self, blocks: Range<u64>) -> Range<u64> {
        let count = self.block_count();
        blocks.start.min(count)..blocks.end.min(count)
    }

    /// Present blocks within `blocks`, in ascending order
    pub fn present_blocks(&self, blocks: Range<u64>) -> Box<dyn Iterator<Item = u64> + '_> {
        let blocks = self.clip(blocks);
        if self.dense {
            return Box::new(blocks);
        }
        Box::new(
            self.blocks
                .range(blocks)
                .filter(|(_, state)| **state == BlockState::Present)
                .map(|(block, _)| *block),
        )
    }

    /// Coalesced extents of present data, in offset order
    ///
    /// The sequence is computed from the map's current state each time it is
    /// called; it is not a live cursor.
    pub fn dirty_extents(&self) -> DirtyExtents<'_> {
        let source = if self.dense {
            let whole = BlockRange::new(0, self.size);
            ExtentSource::Dense((!whole.is_empty()).then_some(whole))
        } else {
            ExtentSource::Sparse(self.blocks.iter().peekable())
        };
        DirtyExtents {
            source,
            block_size: self.block_size,
            size: self.size,
        }
    }

    /// Number of present blocks
    pub fn present_count(&self) -> u64 {
        if self.dense {
            return self.block_count();
        }
        self.blocks
            .values()
            .filter(|state| **state == BlockState::Present)
            .count() as u64
    }

    /// One past the highest allocated byte (0 when nothing is allocated)
    pub fn allocated_end(&self) -> u64 {
        if self.dense {
            return self.size;
        }
        self.blocks
            .iter()
            .rev()
            .find(|(_, state)| **state == BlockState::Present)
            .map(|(block, _)| ((block + 1) * self.block_size).min(self.size))
            .unwrap_or(0)
    }

    /// Change the declared size; blocks past a shrunken end are dropped
    pub fn resize(&mut self, new_size: u64) {
        self.size = new_size;
        let count = self.block_count();
        self.blocks.split_off(&count);
    }
}

enum ExtentSource<'a> {
    Dense(Option<BlockRange>),
    Sparse(Peekable<btree_map::Iter<'a, u64, BlockState>>),
}

/// Lazy iterator over the present extents of one layer
pub struct DirtyExtents<'a> {
    source: ExtentSource<'a>,
    block_size: u64,
    size: u64,
}

impl Iterator for DirtyExtents<'_> {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        match &mut self.source {
            ExtentSource::Dense(range) => range.take(),
            ExtentSource::Sparse(iter) => {
                let start = loop {
                    let (&block, &state) = iter.next()?;
                    if state == BlockState::Present {
                        break block;
                    }
                };
                let mut end = start + 1;
                while let Some(&(&block, &state)) = iter.peek() {
                    if block != end || state != BlockState::Present {
                        break;
                    }
                    end += 1;
                    iter.next();
                }
                Some(BlockRange::new(
                    start * self.block_size,
                    (end * self.block_size).min(self.size),
                ))
            }
        }
    }
}

/// Outcome of resolving one logical offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Layer holding the data; None means zero-fill
    pub owner: Option<LayerId>,
    /// Position of the owner in the resolution path (0 = top of path)
    pub depth: usize,
}

impl Resolution {
    /// Whether the read falls through every layer and returns zeros
    pub fn is_zero_fill(&self) -> bool {
        self.owner.is_none()
    }
}

/// Live writes below `cursor` on `source` must also land on `target`
///
/// Registered by an active-layer commit so that data written behind the
/// job's cursor reaches the commit base before the chain pivots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMirror {
    /// Layer receiving live writes (the active layer)
    pub source: LayerId,
    /// Layer the data is mirrored into (the commit base)
    pub target: LayerId,
    /// Bytes below this offset have already been copied
    pub cursor: u64,
}

/// Allocation maps of every layer in one chain
#[derive(Debug, Clone)]
pub struct ChainAllocation {
    block_size: u64,
    maps: FxHashMap<LayerId, BlockAllocationMap>,
    mirror: Option<WriteMirror>,
}

impl ChainAllocation {
    /// Create an empty set of maps with a common block size
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            maps: FxHashMap::default(),
            mirror: None,
        }
    }

    /// Allocation granularity shared by all maps
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Register the map of a newly attached layer
    pub fn insert(&mut self, layer: LayerId, map: BlockAllocationMap) -> Result<()> {
        if map.block_size() != self.block_size {
            return Err(Error::InvalidInput(format!(
                "block size {} does not match chain block size {}",
                map.block_size(),
                self.block_size
            )));
        }
        if self.maps.contains_key(&layer) {
            return Err(Error::InvalidInput(format!(
                "layer {} already has an allocation map",
                layer
            )));
        }
        self.maps.insert(layer, map);
        Ok(())
    }

    /// Drop the map of a removed layer
    pub fn remove(&mut self, layer: &LayerId) -> Option<BlockAllocationMap> {
        self.maps.remove(layer)
    }

    /// Map of `layer`, if registered
    pub fn get(&self, layer: &LayerId) -> Option<&BlockAllocationMap> {
        self.maps.get(layer)
    }

    /// Map of `layer`, or `UnknownLayer`
    pub fn map(&self, layer: &LayerId) -> Result<&BlockAllocationMap> {
        self.maps
            .get(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))
    }

    /// Mutable map of `layer`, or `UnknownLayer`
    pub fn map_mut(&mut self, layer: &LayerId) -> Result<&mut BlockAllocationMap> {
        self.maps
            .get_mut(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))
    }

    /// Mark a range present on `layer`
    pub fn mark_present(&mut self, layer: &LayerId, range: BlockRange) -> Result<usize> {
        Ok(self.map_mut(layer)?.mark_present(range))
    }

    /// Mark a range absent on `layer`
    pub fn mark_absent(&mut self, layer: &LayerId, range: BlockRange) -> Result<usize> {
        Ok(self.map_mut(layer)?.mark_absent(range))
    }

    /// Resolve the owner of `offset` along `path` (active first, base last)
    pub fn resolve(&self, path: &[LayerId], offset: u64) -> Result<Resolution> {
        self.resolve_block(path, offset / self.block_size)
    }

    /// Resolve the owner of a block index along `path`
    pub fn resolve_block(&self, path: &[LayerId], block: u64) -> Result<Resolution> {
        for (depth, layer) in path.iter().enumerate() {
            if self.map(layer)?.is_present(block) {
                return Ok(Resolution {
                    owner: Some(*layer),
                    depth,
                });
            }
        }
        Ok(Resolution {
            owner: None,
            depth: path.len(),
        })
    }

    /// Present extents of `layer`, recomputed on every call
    pub fn dirty_extents(&self, layer: &LayerId) -> Result<DirtyExtents<'_>> {
        Ok(self.map(layer)?.dirty_extents())
    }

    /// Install a write mirror; fails if one is already registered
    pub fn set_mirror(&mut self, mirror: WriteMirror) -> Result<()> {
        if let Some(existing) = self.mirror {
            return Err(Error::Internal(format!(
                "write mirror {} -> {} already installed",
                existing.source, existing.target
            )));
        }
        self.mirror = Some(mirror);
        Ok(())
    }

    /// Currently installed write mirror
    pub fn mirror(&self) -> Option<WriteMirror> {
        self.mirror
    }

    /// Move the mirror cursor forward; it never moves backward
    pub fn advance_mirror(&mut self, cursor: u64) {
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.cursor = mirror.cursor.max(cursor);
        }
    }

    /// Remove the write mirror
    pub fn clear_mirror(&mut self) -> Option<WriteMirror> {
        self.mirror.take()
    }

    /// Identities of every layer with a map
    pub fn layers(&self) -> impl Iterator<Item = &LayerId> {
        self.maps.keys()
    }
}
