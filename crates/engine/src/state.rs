//! Per-chain state: structure, allocation maps and the data path
//!
//! Lock order is always: chain lease, then `model`, then `alloc`. Reads and
//! live writes hold `model` shared for their whole duration, so a job's
//! relink (which takes `model` exclusively) never lands in the middle of a
//! request.

use std::sync::Arc;

use livemerge_core::{BlockRange, ChainId, Error, LayerId, Result};
use livemerge_storage::{BlockState, ChainAllocation, DeviceRegistry};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::trace;

use crate::chain::{ChainModel, ChainSnapshot, Violation};

/// Shared state of one chain
#[derive(Debug)]
pub struct ChainState {
    id: ChainId,
    pub(crate) model: RwLock<ChainModel>,
    pub(crate) alloc: RwLock<ChainAllocation>,
    registry: Arc<DeviceRegistry>,
}

impl ChainState {
    /// Create the state of an empty chain
    pub fn new(id: ChainId, block_size: u64, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            id,
            model: RwLock::new(ChainModel::new(id)),
            alloc: RwLock::new(ChainAllocation::new(block_size)),
            registry,
        }
    }

    /// Chain identity
    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Allocation granularity
    pub fn block_size(&self) -> u64 {
        self.alloc.read().block_size()
    }

    /// Shared view of the chain structure
    pub fn model(&self) -> RwLockReadGuard<'_, ChainModel> {
        self.model.read()
    }

    /// Shared view of the allocation maps
    pub fn allocation(&self) -> RwLockReadGuard<'_, ChainAllocation> {
        self.alloc.read()
    }

    /// Device registry the chain's layers live in
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Backing structure of every layer
    pub fn snapshot(&self) -> ChainSnapshot {
        self.model.read().snapshot()
    }

    /// Structural violations of the chain
    pub fn validate(&self) -> Vec<Violation> {
        self.model.read().validate()
    }

    /// Logical content of the active layer
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let model = self.model.read();
        let active = model.require_active()?;
        self.read_locked(&model, &active, offset, len)
    }

    /// Logical content as seen through `layer` and its own backing path
    ///
    /// Works for layers pending removal too; their backing references are
    /// left untouched by relinks.
    pub fn read_layer(&self, layer: &LayerId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let model = self.model.read();
        self.read_locked(&model, layer, offset, len)
    }

    fn read_locked(&self, model: &ChainModel, layer: &LayerId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = model.path_from(layer)?;
        let alloc = self.alloc.read();
        check_bounds(&alloc, layer, offset, len)?;
        let mut buf = vec![0u8; len as usize];
        self.fill_from_path(&alloc, &path, offset, &mut buf)?;
        Ok(buf)
    }

    /// Read `buf.len()` bytes at `offset`, resolving each block along `path`
    ///
    /// Consecutive blocks owned by the same layer are read in one request.
    pub(crate) fn fill_from_path(
        &self,
        alloc: &ChainAllocation,
        path: &[LayerId],
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let bs = alloc.block_size();
        let end = offset + buf.len() as u64;
        let mut pos = offset;
        while pos < end {
            let block = pos / bs;
            let owner = alloc.resolve_block(path, block)?.owner;
            let mut run_end = ((block + 1) * bs).min(end);
            while run_end < end {
                let next = run_end / bs;
                if alloc.resolve_block(path, next)?.owner != owner {
                    break;
                }
                run_end = ((next + 1) * bs).min(end);
            }
            let out = &mut buf[(pos - offset) as usize..(run_end - offset) as usize];
            match owner {
                Some(layer) => self
                    .registry
                    .get(&layer)?
                    .read_at(pos, out)
                    .map_err(|e| Error::io(pos, e))?,
                None => out.fill(0),
            }
            pos = run_end;
        }
        Ok(())
    }

    /// Write into the active layer (the live consumer's write path)
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let model = self.model.read();
        let active = model.require_active()?;
        self.write_locked(&model, &active, offset, data)
    }

    /// Write into a member layer that nothing backs onto yet
    pub fn write_layer(&self, layer: &LayerId, offset: u64, data: &[u8]) -> Result<()> {
        let model = self.model.read();
        let target = model.layer(layer)?;
        if !target.is_member() {
            return Err(Error::InvalidInput(format!(
                "{} is pending removal",
                target.name
            )));
        }
        if let Some(child) = model.child_of(layer) {
            return Err(Error::InvalidInput(format!(
                "{} is a backing layer of {} and is read-only",
                target.name,
                model.layer(&child)?.name
            )));
        }
        self.write_locked(&model, layer, offset, data)
    }

    fn write_locked(&self, model: &ChainModel, layer: &LayerId, offset: u64, data: &[u8]) -> Result<()> {
        let path = model.path_from(layer)?;
        let mut alloc = self.alloc.write();
        check_bounds(&alloc, layer, offset, data.len() as u64)?;
        let bs = alloc.block_size();
        let size = alloc.map(layer)?.size();
        let device = self.registry.get(layer)?;
        let range = BlockRange::at(offset, data.len() as u64);

        for block in range.blocks(bs) {
            let block_start = block * bs;
            let block_len = bs.min(size - block_start);
            let piece = range.intersect(&BlockRange::at(block_start, block_len));
            let src = &data[(piece.start - offset) as usize..(piece.end - offset) as usize];
            let whole = piece.len() == block_len;

            if whole || alloc.map(layer)?.state(block) == BlockState::Present {
                device
                    .write_at(piece.start, src)
                    .map_err(|e| Error::io(piece.start, e))?;
            } else {
                // Copy-on-write: fill the rest of the block from the backing path
                let mut contents = vec![0u8; block_len as usize];
                self.fill_from_path(&alloc, &path, block_start, &mut contents)?;
                let at = (piece.start - block_start) as usize;
                contents[at..at + src.len()].copy_from_slice(src);
                device
                    .write_at(block_start, &contents)
                    .map_err(|e| Error::io(block_start, e))?;
            }
            alloc.map_mut(layer)?.set_block(block, BlockState::Present);

            if let Some(mirror) = alloc.mirror() {
                if mirror.source == *layer && block_start < mirror.cursor {
                    let mut contents = vec![0u8; block_len as usize];
                    device
                        .read_at(block_start, &mut contents)
                        .map_err(|e| Error::io(block_start, e))?;
                    self.registry
                        .get(&mirror.target)?
                        .write_at(block_start, &contents)
                        .map_err(|e| Error::io(block_start, e))?;
                    alloc
                        .map_mut(&mirror.target)?
                        .set_block(block, BlockState::Present);
                    trace!(target: "livemerge::job", chain = %self.id, offset = block_start, "Mirrored live write");
                }
            }
        }
        Ok(())
    }

    /// Reject a range that does not fit inside `layer`
    pub fn check_range(&self, layer: &LayerId, offset: u64, len: u64) -> Result<()> {
        check_bounds(&self.alloc.read(), layer, offset, len)
    }

    /// One past the highest allocated byte of `layer`
    pub fn allocated_end(&self, layer: &LayerId) -> Result<u64> {
        Ok(self.alloc.read().map(layer)?.allocated_end())
    }
}

fn check_bounds(alloc: &ChainAllocation, layer: &LayerId, offset: u64, len: u64) -> Result<()> {
    let size = alloc.map(layer)?.size();
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::InvalidInput(format!(
            "range {} is outside the {} byte image",
            BlockRange::at(offset, len),
            size
        ))),
    }
}
