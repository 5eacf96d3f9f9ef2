//! Core traits for raw block I/O
//!
//! `BlockDevice` is the seam between the merge engine and whatever actually
//! stores a layer's bytes. The engine never creates storage itself; it is
//! handed devices by a provisioning collaborator.

use std::fmt;
use std::io;

use crate::types::LayerLocation;

/// Positional read/write access to one layer's backing store
///
/// Thread safety: all methods must be safe to call concurrently from
/// multiple threads (requires Send + Sync). The engine serialises writes
/// that touch the same block, but reads of other blocks may run in parallel.
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Fill `buf` with the bytes at `offset`
    ///
    /// Bytes past the current end of the device read as zero.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`, extending the device if needed
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Current length in bytes
    fn len(&self) -> u64;

    /// Check if the device holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow or shrink the device
    fn resize(&self, new_len: u64) -> io::Result<()>;

    /// Make previous writes durable
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Where the device lives
    fn location(&self) -> &LayerLocation;
}
