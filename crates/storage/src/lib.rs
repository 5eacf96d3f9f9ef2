//! Storage layer for livemerge
//!
//! This crate implements everything below the chain model:
//! - BlockAllocationMap: per-layer tri-state block map (absent / present / in-flight)
//! - ChainAllocation: the maps of one chain plus copy-on-write resolution
//! - MemoryDevice: sparse in-memory device, used for block-device layers
//! - FileDevice: image file with positional I/O
//! - DeviceRegistry: session-scoped provisioning of layer storage
//!
//! # Locking
//!
//! `ChainAllocation` carries no lock of its own. The engine wraps it in a
//! per-chain `RwLock` so that a mark update for one block range is never
//! observed half-applied by a concurrent `resolve`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocation;
pub mod file;
pub mod memory;
pub mod registry;
pub mod testing;

pub use allocation::{BlockAllocationMap, BlockState, ChainAllocation, DirtyExtents, Resolution, WriteMirror};
pub use file::FileDevice;
pub use memory::MemoryDevice;
pub use registry::{DeviceKind, DeviceRegistry};
