//! Core types and traits for livemerge
//!
//! This crate defines the foundational types used throughout the system:
//! - LayerId / ChainId / JobId: identifiers for image layers, chains and merge jobs
//! - ImageFormat: raw vs copy-on-write (qcow2-like) layers
//! - BackingRef / BackingMode: a layer's pointer to its parent, absolute or relative
//! - LayerLocation: where a layer's bytes live (image file or block device)
//! - BlockRange: half-open byte ranges with block alignment helpers
//! - Error: the error taxonomy shared by every layer of the engine
//! - BlockDevice: raw positional I/O against a provisioned layer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod traits;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use limits::{DEFAULT_BLOCK_SIZE, DEFAULT_IMAGE_SIZE, MAX_BLOCK_SIZE, MAX_CHAIN_DEPTH, MIN_BLOCK_SIZE};
pub use traits::BlockDevice;
pub use types::{
    BackingMode, BackingRef, BlockRange, ChainId, ImageFormat, JobId, LayerId, LayerLocation,
    MergeDirection,
};
