//! Error types for livemerge
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! - Chain structure: `Cycle`, `Size`, `ActiveLayer`, `LayerInUse`, `Format`
//! - Admission: `Conflict`, `InvalidRange`
//! - Copy step: `Io` (always carries the failing offset)
//! - Lookup / caller mistakes: `UnknownLayer`, `UnknownChain`, `UnknownJob`, `InvalidInput`
//! - Ambient: `Config`, `Timeout`, `Internal`
//!
//! Cancellation is not an error; it is a terminal job status.

use crate::types::{ChainId, JobId};
use std::io;
use thiserror::Error;

/// Result type alias for livemerge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the merge engine
#[derive(Debug, Error)]
pub enum Error {
    /// New backing reference would make a layer its own ancestor
    #[error("Backing reference {layer} -> {backing} would create a cycle")]
    Cycle {
        /// Referencing layer
        layer: String,
        /// Proposed backing layer
        backing: String,
    },

    /// Backing layer is smaller than the layer referencing it
    #[error("Backing layer {backing} ({backing_size} bytes) is smaller than {layer} ({required} bytes)")]
    Size {
        /// Referencing layer
        layer: String,
        /// Backing layer
        backing: String,
        /// Declared size of the backing layer
        backing_size: u64,
        /// Size the backing layer must at least have
        required: u64,
    },

    /// Operation would leave the chain without an active layer
    #[error("Layer {layer} is the active layer: {reason}")]
    ActiveLayer {
        /// Active layer name
        layer: String,
        /// What was attempted
        reason: String,
    },

    /// Layer is still referenced as a backing layer
    #[error("Layer {layer} is still a backing layer of {child}")]
    LayerInUse {
        /// Layer that cannot be removed
        layer: String,
        /// Layer that backs onto it
        child: String,
    },

    /// Image format does not allow the requested operation
    #[error("Format error on {layer}: {reason}")]
    Format {
        /// Offending layer
        layer: String,
        /// Description
        reason: String,
    },

    /// A merge job is already pending or running on the chain
    #[error("Chain {chain} already has {job} in progress")]
    Conflict {
        /// Chain in question
        chain: ChainId,
        /// The job holding the chain
        job: JobId,
    },

    /// Top/base bounds violate the ancestry constraints
    #[error("Invalid merge range: {0}")]
    InvalidRange(String),

    /// I/O failure while reading or writing a layer
    #[error("I/O error at offset {offset}: {source}")]
    Io {
        /// Byte offset of the failing block
        offset: u64,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// No layer with this name or id
    #[error("Layer not found: {0}")]
    UnknownLayer(String),

    /// No chain with this id
    #[error("Chain not found: {0}")]
    UnknownChain(ChainId),

    /// No job with this id (never submitted, or already evicted)
    #[error("Job not found: {0}")]
    UnknownJob(JobId),

    /// Caller supplied an invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bounded wait expired
    #[error("Timed out after {waited_ms} ms: {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Invariant violated inside the engine
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Copyable discriminant of [`Error`]
///
/// Job snapshots carry an `ErrorKind` instead of the error itself so they
/// stay `Clone` while still telling a poller what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Cycle`]
    Cycle,
    /// See [`Error::Size`]
    Size,
    /// See [`Error::ActiveLayer`]
    ActiveLayer,
    /// See [`Error::LayerInUse`]
    LayerInUse,
    /// See [`Error::Format`]
    Format,
    /// See [`Error::Conflict`]
    Conflict,
    /// See [`Error::InvalidRange`]
    InvalidRange,
    /// See [`Error::Io`]
    Io,
    /// See [`Error::UnknownLayer`]
    UnknownLayer,
    /// See [`Error::UnknownChain`]
    UnknownChain,
    /// See [`Error::UnknownJob`]
    UnknownJob,
    /// See [`Error::InvalidInput`]
    InvalidInput,
    /// See [`Error::Config`]
    Config,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::Internal`]
    Internal,
}

impl Error {
    /// Wrap an I/O error with the offset it occurred at
    pub fn io(offset: u64, source: io::Error) -> Self {
        Error::Io { offset, source }
    }

    /// Discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Cycle { .. } => ErrorKind::Cycle,
            Error::Size { .. } => ErrorKind::Size,
            Error::ActiveLayer { .. } => ErrorKind::ActiveLayer,
            Error::LayerInUse { .. } => ErrorKind::LayerInUse,
            Error::Format { .. } => ErrorKind::Format,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InvalidRange(_) => ErrorKind::InvalidRange,
            Error::Io { .. } => ErrorKind::Io,
            Error::UnknownLayer(_) => ErrorKind::UnknownLayer,
            Error::UnknownChain(_) => ErrorKind::UnknownChain,
            Error::UnknownJob(_) => ErrorKind::UnknownJob,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Config(_) => ErrorKind::Config,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Offset associated with the error, if any
    pub fn offset(&self) -> Option<u64> {
        match self {
            Error::Io { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Structural or admission errors are reported before any state changes
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Cycle
                | ErrorKind::Size
                | ErrorKind::ActiveLayer
                | ErrorKind::LayerInUse
                | ErrorKind::Format
                | ErrorKind::Conflict
                | ErrorKind::InvalidRange
        )
    }
}
