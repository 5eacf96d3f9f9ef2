//! livemerge - live merging of layered copy-on-write disk image chains
//!
//! A chain is a stack of images, each backed by the one below it; the top
//! one (the active layer) receives all writes. livemerge flattens such
//! chains while they are in use:
//!
//! - **pull** copies data from backing layers up into the active layer
//! - **commit** copies data from upper layers down into a base layer
//!
//! Either job runs on a worker thread, concurrently with reads and writes
//! through the active layer, and relinks the chain when it catches up.
//!
//! # Quick Start
//!
//! ```ignore
//! use livemerge::{BackingMode, ImageFormat, LayerSpec, MergeEngine};
//!
//! let engine = MergeEngine::open("/var/lib/images")?;
//! let chain = engine.create_chain();
//! engine.create_layer(chain, LayerSpec::new("BASE", ImageFormat::Raw))?;
//! engine.create_layer(
//!     chain,
//!     LayerSpec::new("S1", ImageFormat::Qcow2).backed_by("BASE", BackingMode::Absolute),
//! )?;
//! engine.write_pattern(chain, 0, 4096, 0xAB)?;
//!
//! let job = engine.commit(chain, "BASE", None, None)?;
//! engine.join(job.id)?;
//! assert_eq!(engine.active_layer(chain)?, "BASE");
//! ```
//!
//! # Architecture
//!
//! - `livemerge-core`: identifiers, formats, errors, the `BlockDevice` trait
//! - `livemerge-storage`: file and memory devices, block allocation maps
//! - `livemerge-concurrency`: chain leases, cancellation, throttling, polling
//! - `livemerge-engine`: chain model, merge jobs, coordinator, `MergeEngine`

pub use livemerge_concurrency::{poll_until, Backoff, CancelToken, WaitOptions};
pub use livemerge_core::{
    BackingMode, BackingRef, BlockRange, ChainId, Error, ErrorKind, ImageFormat, JobId, LayerId,
    LayerLocation, MergeDirection, Result, DEFAULT_BLOCK_SIZE, DEFAULT_IMAGE_SIZE,
};
pub use livemerge_engine::{
    BlockJobInfo, ChainGrowthSample, ChainSnapshot, ConsistencyVerifier, CoordinatorMetrics,
    EngineConfig, JobFailure, JobHandle, JobSnapshot, JobStatus, LayerInfo, LayerSpec,
    LayerStatus, MergeEngine, MergeRequest, Mismatch, PatternMismatch, Violation,
    CONFIG_FILE_NAME,
};
pub use livemerge_storage::{DeviceKind, DeviceRegistry};
