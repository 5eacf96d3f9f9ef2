//! Live-merge engine
//!
//! This crate orchestrates the lower layers:
//! - Chain model: layers, backing references, structural validation
//! - Chain state: copy-on-write reads and writes through the active layer
//! - Merge jobs: pull (forward) and commit (backward) on worker threads
//! - Coordinator: one job per chain, cancellation, retention, metrics
//! - Verification: backing references, formats, data patterns
//!
//! `MergeEngine` is the only component that knows about every chain at once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod job;
pub mod merge;
pub mod state;
pub mod verify;

pub use chain::{ChainModel, ChainSnapshot, Layer, LayerPath, LayerStatus, LayerSummary, Violation};
pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use coordinator::{CoordinatorMetrics, JobCoordinator};
pub use engine::{ChainGrowthSample, LayerInfo, LayerSpec, MergeEngine};
pub use job::{BlockJobInfo, JobFailure, JobHandle, JobSnapshot, JobStatus, MergeRequest};
pub use merge::MergePlan;
pub use state::ChainState;
pub use verify::{find_mismatch, ConsistencyVerifier, Mismatch, PatternMismatch};
