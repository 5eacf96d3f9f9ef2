//! Merge planning and execution
//!
//! Both directions are a copy followed by a relink:
//!
//! ```text
//! pull   base=B      B <- M1 <- M2 <- A        copy M2, M1 into A where A is absent
//!                                               relink A -> B, stage M1, M2
//! commit base=B top=T B <- M <- T <- C         copy T, M into B (overwriting)
//!                                               relink C -> B, stage M, T
//! ```
//!
//! Sources are always ordered nearest-to-top first, so resolving a block
//! along the source list picks the most recent write.
//!
//! ## Execution
//!
//! The worker copies blocks in ascending offset order, one chunk per
//! acquisition of the chain's allocation lock. Each destination block is
//! marked in-flight, written, then marked present, all inside the lock, so
//! live writes interleave between chunks but never inside one. The throttle
//! sleeps between chunks, never under the lock.
//!
//! When the copy catches up, the worker takes the chain lease, re-reads the
//! end offset (a pull's active layer may have grown) and, if it is stable,
//! applies the relink to a copy of the model and swaps it in. Cancellation
//! and failure skip the relink entirely.

use std::ops::Range;
use std::sync::Arc;

use dashmap::DashMap;
use livemerge_concurrency::{ChainLease, ChainLeases, Throttle};
use livemerge_core::{ChainId, Error, JobId, LayerId, MergeDirection, Result};
use livemerge_storage::{BlockState, WriteMirror};
use tracing::{info, trace, warn};

use crate::chain::{ChainModel, LayerPath};
use crate::job::{JobRecord, JobStatus, MergeRequest};
use crate::state::ChainState;

/// Resolved bounds of a merge job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// Pull or commit
    pub direction: MergeDirection,
    /// Upper bound (the active layer for pulls)
    pub top: LayerId,
    /// Lower bound, exclusive
    pub base: Option<LayerId>,
    /// Layer receiving the copies
    pub destination: LayerId,
    /// Layers copied from, nearest to `top` first
    pub sources: LayerPath,
    /// Member backing onto `top`, relinked on commit completion
    pub child: Option<LayerId>,
    /// Commit whose top is the active layer
    pub active_commit: bool,
    /// Bytes/sec cap (0 = unlimited)
    pub bandwidth: u64,
}

impl MergePlan {
    /// Check `request` against the chain and work out what to copy
    ///
    /// Fails with `InvalidRange` when the bounds violate the ancestry rules.
    pub fn build(model: &ChainModel, request: &MergeRequest, default_bandwidth: u64) -> Result<Self> {
        let name = |id: &LayerId| {
            model
                .get(id)
                .map(|l| l.name.clone())
                .unwrap_or_else(|| id.to_string())
        };
        let active = model.active().ok_or_else(|| {
            Error::InvalidRange(format!("chain {} has no single active layer", model.id()))
        })?;
        let bandwidth = request.bandwidth.unwrap_or(default_bandwidth);

        match request.direction {
            MergeDirection::Pull => {
                if let Some(top) = request.top {
                    if top != active {
                        return Err(Error::InvalidRange(format!(
                            "pull top {} must be the active layer {}",
                            name(&top),
                            name(&active)
                        )));
                    }
                }
                let path = model.path_from(&active)?;
                let stop = match request.base {
                    Some(base) => strict_position(&path, &base).ok_or_else(|| {
                        Error::InvalidRange(format!(
                            "{} is not an ancestor of the active layer {}",
                            name(&base),
                            name(&active)
                        ))
                    })?,
                    None => path.len(),
                };
                Ok(Self {
                    direction: MergeDirection::Pull,
                    top: active,
                    base: request.base,
                    destination: active,
                    sources: path[1..stop].iter().copied().collect(),
                    child: None,
                    active_commit: false,
                    bandwidth,
                })
            }
            MergeDirection::Commit => {
                let base = request.base.ok_or_else(|| {
                    Error::InvalidRange("commit requires a base layer".to_string())
                })?;
                let top = request.top.unwrap_or(active);
                if !model.path_from(&active)?.contains(&top) {
                    return Err(Error::InvalidRange(format!(
                        "{} is not part of the active chain",
                        name(&top)
                    )));
                }
                let path = model.path_from(&top)?;
                let stop = strict_position(&path, &base).ok_or_else(|| {
                    Error::InvalidRange(format!(
                        "{} is not an ancestor of {}",
                        name(&base),
                        name(&top)
                    ))
                })?;
                Ok(Self {
                    direction: MergeDirection::Commit,
                    top,
                    base: Some(base),
                    destination: base,
                    sources: path[..stop].iter().copied().collect(),
                    child: model.child_of(&top),
                    active_commit: top == active,
                    bandwidth,
                })
            }
        }
    }

    /// Layer whose size bounds the copy
    pub fn end_layer(&self) -> LayerId {
        match self.direction {
            MergeDirection::Pull => self.destination,
            MergeDirection::Commit => self.top,
        }
    }

    /// Relink the chain as a completed job of this plan would
    ///
    /// Returns the layers staged for removal.
    pub fn apply(&self, model: &mut ChainModel) -> Result<Vec<LayerId>> {
        match self.direction {
            MergeDirection::Pull => {
                let mode = model
                    .layer(&self.destination)?
                    .backing
                    .as_ref()
                    .map(|b| b.mode)
                    .unwrap_or_default();
                model.relink(&self.destination, self.base, mode)
            }
            MergeDirection::Commit => {
                let base = self
                    .base
                    .ok_or_else(|| Error::Internal("commit plan without a base".to_string()))?;
                match self.child {
                    Some(child) => {
                        let mode = model
                            .layer(&child)?
                            .backing
                            .as_ref()
                            .map(|b| b.mode)
                            .unwrap_or_default();
                        model.relink(&child, Some(base), mode)
                    }
                    None => {
                        let staged = self.sources.to_vec();
                        model.stage_removal(&staged);
                        Ok(staged)
                    }
                }
            }
        }
    }
}

/// Index of `layer` in `path`, excluding the first entry
fn strict_position(path: &[LayerId], layer: &LayerId) -> Option<usize> {
    path.iter().position(|id| id == layer).filter(|pos| *pos > 0)
}

/// Tunables the worker reads from the engine configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct JobSettings {
    pub(crate) chunk_blocks: u64,
    pub(crate) verify_after_job: bool,
}

enum Outcome {
    CaughtUp(ChainLease, u64),
    Cancelled,
    Failed(Error),
}

/// Worker side of one merge job
pub(crate) struct MergeJob {
    pub(crate) record: Arc<JobRecord>,
    pub(crate) state: Arc<ChainState>,
    pub(crate) leases: Arc<ChainLeases>,
    pub(crate) active: Arc<DashMap<ChainId, JobId>>,
    pub(crate) settings: JobSettings,
}

impl MergeJob {
    /// Run the job to a terminal state
    pub(crate) fn run(self) -> JobStatus {
        let plan = &self.record.plan;
        self.record.transition(JobStatus::Pending, JobStatus::Running);
        info!(
            target: "livemerge::job",
            job = %self.record.id,
            chain = %self.record.chain,
            direction = %plan.direction,
            sources = plan.sources.len(),
            bandwidth = plan.bandwidth,
            "Merge job started"
        );
        let outcome = match self.copy_phase() {
            Ok(Some((lease, end))) => Outcome::CaughtUp(lease, end),
            Ok(None) => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e),
        };
        self.finish(outcome)
    }

    fn end_offset(&self) -> Result<u64> {
        Ok(self.state.alloc.read().map(&self.record.plan.end_layer())?.size())
    }

    /// Copy until caught up; returns the held lease and the final end, or
    /// None if cancelled
    fn copy_phase(&self) -> Result<Option<(ChainLease, u64)>> {
        let plan = &self.record.plan;
        if plan.active_commit {
            let base = plan
                .base
                .ok_or_else(|| Error::Internal("commit plan without a base".to_string()))?;
            self.state.alloc.write().set_mirror(WriteMirror {
                source: plan.top,
                target: base,
                cursor: 0,
            })?;
        }

        let bs = self.state.block_size();
        let throttle = Throttle::new(plan.bandwidth);
        let chunk_blocks = throttle.clamp_chunk(self.settings.chunk_blocks * bs, bs) / bs;
        let mut next = 0u64;

        loop {
            if self.record.cancel.is_cancelled() {
                return Ok(None);
            }
            let end = self.end_offset()?;
            let end_block = end.div_ceil(bs);
            if next >= end_block {
                let lease = self.leases.acquire(self.record.chain);
                if self.record.cancel.is_cancelled() {
                    return Ok(None);
                }
                if self.end_offset()? == end {
                    return Ok(Some((lease, end)));
                }
                // Grew while we were catching up; keep copying
                continue;
            }

            let stop = (next + chunk_blocks).min(end_block);
            let copied = self.copy_chunk(next..stop, end)?;
            next = stop;
            self.publish_progress(stop * bs, end);
            self.record.add_copied(copied);
            trace!(
                target: "livemerge::job",
                job = %self.record.id,
                cursor = stop * bs,
                end,
                copied,
                "Chunk done"
            );
            if copied > 0 && !throttle.consume(copied * bs, &self.record.cancel) {
                return Ok(None);
            }
        }
    }

    /// Report copy progress, keeping the cursor short of `end`
    ///
    /// `cursor == end` means "caught up" to pollers, so it is only published
    /// by `finish` once the chain has been relinked.
    fn publish_progress(&self, cursor: u64, end: u64) {
        let bs = self.state.block_size();
        let last_block = end.div_ceil(bs).saturating_sub(1) * bs;
        self.record.set_progress(cursor.min(last_block), end);
    }

    /// Copy one chunk of blocks under the allocation lock
    fn copy_chunk(&self, blocks: Range<u64>, end: u64) -> Result<u64> {
        let plan = &self.record.plan;
        let registry = self.state.registry();
        let mut alloc = self.state.alloc.write();
        let bs = alloc.block_size();
        let chunk_end = blocks.end * bs;
        let dest = plan.destination;
        let dest_dev = registry.get(&dest)?;
        let skip_zero = plan.direction == MergeDirection::Pull && plan.base.is_none();
        let mut copied = 0u64;

        for block in blocks {
            let was = alloc.map(&dest)?.state(block);
            // Data already in the active layer is newer than anything below it
            if plan.direction == MergeDirection::Pull && was != BlockState::Absent {
                continue;
            }
            let Some(source) = alloc.resolve_block(&plan.sources, block)?.owner else {
                continue;
            };
            let offset = block * bs;
            let mut buf = vec![0u8; bs.min(end - offset) as usize];
            registry
                .get(&source)?
                .read_at(offset, &mut buf)
                .map_err(|e| Error::io(offset, e))?;
            if skip_zero && buf.iter().all(|b| *b == 0) {
                continue;
            }

            alloc.map_mut(&dest)?.set_block(block, BlockState::InFlight);
            if let Err(e) = dest_dev.write_at(offset, &buf) {
                alloc.map_mut(&dest)?.set_block(block, was);
                return Err(Error::io(offset, e));
            }
            alloc.map_mut(&dest)?.set_block(block, BlockState::Present);
            copied += 1;
        }

        if plan.active_commit {
            alloc.advance_mirror(chunk_end);
        }
        Ok(copied)
    }

    /// Apply the plan's relink to a copy of the model and swap it in
    fn relink(&self) -> Result<Vec<LayerId>> {
        let mut model = self.state.model.write();
        let mut next = model.clone();
        let staged = self.record.plan.apply(&mut next)?;
        if self.settings.verify_after_job {
            let violations = next.validate();
            if !violations.is_empty() {
                let listed: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                return Err(Error::Internal(format!(
                    "relink would leave the chain inconsistent: {}",
                    listed.join("; ")
                )));
            }
        }
        *model = next;
        Ok(staged)
    }

    /// Enter the terminal state under the chain lease and free the chain
    fn finish(&self, outcome: Outcome) -> JobStatus {
        let chain = self.record.chain;
        let (_lease, result) = match outcome {
            Outcome::CaughtUp(lease, end) => {
                let result = self.relink().map(|staged| Some((staged, end)));
                (lease, result)
            }
            Outcome::Cancelled => (self.leases.acquire(chain), Ok(None)),
            Outcome::Failed(e) => (self.leases.acquire(chain), Err(e)),
        };
        self.state.alloc.write().clear_mirror();

        let snap = self.record.snapshot();
        let status = match result {
            Ok(Some((staged, end))) => {
                self.record.set_progress(end, end);
                self.record.finish(JobStatus::Completed);
                info!(
                    target: "livemerge::job",
                    job = %self.record.id,
                    chain = %chain,
                    copied_blocks = snap.copied_blocks,
                    staged = staged.len(),
                    "Merge job completed"
                );
                JobStatus::Completed
            }
            Ok(None) => {
                self.record.finish(JobStatus::Cancelled);
                info!(
                    target: "livemerge::job",
                    job = %self.record.id,
                    chain = %chain,
                    cursor = snap.cursor,
                    "Merge job cancelled"
                );
                JobStatus::Cancelled
            }
            Err(e) => {
                warn!(
                    target: "livemerge::job",
                    job = %self.record.id,
                    chain = %chain,
                    offset = ?e.offset(),
                    error = %e,
                    "Merge job failed"
                );
                self.record.fail(&e);
                JobStatus::Failed
            }
        };
        self.active.remove_if(&chain, |_, job| *job == self.record.id);
        status
    }
}
