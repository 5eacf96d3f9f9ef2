//! Merge job records and the views handed to callers
//!
//! A [`JobRecord`] is shared between the coordinator and the job's worker
//! thread. The worker is the only writer of cursor, end and status; callers
//! only ever get a [`JobSnapshot`] copied out of the atomics.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::thread::JoinHandle;

use livemerge_concurrency::CancelToken;
use livemerge_core::{ChainId, Error, ErrorKind, JobId, LayerId, MergeDirection};
use parking_lot::Mutex;
use serde::Serialize;

use crate::merge::MergePlan;

/// Lifecycle state of a merge job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobStatus {
    /// Admitted, worker not started yet
    Pending = 0,
    /// Copying blocks
    Running = 1,
    /// Copy finished and the chain was relinked
    Completed = 2,
    /// Stopped on request; chain untouched
    Cancelled = 3,
    /// Stopped by an error; chain untouched
    Failed = 4,
}

impl JobStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobStatus::Pending,
            1 => JobStatus::Running,
            2 => JobStatus::Completed,
            3 => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }

    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    /// Check if the job still holds its chain
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a job failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Kind of the original error
    pub kind: ErrorKind,
    /// Offset of the failing block, for I/O errors
    pub offset: Option<u64>,
    /// Rendered error message
    pub message: String,
}

impl From<&Error> for JobFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            offset: err.offset(),
            message: err.to_string(),
        }
    }
}

/// Parameters of a merge job as submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Pull or commit
    pub direction: MergeDirection,
    /// Upper bound; defaults to the active layer
    pub top: Option<LayerId>,
    /// Lower bound; required for commit, optional for pull
    pub base: Option<LayerId>,
    /// Bytes/sec cap; `None` uses the engine default, `Some(0)` is unlimited
    pub bandwidth: Option<u64>,
}

impl MergeRequest {
    /// Forward merge into the active layer
    pub fn pull(base: Option<LayerId>) -> Self {
        Self {
            direction: MergeDirection::Pull,
            top: None,
            base,
            bandwidth: None,
        }
    }

    /// Backward merge of `(base, top]` into `base`
    pub fn commit(base: LayerId, top: Option<LayerId>) -> Self {
        Self {
            direction: MergeDirection::Commit,
            top,
            base: Some(base),
            bandwidth: None,
        }
    }

    /// Set a bandwidth cap in bytes per second
    pub fn with_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.bandwidth = Some(bytes_per_sec);
        self
    }
}

/// Caller's reference to a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    /// Job identity
    pub id: JobId,
    /// Chain the job runs on
    pub chain: ChainId,
}

/// Immutable view of a job at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    /// Job identity
    pub id: JobId,
    /// Chain the job runs on
    pub chain: ChainId,
    /// Pull or commit
    pub direction: MergeDirection,
    /// Upper bound layer
    pub top: LayerId,
    /// Lower bound layer
    pub base: Option<LayerId>,
    /// Bytes/sec cap (0 = unlimited)
    pub bandwidth: u64,
    /// Bytes processed so far
    pub cursor: u64,
    /// Bytes to process; may grow while a pull runs
    pub end: u64,
    /// Blocks actually copied
    pub copied_blocks: u64,
    /// Lifecycle state
    pub status: JobStatus,
    /// Set when `status` is `Failed`
    pub failure: Option<JobFailure>,
}

impl JobSnapshot {
    /// Check if the copy reached the end
    pub fn is_caught_up(&self) -> bool {
        self.cursor >= self.end
    }
}

/// What the block-job polling protocol reports for a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockJobInfo {
    /// Direction of the outstanding job
    pub direction: MergeDirection,
    /// Bytes processed
    pub cursor: u64,
    /// Bytes to process
    pub end: u64,
}

/// Shared state of one job
pub(crate) struct JobRecord {
    pub(crate) id: JobId,
    pub(crate) chain: ChainId,
    pub(crate) plan: MergePlan,
    pub(crate) cancel: CancelToken,
    cursor: AtomicU64,
    end: AtomicU64,
    copied: AtomicU64,
    status: AtomicU8,
    failure: Mutex<Option<JobFailure>>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, chain: ChainId, plan: MergePlan, end: u64) -> Self {
        Self {
            id,
            chain,
            plan,
            cancel: CancelToken::new(),
            cursor: AtomicU64::new(0),
            end: AtomicU64::new(end),
            copied: AtomicU64::new(0),
            status: AtomicU8::new(JobStatus::Pending as u8),
            failure: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the job was not in `from`
    pub(crate) fn transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter a terminal state from whatever non-terminal state the job is in
    pub(crate) fn finish(&self, to: JobStatus) -> bool {
        debug_assert!(to.is_terminal());
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if JobStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.status.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn fail(&self, err: &Error) -> bool {
        *self.failure.lock() = Some(JobFailure::from(err));
        self.finish(JobStatus::Failed)
    }

    pub(crate) fn set_progress(&self, cursor: u64, end: u64) {
        self.end.store(end, Ordering::Release);
        self.cursor.fetch_max(cursor.min(end), Ordering::AcqRel);
    }

    pub(crate) fn add_copied(&self, blocks: u64) {
        self.copied.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn block_job_info(&self) -> Option<BlockJobInfo> {
        if !self.status().is_active() {
            return None;
        }
        Some(BlockJobInfo {
            direction: self.plan.direction,
            cursor: self.cursor.load(Ordering::Acquire),
            end: self.end.load(Ordering::Acquire),
        })
    }

    pub(crate) fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            chain: self.chain,
            direction: self.plan.direction,
            top: self.plan.top,
            base: self.plan.base,
            bandwidth: self.plan.bandwidth,
            cursor: self.cursor.load(Ordering::Acquire),
            end: self.end.load(Ordering::Acquire),
            copied_blocks: self.copied.load(Ordering::Relaxed),
            status: self.status(),
            failure: self.failure.lock().clone(),
        }
    }
}

impl fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("id", &self.id)
            .field("chain", &self.chain)
            .field("direction", &self.plan.direction)
            .field("status", &self.status())
            .finish()
    }
}
