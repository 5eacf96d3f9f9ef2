//! Job coordinator: admission, tracking and polling of merge jobs
//!
//! At most one job is Pending or Running per chain. Admission happens under
//! the chain's lease, and a job gives its chain back (removes itself from
//! the active table) under the same lease, so a second `submit` either sees
//! the running job and gets `Conflict`, or sees a chain whose relink is
//! already complete.
//!
//! Each job runs on its own named thread (`livemerge-job-N`). Finished jobs
//! stay pollable until more than `retain_finished_jobs` newer ones finished.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use livemerge_concurrency::ChainLeases;
use livemerge_core::{ChainId, Error, JobId, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::job::{BlockJobInfo, JobHandle, JobRecord, JobSnapshot, JobStatus, MergeRequest};
use crate::merge::{JobSettings, MergeJob, MergePlan};
use crate::state::ChainState;

/// Counters over the coordinator's lifetime
///
/// Counters use Relaxed ordering; they are observational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorMetrics {
    /// Jobs admitted
    pub submitted: u64,
    /// Submissions refused (conflict or invalid range)
    pub rejected: u64,
    /// Jobs that relinked their chain
    pub completed: u64,
    /// Jobs stopped on request
    pub cancelled: u64,
    /// Jobs stopped by an error
    pub failed: u64,
    /// Blocks copied by finished jobs
    pub blocks_copied: u64,
}

struct CoordinatorInner {
    next_id: AtomicU64,
    jobs: DashMap<JobId, Arc<JobRecord>>,
    active: Arc<DashMap<ChainId, JobId>>,
    finished: Mutex<VecDeque<JobId>>,
    leases: Arc<ChainLeases>,
    settings: JobSettings,
    default_bandwidth: u64,
    retain: usize,
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    blocks_copied: AtomicU64,
}

impl CoordinatorInner {
    fn record_finished(&self, id: JobId, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.completed,
            JobStatus::Cancelled => &self.cancelled,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(record) = self.jobs.get(&id) {
            self.blocks_copied
                .fetch_add(record.snapshot().copied_blocks, Ordering::Relaxed);
        }

        let mut finished = self.finished.lock();
        finished.push_back(id);
        while finished.len() > self.retain {
            if let Some(old) = finished.pop_front() {
                self.jobs.remove(&old);
                debug!(target: "livemerge::coordinator", job = %old, "Evicted finished job");
            }
        }
    }
}

/// Admits and tracks merge jobs
pub struct JobCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl JobCoordinator {
    /// Create a coordinator sharing `leases` with the rest of the engine
    pub fn new(config: &EngineConfig, leases: Arc<ChainLeases>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                next_id: AtomicU64::new(1),
                jobs: DashMap::new(),
                active: Arc::new(DashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                leases,
                settings: JobSettings {
                    chunk_blocks: config.chunk_blocks,
                    verify_after_job: config.verify_after_job,
                },
                default_bandwidth: config.default_bandwidth,
                retain: config.retain_finished_jobs,
                submitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                blocks_copied: AtomicU64::new(0),
            }),
        }
    }

    /// Admit a merge job on `state`'s chain and start it
    ///
    /// Fails with `Conflict` while another job holds the chain and with
    /// `InvalidRange` when the bounds are not valid; neither changes any
    /// state.
    pub fn submit(&self, state: &Arc<ChainState>, request: MergeRequest) -> Result<JobHandle> {
        let chain = state.id();
        let _lease = self.inner.leases.acquire(chain);

        if let Some(job) = self.active_job(chain) {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(target: "livemerge::coordinator", chain = %chain, job = %job, "Rejected conflicting job");
            return Err(Error::Conflict { chain, job });
        }

        let (plan, end) = {
            let model = state.model.read();
            let plan = match MergePlan::build(&model, &request, self.inner.default_bandwidth) {
                Ok(plan) => plan,
                Err(e) => {
                    self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            let end = state.alloc.read().map(&plan.end_layer())?.size();
            (plan, end)
        };

        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let direction = plan.direction;
        let record = Arc::new(JobRecord::new(id, chain, plan, end));
        self.inner.jobs.insert(id, Arc::clone(&record));
        self.inner.active.insert(chain, id);

        let job = MergeJob {
            record: Arc::clone(&record),
            state: Arc::clone(state),
            leases: Arc::clone(&self.inner.leases),
            active: Arc::clone(&self.inner.active),
            settings: self.inner.settings,
        };
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("livemerge-job-{}", id.0))
            .spawn(move || {
                let status = job.run();
                inner.record_finished(id, status);
            });
        match spawned {
            Ok(handle) => *record.worker.lock() = Some(handle),
            Err(e) => {
                self.inner.active.remove(&chain);
                self.inner.jobs.remove(&id);
                return Err(Error::Internal(format!(
                    "failed to spawn job worker: {}",
                    e
                )));
            }
        }

        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "livemerge::coordinator",
            job = %id,
            chain = %chain,
            direction = %direction,
            end,
            "Job admitted"
        );
        Ok(JobHandle { id, chain })
    }

    fn record(&self, id: JobId) -> Result<Arc<JobRecord>> {
        self.inner
            .jobs
            .get(&id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(Error::UnknownJob(id))
    }

    /// Current state of a job; never blocks on the job
    pub fn poll(&self, id: JobId) -> Result<JobSnapshot> {
        Ok(self.record(id)?.snapshot())
    }

    /// Ask a job to stop at its next chunk boundary
    ///
    /// No-op for jobs that already finished.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let record = self.record(id)?;
        if record.status().is_active() {
            record.cancel.cancel();
            info!(target: "livemerge::coordinator", job = %id, chain = %record.chain, "Cancellation requested");
        }
        Ok(())
    }

    /// Block until a job's worker exits and return its final state
    pub fn join(&self, id: JobId) -> Result<JobSnapshot> {
        let record = self.record(id)?;
        let handle = record.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::Internal(format!("worker of {} panicked", id)))?;
        }
        Ok(record.snapshot())
    }

    /// Job holding `chain`, if any
    pub fn active_job(&self, chain: ChainId) -> Option<JobId> {
        self.inner.active.get(&chain).map(|j| *j.value())
    }

    /// Status report of the chain's outstanding job, or None if there is none
    pub fn block_job_info(&self, chain: ChainId) -> Option<BlockJobInfo> {
        let id = self.active_job(chain)?;
        self.record(id).ok()?.block_job_info()
    }

    /// Snapshots of every job still retained
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.inner.jobs.iter().map(|r| r.snapshot()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Lifetime counters
    pub fn metrics(&self) -> CoordinatorMetrics {
        let i = &self.inner;
        CoordinatorMetrics {
            submitted: i.submitted.load(Ordering::Relaxed),
            rejected: i.rejected.load(Ordering::Relaxed),
            completed: i.completed.load(Ordering::Relaxed),
            cancelled: i.cancelled.load(Ordering::Relaxed),
            failed: i.failed.load(Ordering::Relaxed),
            blocks_copied: i.blocks_copied.load(Ordering::Relaxed),
        }
    }

    /// Cancel every outstanding job and wait for all workers
    pub fn shutdown(&self) {
        let active: Vec<JobId> = self.inner.active.iter().map(|e| *e.value()).collect();
        for id in &active {
            if let Ok(record) = self.record(*id) {
                record.cancel.cancel();
            }
        }
        let records: Vec<Arc<JobRecord>> =
            self.inner.jobs.iter().map(|r| Arc::clone(r.value())).collect();
        for record in records {
            let handle = record.worker.lock().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(target: "livemerge::coordinator", job = %record.id, "Job worker panicked");
                }
            }
        }
        if !active.is_empty() {
            info!(target: "livemerge::coordinator", cancelled = active.len(), "Coordinator shut down");
        }
    }
}

impl Drop for JobCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("jobs", &self.inner.jobs.len())
            .field("active", &self.inner.active.len())
            .finish()
    }
}
