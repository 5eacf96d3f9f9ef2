//! Per-chain exclusive leases
//!
//! Every structural change to a chain (attach, detach, grow, and the final
//! relink of a merge job) runs while holding that chain's lease. Block
//! copies do not take the lease; they are serialised against live writes by
//! the chain's allocation lock instead.

use std::sync::Arc;

use dashmap::DashMap;
use livemerge_core::ChainId;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Held lease; released on drop
pub type ChainLease = ArcMutexGuard<RawMutex, ()>;

/// Lease table keyed by chain
#[derive(Debug, Default)]
pub struct ChainLeases {
    leases: DashMap<ChainId, Arc<Mutex<()>>>,
}

impl ChainLeases {
    /// Create an empty lease table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, chain: ChainId) -> Arc<Mutex<()>> {
        self.leases
            .entry(chain)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Block until the lease for `chain` is held
    pub fn acquire(&self, chain: ChainId) -> ChainLease {
        self.lock_for(chain).lock_arc()
    }

    /// Try to take the lease without blocking
    pub fn try_acquire(&self, chain: ChainId) -> Option<ChainLease> {
        self.lock_for(chain).try_lock_arc()
    }

    /// Forget the lease of a chain that no longer exists
    pub fn remove(&self, chain: ChainId) {
        self.leases.remove(&chain);
    }

    /// Number of chains with a lease entry
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// Check if no chain has a lease entry
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
