//! At-most-one in-flight run per store.
//!
//! Each store gets an [`OverlapGuard`]; a run holds the guard's [`RunGuard`]
//! for its whole duration, and a second run for the same store is skipped
//! while the first is still going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use postindex_types::StoreName;

/// Tracks whether a single store is currently being reconciled.
#[derive(Default)]
pub struct OverlapGuard {
    is_running: Arc<AtomicBool>,
}

impl OverlapGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the store as running. `None` if it already is.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                flag: Arc::clone(&self.is_running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// RAII guard that releases the running flag when dropped, including when
/// the run's task panics.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Overlap guards for every store seen so far.
#[derive(Default)]
pub struct StoreGuards {
    guards: DashMap<StoreName, Arc<OverlapGuard>>,
}

impl StoreGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the run slot for `store`, or `None` if a run is in flight.
    pub fn try_acquire(&self, store: &StoreName) -> Option<RunGuard> {
        let guard = Arc::clone(&self.guards.entry(store.clone()).or_default());
        guard.try_acquire()
    }

    pub fn is_running(&self, store: &StoreName) -> bool {
        self.guards
            .get(store)
            .map(|guard| guard.is_running())
            .unwrap_or(false)
    }
}
