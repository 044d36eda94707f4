//! Process-wide lock and cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static LOCKS_ACQUIRED_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOCK_WAITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOCK_ABORTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WOUNDS_TOTAL: AtomicU64 = AtomicU64::new(0);
static CACHE_HITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static CACHE_INVALIDATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of lock and cache metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockMetrics {
    pub dmtxn_lock_acquired_total: u64,
    pub dmtxn_lock_waits_total: u64,
    pub dmtxn_lock_aborts_total: u64,
    pub dmtxn_lock_wounds_total: u64,
    pub dmtxn_cache_hits_total: u64,
    pub dmtxn_cache_invalidations_total: u64,
}

#[must_use]
pub fn lock_metrics() -> LockMetrics {
    LockMetrics {
        dmtxn_lock_acquired_total: LOCKS_ACQUIRED_TOTAL.load(Ordering::Relaxed),
        dmtxn_lock_waits_total: LOCK_WAITS_TOTAL.load(Ordering::Relaxed),
        dmtxn_lock_aborts_total: LOCK_ABORTS_TOTAL.load(Ordering::Relaxed),
        dmtxn_lock_wounds_total: WOUNDS_TOTAL.load(Ordering::Relaxed),
        dmtxn_cache_hits_total: CACHE_HITS_TOTAL.load(Ordering::Relaxed),
        dmtxn_cache_invalidations_total: CACHE_INVALIDATIONS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_lock_metrics() {
    LOCKS_ACQUIRED_TOTAL.store(0, Ordering::Relaxed);
    LOCK_WAITS_TOTAL.store(0, Ordering::Relaxed);
    LOCK_ABORTS_TOTAL.store(0, Ordering::Relaxed);
    WOUNDS_TOTAL.store(0, Ordering::Relaxed);
    CACHE_HITS_TOTAL.store(0, Ordering::Relaxed);
    CACHE_INVALIDATIONS_TOTAL.store(0, Ordering::Relaxed);
}

pub(crate) fn record_lock_acquired() {
    LOCKS_ACQUIRED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_lock_wait() {
    LOCK_WAITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_lock_abort() {
    LOCK_ABORTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_wound() {
    WOUNDS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_cache_hit() {
    CACHE_HITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_cache_invalidation() {
    CACHE_INVALIDATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}
