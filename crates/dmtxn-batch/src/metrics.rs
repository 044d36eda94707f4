//! Process-wide batching counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static BATCHES_TOTAL: AtomicU64 = AtomicU64::new(0);
static REQUESTS_BATCHED_TOTAL: AtomicU64 = AtomicU64::new(0);
static BATCH_SIZE_MAX: AtomicU64 = AtomicU64::new(0);
static RECLAIMS_TOTAL: AtomicU64 = AtomicU64::new(0);
static LEADER_TERMS_TOTAL: AtomicU64 = AtomicU64::new(0);
static INDIVIDUAL_RETRIES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of batching metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchMetrics {
    pub dmtxn_batch_batches_total: u64,
    pub dmtxn_batch_requests_batched_total: u64,
    pub dmtxn_batch_size_max: u64,
    pub dmtxn_batch_reclaims_total: u64,
    pub dmtxn_batch_leader_terms_total: u64,
    pub dmtxn_batch_individual_retries_total: u64,
}

#[must_use]
pub fn batch_metrics() -> BatchMetrics {
    BatchMetrics {
        dmtxn_batch_batches_total: BATCHES_TOTAL.load(Ordering::Relaxed),
        dmtxn_batch_requests_batched_total: REQUESTS_BATCHED_TOTAL.load(Ordering::Relaxed),
        dmtxn_batch_size_max: BATCH_SIZE_MAX.load(Ordering::Relaxed),
        dmtxn_batch_reclaims_total: RECLAIMS_TOTAL.load(Ordering::Relaxed),
        dmtxn_batch_leader_terms_total: LEADER_TERMS_TOTAL.load(Ordering::Relaxed),
        dmtxn_batch_individual_retries_total: INDIVIDUAL_RETRIES_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_batch_metrics() {
    BATCHES_TOTAL.store(0, Ordering::Relaxed);
    REQUESTS_BATCHED_TOTAL.store(0, Ordering::Relaxed);
    BATCH_SIZE_MAX.store(0, Ordering::Relaxed);
    RECLAIMS_TOTAL.store(0, Ordering::Relaxed);
    LEADER_TERMS_TOTAL.store(0, Ordering::Relaxed);
    INDIVIDUAL_RETRIES_TOTAL.store(0, Ordering::Relaxed);
}

/// A leader sent one combined message carrying `size` member requests.
pub fn record_batch_sent(size: usize) {
    let size = size as u64;
    BATCHES_TOTAL.fetch_add(1, Ordering::Relaxed);
    REQUESTS_BATCHED_TOTAL.fetch_add(size, Ordering::Relaxed);
    update_max(&BATCH_SIZE_MAX, size);
}

pub(crate) fn record_reclaim() {
    RECLAIMS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_leader_term() {
    LEADER_TERMS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_individual_retry() {
    INDIVIDUAL_RETRIES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

fn update_max(metric: &AtomicU64, val: u64) {
    let mut prev = metric.load(Ordering::Relaxed);
    while val > prev {
        match metric.compare_exchange_weak(prev, val, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => prev = actual,
        }
    }
}
