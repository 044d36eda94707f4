//! Adaptive request batching for compute-node worker threads.
//!
//! Worker threads are partitioned into fixed-size [`BatchGroup`]s. For every
//! outbound request a thread's [`BatchManager`] asks its
//! [`BatchDecisionEngine`] whether to send immediately or to park the request
//! in its group slot. One rotating leader per group drains ready slots into a
//! single combined message per storage node; members whose request is not
//! picked up before their adaptive deadline reclaim it and send it
//! themselves.

pub mod config;
pub mod decision;
pub mod group;
pub mod manager;
pub mod metrics;
pub mod slot;
pub mod table;

pub use config::{
    BatchScoreWeights, BatchingConfig, DecisionConfig, ExplorationConfig, IndividualScoreWeights,
    ReadMostlyTunables, ThresholdBand, ThresholdConfig, WaitTimeConfig, WorkloadProfile,
};
pub use decision::{
    AdaptiveBatchingState, BatchDecisionEngine, Decision, DecisionCounters, Feedback,
    apply_feedback, next_wait_time, score_batch, score_individual, update_parameters,
};
pub use group::{BatchEntry, BatchGroup};
pub use manager::{BatchManager, ClaimedRequest};
pub use metrics::{BatchMetrics, batch_metrics, record_batch_sent, reset_batch_metrics};
pub use slot::{AtomicSlot, SlotState, SlotTransitionError};
pub use table::BatchTable;
