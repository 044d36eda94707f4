//! Adaptive batch-or-send decision engine.
//!
//! The learned state lives in [`AdaptiveBatchingState`], a plain `Copy`
//! struct. Everything that reads or moves it ([`score_batch`],
//! [`score_individual`], [`next_wait_time`], [`apply_feedback`],
//! [`update_parameters`]) is a pure function of the state, the recent
//! counters and the [`DecisionConfig`]. [`BatchDecisionEngine`] owns one
//! state per worker thread and adds the two impure ingredients: the
//! exploration RNG and the time of the previous decision.
//!
//! Rates are exponentially weighted moving averages with learning rate
//! `alpha`: `rate = alpha * sample + (1 - alpha) * rate`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::DecisionConfig;

/// Outcome of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Decision {
    SendImmediately,
    WaitForBatch,
}

impl Decision {
    #[inline]
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::SendImmediately => Self::WaitForBatch,
            Self::WaitForBatch => Self::SendImmediately,
        }
    }

    #[inline]
    pub const fn is_batch(self) -> bool {
        matches!(self, Self::WaitForBatch)
    }
}

/// Recent event counts kept by the batch manager, halved on every
/// parameter refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounters {
    pub conflicts: u32,
    pub timeouts: u32,
    pub batches: u32,
}

impl DecisionCounters {
    #[must_use]
    pub const fn halved(self) -> Self {
        Self {
            conflicts: self.conflicts / 2,
            timeouts: self.timeouts / 2,
            batches: self.batches / 2,
        }
    }
}

/// One observation fed back into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Feedback {
    /// A batched exchange finished; `success` is false when it timed out.
    Batch { latency: u64, success: bool },
    /// An individually sent exchange finished.
    Individual { latency: u64 },
    /// A batched request had to be re-sent individually.
    Timeout,
    /// The transaction aborted on a conflict.
    Conflict,
}

/// Learned statistics and adaptive thresholds of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptiveBatchingState {
    pub batch_success_rate: f64,
    pub timeout_rate: f64,
    pub conflict_rate: f64,
    pub avg_batch_latency: f64,
    pub avg_individual_latency: f64,
    pub emergency_threshold: f64,
    pub timeout_threshold: f64,
    pub batch_success_threshold: f64,
    pub exploration_rate: f64,
    pub current_wait_time: u64,
}

impl AdaptiveBatchingState {
    #[must_use]
    pub fn new(cfg: &DecisionConfig) -> Self {
        Self {
            batch_success_rate: cfg.initial_success_rate,
            timeout_rate: cfg.initial_timeout_rate,
            conflict_rate: cfg.initial_conflict_rate,
            avg_batch_latency: 0.0,
            avg_individual_latency: 0.0,
            emergency_threshold: cfg.thresholds.emergency_initial,
            timeout_threshold: cfg.thresholds.timeout_initial,
            batch_success_threshold: cfg.thresholds.batch_success_initial,
            exploration_rate: cfg.exploration.initial,
            current_wait_time: cfg.wait_time.initial,
        }
    }
}

#[inline]
fn ewma(alpha: f64, current: f64, sample: f64) -> f64 {
    alpha.mul_add(sample, (1.0 - alpha) * current)
}

/// Desirability of waiting for a batch.
#[must_use]
pub fn score_batch(state: &AdaptiveBatchingState, cfg: &DecisionConfig) -> f64 {
    let w = &cfg.batch_weights;
    let mut score = state.batch_success_rate * w.success;
    if state.conflict_rate < cfg.thresholds.read_mostly_conflict_rate {
        score += w.read_mostly_bonus;
    }
    score -= state.timeout_rate * w.timeout_penalty;
    score -= state.conflict_rate * w.conflict_penalty;
    if state.avg_batch_latency > 0.0 && state.avg_individual_latency > 0.0 {
        let ratio = state.avg_individual_latency / state.avg_batch_latency;
        if ratio > 1.0 {
            score += (ratio - 1.0) * w.latency_gain;
        } else {
            score -= (1.0 - ratio) * w.latency_loss;
        }
    }
    score += w.network_efficiency_bonus;
    score.max(0.0)
}

/// Desirability of sending immediately.
#[must_use]
pub fn score_individual(state: &AdaptiveBatchingState, cfg: &DecisionConfig) -> f64 {
    let w = &cfg.individual_weights;
    let mut score = w.base
        + (1.0 - state.timeout_rate) * w.timeout_reliability
        + (1.0 - state.conflict_rate) * w.conflict_reliability;
    if state.avg_batch_latency > 0.0 && state.avg_individual_latency > 0.0 {
        let ratio = state.avg_batch_latency / state.avg_individual_latency;
        if ratio > 1.0 {
            score += (ratio - 1.0) * w.latency_gain;
        }
    }
    if state.batch_success_rate < w.poor_batch_success {
        score += (w.poor_batch_success - state.batch_success_rate) * w.poor_batch_bonus;
    }
    score.max(0.0)
}

/// Move the adaptive wait time one EWMA step towards the target implied by
/// the current rates and counters. The result is clamped to the configured
/// bounds.
#[must_use]
pub fn next_wait_time(
    state: &AdaptiveBatchingState,
    counters: DecisionCounters,
    cfg: &DecisionConfig,
) -> AdaptiveBatchingState {
    let rm = &cfg.read_mostly;
    let mut multiplier = 1.0_f64;

    if state.batch_success_rate > 0.8 {
        multiplier *= 1.2;
    } else if state.batch_success_rate < 0.3 {
        multiplier *= 0.7;
    }
    if state.timeout_rate > 0.2 {
        multiplier *= 0.8;
    } else if state.timeout_rate < 0.05 {
        multiplier *= 1.1;
    }
    if state.conflict_rate > cfg.thresholds.struggling_conflict_rate {
        multiplier *= 0.9;
    }

    if counters.conflicts == 0 && counters.batches > rm.batch_history_min {
        multiplier *= rm.conflict_free_wait_multiplier;
    } else if counters.conflicts > rm.wait_conflict_min {
        multiplier *= rm
            .wait_conflict_slope
            .mul_add(-f64::from(counters.conflicts), 1.0)
            .max(rm.wait_conflict_floor);
    }
    if counters.timeouts > rm.wait_timeout_min {
        multiplier *= rm
            .wait_timeout_slope
            .mul_add(-f64::from(counters.timeouts), 1.0)
            .max(rm.wait_timeout_floor);
    }
    if counters.batches > rm.wait_batch_min {
        multiplier *= rm
            .wait_batch_slope
            .mul_add(f64::from(counters.batches), 1.0)
            .min(rm.wait_batch_ceiling);
    }

    let current = state.current_wait_time as f64;
    let target = current * multiplier;
    let smoothed = ewma(cfg.learning_rate, current, target);
    let bounds = cfg.wait_time;
    let next = (smoothed.max(0.0) as u64).clamp(bounds.min, bounds.max);
    AdaptiveBatchingState {
        current_wait_time: next,
        ..*state
    }
}

/// Fold one observation into the learned rates and the exploration rate.
#[must_use]
pub fn apply_feedback(
    state: &AdaptiveBatchingState,
    feedback: Feedback,
    cfg: &DecisionConfig,
) -> AdaptiveBatchingState {
    let alpha = cfg.learning_rate;
    let ex = &cfg.exploration;
    let mut next = *state;
    match feedback {
        Feedback::Batch { latency, success } => {
            next.batch_success_rate = ewma(
                alpha,
                next.batch_success_rate,
                if success { 1.0 } else { 0.0 },
            );
            if success {
                next.avg_batch_latency = ewma(alpha, next.avg_batch_latency, latency as f64);
            }
            if next.batch_success_rate > ex.decay_above_success {
                next.exploration_rate = (next.exploration_rate * cfg.decay_factor).max(ex.floor);
            } else if next.batch_success_rate < ex.grow_below_success {
                next.exploration_rate =
                    (next.exploration_rate * ex.batch_failure_growth).min(ex.batch_failure_cap);
            }
        }
        Feedback::Individual { latency } => {
            next.avg_individual_latency =
                ewma(alpha, next.avg_individual_latency, latency as f64);
        }
        Feedback::Timeout => {
            next.timeout_rate = ewma(alpha, next.timeout_rate, 1.0);
            if next.timeout_rate > ex.grow_above_timeout {
                next.exploration_rate =
                    (next.exploration_rate * ex.timeout_growth).min(ex.timeout_cap);
            }
        }
        Feedback::Conflict => {
            next.conflict_rate = ewma(alpha, next.conflict_rate, 1.0);
            if next.conflict_rate > ex.grow_above_conflict {
                next.exploration_rate =
                    (next.exploration_rate * ex.conflict_growth).min(ex.conflict_cap);
            }
        }
    }
    next
}

/// Periodic refresh: decay the rates, retune the thresholds from overall
/// efficiency, and halve the recent counters.
#[must_use]
pub fn update_parameters(
    state: &AdaptiveBatchingState,
    counters: DecisionCounters,
    cfg: &DecisionConfig,
) -> (AdaptiveBatchingState, DecisionCounters) {
    let t = &cfg.thresholds;
    let mut next = *state;

    next.batch_success_rate *= 1.0 - cfg.learning_rate * 0.1;
    next.timeout_rate *= cfg.decay_factor;
    next.conflict_rate *= cfg.decay_factor;

    let efficiency =
        next.batch_success_rate * (1.0 - next.timeout_rate) * (1.0 - next.conflict_rate);
    let read_mostly = next.conflict_rate < t.read_mostly_conflict_rate
        && next.batch_success_rate > t.read_mostly_success_rate;

    if efficiency > t.high_efficiency || read_mostly {
        next.emergency_threshold = (next.emergency_threshold - t.emergency_relax_step)
            .max(t.emergency_update_band.floor);
        next.timeout_threshold =
            (next.timeout_threshold - t.timeout_relax_step).max(t.timeout_update_band.floor);
        next.batch_success_threshold = (next.batch_success_threshold
            - t.batch_success_relax_step)
            .max(t.batch_success_update_band.floor);
    } else if efficiency < t.low_efficiency && next.conflict_rate > t.struggling_conflict_rate {
        next.emergency_threshold =
            (next.emergency_threshold + t.tighten_step).min(t.emergency_update_band.cap);
        next.timeout_threshold =
            (next.timeout_threshold + t.tighten_step).min(t.timeout_update_band.cap);
        next.batch_success_threshold = (next.batch_success_threshold
            + t.batch_success_tighten_step)
            .min(t.batch_success_update_band.cap);
    }

    (next, counters.halved())
}

/// Per-thread decision engine.
#[derive(Debug)]
pub struct BatchDecisionEngine {
    cfg: DecisionConfig,
    state: AdaptiveBatchingState,
    rng: StdRng,
    calls: u32,
    last_decision: Option<u64>,
}

impl BatchDecisionEngine {
    pub fn new(cfg: DecisionConfig, seed: u64) -> Self {
        Self {
            state: AdaptiveBatchingState::new(&cfg),
            cfg,
            rng: StdRng::seed_from_u64(seed),
            calls: 0,
            last_decision: None,
        }
    }

    #[inline]
    pub const fn state(&self) -> &AdaptiveBatchingState {
        &self.state
    }

    #[inline]
    pub const fn config(&self) -> &DecisionConfig {
        &self.cfg
    }

    /// Decide for one outbound request at time `now`.
    ///
    /// Every `refresh_interval`-th call first runs [`update_parameters`],
    /// which halves `counters` in place.
    pub fn should_wait_for_batch(&mut self, counters: &mut DecisionCounters, now: u64) -> Decision {
        self.calls = self.calls.wrapping_add(1);
        if self.calls % self.cfg.refresh_interval == 0 {
            let (state, halved) = update_parameters(&self.state, *counters, &self.cfg);
            self.state = state;
            *counters = halved;
        }

        let mut batch = score_batch(&self.state, &self.cfg);
        let mut individual = score_individual(&self.state, &self.cfg);

        if self.rng.r#gen::<f64>() < self.state.exploration_rate {
            let greedy = if batch > individual {
                Decision::WaitForBatch
            } else {
                Decision::SendImmediately
            };
            return greedy.inverse();
        }

        if self
            .last_decision
            .is_some_and(|prev| now.saturating_sub(prev) < self.cfg.high_frequency_window)
        {
            batch *= self.cfg.high_frequency_bonus;
        }
        self.last_decision = Some(now);

        let rm = &self.cfg.read_mostly;
        let t = &self.cfg.thresholds;
        if counters.conflicts == 0 {
            batch *= rm.conflict_free_batch_multiplier;
            if counters.batches > rm.batch_history_min {
                batch *= rm.batch_history_multiplier;
            }
        }

        if f64::from(counters.conflicts) > self.state.emergency_threshold {
            individual *= rm.emergency_individual_multiplier;
            self.state.emergency_threshold = (self.state.emergency_threshold
                + t.decision_raise_step)
                .min(t.emergency_decision_band.cap);
        } else if counters.conflicts == 0 && counters.batches > rm.emergency_relax_batches {
            self.state.emergency_threshold = (self.state.emergency_threshold
                - t.decision_relax_step)
                .max(t.emergency_decision_band.floor);
        }

        if f64::from(counters.timeouts) > self.state.timeout_threshold {
            individual *= rm.timeout_individual_multiplier;
            self.state.timeout_threshold = (self.state.timeout_threshold
                + t.decision_raise_step)
                .min(t.timeout_decision_band.cap);
        } else if counters.timeouts == 0 && counters.batches > rm.timeout_relax_batches {
            self.state.timeout_threshold = (self.state.timeout_threshold
                - t.decision_relax_step)
                .max(t.timeout_decision_band.floor);
        }

        if batch > individual {
            Decision::WaitForBatch
        } else {
            Decision::SendImmediately
        }
    }

    /// Advance and return the adaptive wait time.
    pub fn calculate_wait_time(&mut self, counters: DecisionCounters) -> u64 {
        self.state = next_wait_time(&self.state, counters, &self.cfg);
        self.state.current_wait_time
    }

    /// Current wait time without advancing it.
    #[inline]
    pub const fn wait_time(&self) -> u64 {
        self.state.current_wait_time
    }

    pub fn report(&mut self, feedback: Feedback) {
        self.state = apply_feedback(&self.state, feedback, &self.cfg);
    }

    pub fn report_batch_outcome(&mut self, latency: u64, success: bool) {
        self.report(Feedback::Batch { latency, success });
    }

    pub fn report_individual_outcome(&mut self, latency: u64) {
        self.report(Feedback::Individual { latency });
    }

    pub fn report_timeout(&mut self) {
        self.report(Feedback::Timeout);
    }

    pub fn report_conflict(&mut self) {
        self.report(Feedback::Conflict);
    }
}
