//! Batching configuration.
//!
//! Every constant the decision engine uses is a named field here. The
//! read-mostly multipliers and conflict/timeout count cut-offs in
//! [`ReadMostlyTunables`] are empirical: they were tuned on key/value and
//! order-entry workloads and should be recalibrated per workload rather
//! than treated as fixed. Times are in clock cycles (nanoseconds with the
//! default clock).

use dmtxn_error::{DmtxnError, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workload presets
// ---------------------------------------------------------------------------

/// Preset families for the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadProfile {
    /// Short waits and little exploration: prefer individual sends.
    LatencySensitive,
    /// Long waits: prefer fuller batches.
    ThroughputOriented,
    /// Middle ground between the two.
    Balanced,
    /// Default tunables; the engine adapts online.
    #[default]
    Adaptive,
}

// ---------------------------------------------------------------------------
// Decision engine tunables
// ---------------------------------------------------------------------------

/// Epsilon-greedy exploration bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    /// Initial epsilon.
    pub initial: f64,
    /// Floor reached under consistently successful batching.
    pub floor: f64,
    /// Cap when batches keep failing.
    pub batch_failure_cap: f64,
    /// Cap when timeouts are frequent.
    pub timeout_cap: f64,
    /// Cap when conflicts are frequent.
    pub conflict_cap: f64,
    /// Growth factor applied on poor batch success.
    pub batch_failure_growth: f64,
    /// Growth factor applied on frequent timeouts.
    pub timeout_growth: f64,
    /// Growth factor applied on frequent conflicts.
    pub conflict_growth: f64,
    /// Success rate above which exploration decays.
    pub decay_above_success: f64,
    /// Success rate below which exploration grows.
    pub grow_below_success: f64,
    /// Timeout rate above which exploration grows.
    pub grow_above_timeout: f64,
    /// Conflict rate above which exploration grows.
    pub grow_above_conflict: f64,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            initial: 0.1,
            floor: 0.05,
            batch_failure_cap: 0.2,
            timeout_cap: 0.25,
            conflict_cap: 0.3,
            batch_failure_growth: 1.05,
            timeout_growth: 1.1,
            conflict_growth: 1.15,
            decay_above_success: 0.7,
            grow_below_success: 0.4,
            grow_above_timeout: 0.15,
            grow_above_conflict: 0.2,
        }
    }
}

/// Adaptive wait-time bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitTimeConfig {
    pub min: u64,
    pub max: u64,
    pub initial: u64,
}

impl Default for WaitTimeConfig {
    fn default() -> Self {
        Self {
            min: 1_000,
            max: 50_000,
            initial: 10_000,
        }
    }
}

/// A clamping band for one adaptive threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub floor: f64,
    pub cap: f64,
}

impl ThresholdBand {
    pub const fn new(floor: f64, cap: f64) -> Self {
        Self { floor, cap }
    }

    #[inline]
    #[must_use]
    pub fn clamp(self, value: f64) -> f64 {
        value.clamp(self.floor, self.cap)
    }
}

/// Adaptive thresholds: initial values, bands and step sizes.
///
/// Two places move the thresholds. The periodic parameter update nudges all
/// three by small steps inside the `*_update_band`s; the per-decision
/// counter check moves emergency and timeout thresholds by larger steps
/// inside the `*_decision_band`s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub emergency_initial: f64,
    pub timeout_initial: f64,
    pub batch_success_initial: f64,

    pub emergency_update_band: ThresholdBand,
    pub timeout_update_band: ThresholdBand,
    pub batch_success_update_band: ThresholdBand,
    pub emergency_decision_band: ThresholdBand,
    pub timeout_decision_band: ThresholdBand,

    /// Emergency relaxation per healthy parameter update.
    pub emergency_relax_step: f64,
    /// Timeout relaxation per healthy parameter update.
    pub timeout_relax_step: f64,
    /// Batch-success relaxation per healthy parameter update.
    pub batch_success_relax_step: f64,
    /// Emergency and timeout tightening per struggling parameter update.
    pub tighten_step: f64,
    /// Batch-success tightening per struggling parameter update.
    pub batch_success_tighten_step: f64,
    /// Raise applied when a counter exceeds its threshold at decision time.
    pub decision_raise_step: f64,
    /// Relaxation applied at decision time when the counter is zero.
    pub decision_relax_step: f64,

    /// Efficiency above which thresholds relax.
    pub high_efficiency: f64,
    /// Efficiency below which (with high conflicts) thresholds tighten.
    pub low_efficiency: f64,
    /// Conflict rate below which a workload counts as read-mostly.
    pub read_mostly_conflict_rate: f64,
    /// Success rate that must accompany the read-mostly relaxation.
    pub read_mostly_success_rate: f64,
    /// Conflict rate above which thresholds tighten.
    pub struggling_conflict_rate: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            emergency_initial: 10.0,
            timeout_initial: 10.0,
            batch_success_initial: 5.0,
            emergency_update_band: ThresholdBand::new(3.0, 15.0),
            timeout_update_band: ThresholdBand::new(3.0, 15.0),
            batch_success_update_band: ThresholdBand::new(2.0, 8.0),
            emergency_decision_band: ThresholdBand::new(5.0, 20.0),
            timeout_decision_band: ThresholdBand::new(3.0, 20.0),
            emergency_relax_step: 0.2,
            timeout_relax_step: 0.1,
            batch_success_relax_step: 0.1,
            tighten_step: 0.2,
            batch_success_tighten_step: 0.1,
            decision_raise_step: 1.0,
            decision_relax_step: 0.5,
            high_efficiency: 0.8,
            low_efficiency: 0.5,
            read_mostly_conflict_rate: 0.05,
            read_mostly_success_rate: 0.6,
            struggling_conflict_rate: 0.15,
        }
    }
}

/// Weights of the batch score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchScoreWeights {
    pub success: f64,
    pub read_mostly_bonus: f64,
    pub timeout_penalty: f64,
    pub conflict_penalty: f64,
    pub latency_gain: f64,
    pub latency_loss: f64,
    pub network_efficiency_bonus: f64,
}

impl Default for BatchScoreWeights {
    fn default() -> Self {
        Self {
            success: 100.0,
            read_mostly_bonus: 100.0,
            timeout_penalty: 50.0,
            conflict_penalty: 60.0,
            latency_gain: 30.0,
            latency_loss: 25.0,
            network_efficiency_bonus: 20.0,
        }
    }
}

/// Weights of the individual-send score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndividualScoreWeights {
    pub base: f64,
    pub timeout_reliability: f64,
    pub conflict_reliability: f64,
    pub latency_gain: f64,
    pub poor_batch_bonus: f64,
    /// Success rate under which batching counts as poor.
    pub poor_batch_success: f64,
}

impl Default for IndividualScoreWeights {
    fn default() -> Self {
        Self {
            base: 50.0,
            timeout_reliability: 30.0,
            conflict_reliability: 25.0,
            latency_gain: 35.0,
            poor_batch_bonus: 40.0,
            poor_batch_success: 0.5,
        }
    }
}

/// Counter-driven heuristics: read-mostly detection and wait scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadMostlyTunables {
    /// Batch score multiplier when no recent conflicts were counted.
    pub conflict_free_batch_multiplier: f64,
    /// Extra batch multiplier with a recent batching history.
    pub batch_history_multiplier: f64,
    /// Recent batches needed for the history multiplier and the wait doubling.
    pub batch_history_min: u32,
    /// Individual score multiplier when conflicts exceed the emergency threshold.
    pub emergency_individual_multiplier: f64,
    /// Individual score multiplier when timeouts exceed the timeout threshold.
    pub timeout_individual_multiplier: f64,
    /// Recent batches needed before the emergency threshold relaxes.
    pub emergency_relax_batches: u32,
    /// Recent batches needed before the timeout threshold relaxes.
    pub timeout_relax_batches: u32,

    /// Wait multiplier for conflict-free workloads with batch history.
    pub conflict_free_wait_multiplier: f64,
    /// Recent conflicts above which waits shrink.
    pub wait_conflict_min: u32,
    pub wait_conflict_slope: f64,
    pub wait_conflict_floor: f64,
    /// Recent timeouts above which waits shrink.
    pub wait_timeout_min: u32,
    pub wait_timeout_slope: f64,
    pub wait_timeout_floor: f64,
    /// Recent batches above which waits grow.
    pub wait_batch_min: u32,
    pub wait_batch_slope: f64,
    pub wait_batch_ceiling: f64,
}

impl Default for ReadMostlyTunables {
    fn default() -> Self {
        Self {
            conflict_free_batch_multiplier: 2.0,
            batch_history_multiplier: 1.5,
            batch_history_min: 2,
            emergency_individual_multiplier: 1.5,
            timeout_individual_multiplier: 1.3,
            emergency_relax_batches: 5,
            timeout_relax_batches: 3,
            conflict_free_wait_multiplier: 2.0,
            wait_conflict_min: 3,
            wait_conflict_slope: 0.1,
            wait_conflict_floor: 0.5,
            wait_timeout_min: 3,
            wait_timeout_slope: 0.08,
            wait_timeout_floor: 0.6,
            wait_batch_min: 5,
            wait_batch_slope: 0.05,
            wait_batch_ceiling: 1.5,
        }
    }
}

/// All decision engine tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// EWMA learning rate (alpha).
    pub learning_rate: f64,
    /// Decay applied to timeout/conflict rates and to exploration.
    pub decay_factor: f64,
    /// Initial EWMA rates.
    pub initial_success_rate: f64,
    pub initial_timeout_rate: f64,
    pub initial_conflict_rate: f64,
    /// Parameter update period, in decisions.
    pub refresh_interval: u32,
    /// Decisions closer together than this get the high-frequency bonus.
    pub high_frequency_window: u64,
    pub high_frequency_bonus: f64,

    pub exploration: ExplorationConfig,
    pub wait_time: WaitTimeConfig,
    pub thresholds: ThresholdConfig,
    pub batch_weights: BatchScoreWeights,
    pub individual_weights: IndividualScoreWeights,
    pub read_mostly: ReadMostlyTunables,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            decay_factor: 0.9,
            initial_success_rate: 0.9,
            initial_timeout_rate: 0.1,
            initial_conflict_rate: 0.1,
            refresh_interval: 10,
            high_frequency_window: 100_000,
            high_frequency_bonus: 1.2,
            exploration: ExplorationConfig::default(),
            wait_time: WaitTimeConfig::default(),
            thresholds: ThresholdConfig::default(),
            batch_weights: BatchScoreWeights::default(),
            individual_weights: IndividualScoreWeights::default(),
            read_mostly: ReadMostlyTunables::default(),
        }
    }
}

impl DecisionConfig {
    /// Tunables for a workload preset.
    #[must_use]
    pub fn preset(profile: WorkloadProfile) -> Self {
        let base = Self::default();
        match profile {
            WorkloadProfile::Adaptive => base,
            WorkloadProfile::Balanced => Self {
                wait_time: WaitTimeConfig {
                    min: 5_000,
                    max: 100_000,
                    initial: 30_000,
                },
                decay_factor: 0.95,
                ..base
            },
            WorkloadProfile::LatencySensitive => Self {
                wait_time: WaitTimeConfig {
                    min: 500,
                    max: 10_000,
                    initial: 2_000,
                },
                exploration: ExplorationConfig {
                    initial: 0.05,
                    ..base.exploration
                },
                ..base
            },
            WorkloadProfile::ThroughputOriented => Self {
                wait_time: WaitTimeConfig {
                    min: 5_000,
                    max: 100_000,
                    initial: 30_000,
                },
                read_mostly: ReadMostlyTunables {
                    conflict_free_batch_multiplier: 2.5,
                    wait_batch_ceiling: 2.0,
                    ..base.read_mostly
                },
                ..base
            },
        }
    }

    /// Check ranges. Rates must be probabilities, bands ordered, waits ordered.
    pub fn validate(&self) -> Result<()> {
        let unit = |field: &'static str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(DmtxnError::invalid_config(field, format!("{v} is not in [0, 1]")))
            }
        };
        unit("batching.decision.learning_rate", self.learning_rate)?;
        unit("batching.decision.decay_factor", self.decay_factor)?;
        unit("batching.decision.initial_success_rate", self.initial_success_rate)?;
        unit("batching.decision.initial_timeout_rate", self.initial_timeout_rate)?;
        unit("batching.decision.initial_conflict_rate", self.initial_conflict_rate)?;
        unit("batching.decision.exploration.initial", self.exploration.initial)?;
        unit("batching.decision.exploration.floor", self.exploration.floor)?;
        if self.exploration.floor > self.exploration.initial {
            return Err(DmtxnError::invalid_config(
                "batching.decision.exploration.floor",
                "floor exceeds initial exploration rate",
            ));
        }
        if self.refresh_interval == 0 {
            return Err(DmtxnError::invalid_config(
                "batching.decision.refresh_interval",
                "must be at least 1",
            ));
        }
        let w = self.wait_time;
        if w.min == 0 || w.min > w.max || !(w.min..=w.max).contains(&w.initial) {
            return Err(DmtxnError::invalid_config(
                "batching.decision.wait_time",
                format!("need 0 < min <= initial <= max, got {}/{}/{}", w.min, w.initial, w.max),
            ));
        }
        let t = &self.thresholds;
        for (field, band) in [
            ("batching.decision.thresholds.emergency_update_band", t.emergency_update_band),
            ("batching.decision.thresholds.timeout_update_band", t.timeout_update_band),
            (
                "batching.decision.thresholds.batch_success_update_band",
                t.batch_success_update_band,
            ),
            ("batching.decision.thresholds.emergency_decision_band", t.emergency_decision_band),
            ("batching.decision.thresholds.timeout_decision_band", t.timeout_decision_band),
        ] {
            if band.floor > band.cap {
                return Err(DmtxnError::invalid_config(field, "floor exceeds cap"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Group / leader configuration
// ---------------------------------------------------------------------------

/// Batching layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Master switch. When off every request is sent individually.
    pub enabled: bool,
    /// Threads per batch group (G).
    pub group_size: u32,
    /// Group count the deployment is sized for; batching only engages once
    /// more than two thirds of these groups exist.
    pub max_groups: u32,
    /// Cycles a leader keeps its role before stepping down.
    pub leader_threshold: u64,
    /// Cycles a leader spends collecting one node's requests.
    pub leader_wait_time: u64,
    /// Preset used when `decision` is not given explicitly.
    pub profile: WorkloadProfile,
    /// Explicit engine tunables, overriding the preset.
    pub decision: Option<DecisionConfig>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group_size: 8,
            max_groups: 1,
            leader_threshold: 100_000,
            leader_wait_time: 10_000,
            profile: WorkloadProfile::Adaptive,
            decision: None,
        }
    }
}

impl BatchingConfig {
    /// Tunables in effect: explicit ones if given, else the preset.
    #[must_use]
    pub fn decision_config(&self) -> DecisionConfig {
        self.decision
            .unwrap_or_else(|| DecisionConfig::preset(self.profile))
    }

    #[must_use]
    pub const fn with_group_size(mut self, group_size: u32) -> Self {
        self.group_size = group_size;
        self
    }

    #[must_use]
    pub const fn with_max_groups(mut self, max_groups: u32) -> Self {
        self.max_groups = max_groups;
        self
    }

    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_profile(mut self, profile: WorkloadProfile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub const fn with_leader_wait_time(mut self, cycles: u64) -> Self {
        self.leader_wait_time = cycles;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_size < 2 {
            return Err(DmtxnError::invalid_config(
                "batching.group_size",
                "must be at least 2",
            ));
        }
        if self.max_groups == 0 {
            return Err(DmtxnError::invalid_config(
                "batching.max_groups",
                "must be at least 1",
            ));
        }
        self.decision_config().validate()
    }
}
