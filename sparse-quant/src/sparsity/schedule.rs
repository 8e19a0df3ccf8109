//! Mask update schedule.
//!
//! A layer recomputes its mask when the step counter hits the next target
//! step and the shot budget is not exhausted. Each update moves the next
//! target `mask_update_interval` steps further.

use serde::{Deserialize, Serialize};

use crate::config::SparsityConfig;

/// Whether the mask should be recomputed at `step`.
///
/// `num_shots == -1` never runs out; otherwise at most `num_shots` updates
/// happen. Recomputation only happens at exactly `target_step`.
#[must_use]
pub fn should_update_mask(
    step: u64,
    target_step: u64,
    mask_update_count: u64,
    num_shots: i64,
) -> bool {
    let should_do_pruning = num_shots == -1
        || i64::try_from(mask_update_count).is_ok_and(|count| count < num_shots);
    let should_pruning_step = step == target_step;
    should_do_pruning && should_pruning_step
}

/// `base + interval * mask_update_count`, saturating.
#[must_use]
pub fn next_target_step(base: u64, interval: i64, mask_update_count: u64) -> u64 {
    let interval = u64::try_from(interval).unwrap_or(0);
    base.saturating_add(interval.saturating_mul(mask_update_count))
}

/// Durable per-layer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Forward calls seen so far.
    pub step: u64,
    /// Mask recomputations performed so far.
    pub mask_update_count: u64,
    /// Shot budget, `-1` for unbounded.
    pub num_shots: i64,
}

impl ScheduleState {
    /// Fresh counters with the given shot budget.
    #[must_use]
    pub const fn new(num_shots: i64) -> Self {
        Self {
            step: 0,
            mask_update_count: 0,
            num_shots,
        }
    }

    /// Fresh counters with the budget implied by `config`.
    #[must_use]
    pub fn for_config(config: &SparsityConfig) -> Self {
        Self::new(config.effective_num_shots())
    }

    /// Step at which the next mask recomputation is due.
    #[must_use]
    pub fn target_step(&self, config: &SparsityConfig) -> u64 {
        next_target_step(
            config.target_step,
            config.mask_update_interval,
            self.mask_update_count,
        )
    }

    /// Decide whether the current call recomputes the mask for `layer_idx`.
    #[must_use]
    pub fn decide(&self, config: &SparsityConfig, layer_idx: usize) -> bool {
        should_update_mask(
            self.step,
            self.target_step(config),
            self.mask_update_count,
            self.num_shots,
        ) && config.sparsified_layers.contains(layer_idx)
    }

    /// Advance the counters after one forward call.
    pub fn advance(&mut self, mask_updated: bool) {
        if mask_updated {
            self.mask_update_count += 1;
        }
        self.step += 1;
    }

    /// Whether the shot budget is used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.num_shots != -1
            && i64::try_from(self.mask_update_count).map_or(true, |c| c >= self.num_shots)
    }
}
