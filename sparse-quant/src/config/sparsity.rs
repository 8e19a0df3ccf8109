//! Configuration for scheduled structured sparsity.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};

/// How the sparsifier behaves over a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparsityMode {
    /// Masks are frozen into the deployed weight; the weight passes through.
    #[default]
    Inference,
    /// Recompute the mask on every scheduled step, indefinitely.
    Training,
    /// Same schedule as `Training`, used when materializing sparse weights.
    Materialize,
    /// Compute the mask once at `target_step`.
    OneShot,
    /// Compute the mask `num_shots` times, `mask_update_interval` apart.
    FewShot,
}

/// Sparsity structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparsityType {
    /// N of every M consecutive elements are pruned.
    #[default]
    StructuredNm,
    /// Any element may be pruned. Not implemented.
    Unstructured,
}

/// Importance score used to choose which elements survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparsityScore {
    /// `|w|`.
    #[default]
    Magnitude,
    /// `|w|` scaled by the L1 norm of the matching input feature.
    ActivationWeighted,
}

/// Pruning rate, structured or as a fraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneRate {
    /// Prune `n` out of every `m` consecutive elements.
    Nm {
        /// Elements pruned per block.
        n: usize,
        /// Block length.
        m: usize,
    },
    /// Prune this fraction of all elements.
    Fraction(f32),
}

impl PruneRate {
    /// Fraction of elements this rate removes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sparsity(&self) -> f32 {
        match *self {
            Self::Nm { n, m } => n as f32 / m as f32,
            Self::Fraction(f) => f,
        }
    }
}

impl Default for PruneRate {
    fn default() -> Self {
        Self::Nm { n: 2, m: 4 }
    }
}

/// Which layers take part in mask updates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSelection {
    /// Every layer.
    #[default]
    All,
    /// Only the listed layer indices.
    Indices(BTreeSet<usize>),
}

impl LayerSelection {
    /// Select the given layer indices.
    pub fn indices(layers: impl IntoIterator<Item = usize>) -> Self {
        Self::Indices(layers.into_iter().collect())
    }

    /// Whether `layer_idx` is selected.
    #[must_use]
    pub fn contains(&self, layer_idx: usize) -> bool {
        match self {
            Self::All => true,
            Self::Indices(layers) => layers.contains(&layer_idx),
        }
    }
}

/// Configuration for the sparsity scheduler.
///
/// The mask for a layer is recomputed when `step` reaches
/// `target_step + mask_update_interval * mask_update_count`, as long as the
/// shot budget for the mode is not exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsityConfig {
    /// Scheduling mode.
    pub mode: SparsityMode,

    /// Sparsity structure.
    pub sparsity_type: SparsityType,

    /// Pruning rate.
    pub prune_rate: PruneRate,

    /// Importance score.
    pub score: SparsityScore,

    /// Step of the first mask computation.
    pub target_step: u64,

    /// Steps between consecutive mask computations.
    pub mask_update_interval: i64,

    /// Shot budget for `FewShot`. `-1` means unbounded.
    pub num_shots: i64,

    /// Layers that take part in mask updates.
    pub sparsified_layers: LayerSelection,
}

impl Default for SparsityConfig {
    fn default() -> Self {
        Self {
            mode: SparsityMode::Inference,
            sparsity_type: SparsityType::StructuredNm,
            prune_rate: PruneRate::default(),
            score: SparsityScore::Magnitude,
            target_step: 0,
            mask_update_interval: 1,
            num_shots: 0,
            sparsified_layers: LayerSelection::All,
        }
    }
}

impl SparsityConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inference configuration: weights pass through untouched.
    #[must_use]
    pub fn inference() -> Self {
        Self::default()
    }

    /// Prune `n` of every `m` elements once, at `target_step`.
    #[must_use]
    pub fn one_shot(n: usize, m: usize, target_step: u64) -> Self {
        Self {
            mode: SparsityMode::OneShot,
            prune_rate: PruneRate::Nm { n, m },
            target_step,
            ..Default::default()
        }
    }

    /// Prune `n` of every `m` elements `num_shots` times, `interval` steps
    /// apart, starting at `target_step`.
    #[must_use]
    pub fn few_shot(n: usize, m: usize, target_step: u64, interval: i64, num_shots: i64) -> Self {
        Self {
            mode: SparsityMode::FewShot,
            prune_rate: PruneRate::Nm { n, m },
            target_step,
            mask_update_interval: interval,
            num_shots,
            ..Default::default()
        }
    }

    /// Recompute the `n:m` mask every `interval` steps from `target_step` on.
    #[must_use]
    pub fn continuous(n: usize, m: usize, target_step: u64, interval: i64) -> Self {
        Self {
            mode: SparsityMode::Training,
            prune_rate: PruneRate::Nm { n, m },
            target_step,
            mask_update_interval: interval,
            num_shots: -1,
            ..Default::default()
        }
    }

    /// Set the mode.
    #[must_use]
    pub fn with_mode(mut self, mode: SparsityMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the sparsity type.
    #[must_use]
    pub fn with_sparsity_type(mut self, sparsity_type: SparsityType) -> Self {
        self.sparsity_type = sparsity_type;
        self
    }

    /// Set the prune rate.
    #[must_use]
    pub fn with_prune_rate(mut self, prune_rate: PruneRate) -> Self {
        self.prune_rate = prune_rate;
        self
    }

    /// Set the importance score.
    #[must_use]
    pub fn with_score(mut self, score: SparsityScore) -> Self {
        self.score = score;
        self
    }

    /// Restrict mask updates to the given layers.
    #[must_use]
    pub fn with_sparsified_layers(mut self, layers: LayerSelection) -> Self {
        self.sparsified_layers = layers;
        self
    }

    /// Shot budget implied by the mode: `-1` unbounded, `0` never.
    #[must_use]
    pub fn effective_num_shots(&self) -> i64 {
        match self.mode {
            SparsityMode::Inference => 0,
            SparsityMode::Training | SparsityMode::Materialize => -1,
            SparsityMode::OneShot => 1,
            SparsityMode::FewShot => self.num_shots,
        }
    }

    /// `(n, m)` for structured sparsity, `None` otherwise.
    #[must_use]
    pub fn nm(&self) -> Option<(usize, usize)> {
        match self.prune_rate {
            PruneRate::Nm { n, m } => Some((n, m)),
            PruneRate::Fraction(_) => None,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidScheduleConfig`] for a negative
    /// `mask_update_interval` or `num_shots < -1`, and
    /// [`TransformError::InvalidConfig`] when the prune rate does not fit
    /// the sparsity type.
    pub fn validate(&self) -> Result<()> {
        if self.mask_update_interval < 0 {
            return Err(TransformError::InvalidScheduleConfig(format!(
                "mask_update_interval must be >= 0, got {}",
                self.mask_update_interval
            )));
        }

        if self.num_shots < -1 {
            return Err(TransformError::InvalidScheduleConfig(format!(
                "num_shots must be >= -1, got {}",
                self.num_shots
            )));
        }

        match (self.sparsity_type, self.prune_rate) {
            (SparsityType::StructuredNm, PruneRate::Nm { n, m }) => {
                if m == 0 {
                    return Err(TransformError::InvalidConfig(
                        "m must be > 0 for n:m sparsity".to_string(),
                    ));
                }
                if n >= m {
                    return Err(TransformError::InvalidConfig(format!(
                        "n must be lower than m, got {n}:{m}"
                    )));
                }
            }
            (SparsityType::Unstructured, PruneRate::Fraction(f)) => {
                if !(0.0..1.0).contains(&f) {
                    return Err(TransformError::InvalidConfig(format!(
                        "prune fraction must be in [0, 1), got {f}"
                    )));
                }
            }
            (sparsity_type, prune_rate) => {
                return Err(TransformError::InvalidConfig(format!(
                    "prune rate {prune_rate:?} does not match sparsity type {sparsity_type:?}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SparsityConfig::default();
        assert_eq!(config.mode, SparsityMode::Inference);
        assert_eq!(config.nm(), Some((2, 4)));
        assert_eq!(config.effective_num_shots(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_num_shots_by_mode() {
        assert_eq!(SparsityConfig::one_shot(2, 4, 0).effective_num_shots(), 1);
        assert_eq!(
            SparsityConfig::few_shot(2, 4, 0, 5, 3).effective_num_shots(),
            3
        );
        assert_eq!(
            SparsityConfig::continuous(2, 4, 0, 5).effective_num_shots(),
            -1
        );
        assert_eq!(
            SparsityConfig::continuous(2, 4, 0, 5)
                .with_mode(SparsityMode::Materialize)
                .effective_num_shots(),
            -1
        );
    }

    #[test]
    fn test_schedule_rejection() {
        let err = SparsityConfig::few_shot(2, 4, 10, 5, -2)
            .validate()
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidScheduleConfig(_)));

        let err = SparsityConfig::continuous(2, 4, 10, -1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidScheduleConfig(_)));
    }

    #[test]
    fn test_prune_rate_rejection() {
        assert!(SparsityConfig::one_shot(4, 1, 0).validate().is_err());
        assert!(SparsityConfig::one_shot(4, 4, 0).validate().is_err());
        assert!(SparsityConfig::one_shot(0, 0, 0).validate().is_err());

        let mismatched = SparsityConfig::one_shot(1, 4, 0).with_prune_rate(PruneRate::Fraction(0.1));
        assert!(matches!(
            mismatched.validate(),
            Err(TransformError::InvalidConfig(_))
        ));

        let unstructured = SparsityConfig::one_shot(1, 4, 0)
            .with_sparsity_type(SparsityType::Unstructured);
        assert!(unstructured.validate().is_err());
        assert!(unstructured
            .with_prune_rate(PruneRate::Fraction(0.2))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_layer_selection() {
        assert!(LayerSelection::All.contains(7));
        let some = LayerSelection::indices([1, 3]);
        assert!(some.contains(1));
        assert!(some.contains(3));
        assert!(!some.contains(2));
    }

    #[test]
    fn test_prune_rate_sparsity() {
        assert!((PruneRate::Nm { n: 2, m: 4 }.sparsity() - 0.5).abs() < f32::EPSILON);
        assert!((PruneRate::Fraction(0.3).sparsity() - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = SparsityConfig::few_shot(1, 4, 100, 20, 3)
            .with_score(SparsityScore::ActivationWeighted)
            .with_sparsified_layers(LayerSelection::indices([0, 2]));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mode\":\"few_shot\""));
        assert!(json.contains("\"nm\":{\"n\":1,\"m\":4}"));

        let parsed: SparsityConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
