//! Scheduled structured sparsification of layer weights.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, trace};

use crate::config::{SparsityConfig, SparsityMode, SparsityType};
use crate::error::{Result, TransformError};
use crate::sparsity::mask::{apply_sparsity, nm_mask, reshape_mask};
use crate::sparsity::score::compute_score;
use crate::sparsity::state::LayerSparsityState;
use crate::store::{VariableStore, MASK_UPDATE_COUNT};
use crate::summary::{SummaryWriter, TracingSummary};

/// Verbosity of the per-call update counter summary.
const UPDATE_COUNT_VERBOSITY: u8 = 4;

/// Applies a [`SparsityConfig`] to weights, one forward call at a time.
#[derive(Clone)]
pub struct Sparsifier {
    config: SparsityConfig,
    summary: Arc<dyn SummaryWriter>,
}

impl std::fmt::Debug for Sparsifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sparsifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Sparsifier {
    /// Create a sparsifier, rejecting invalid schedules up front.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidScheduleConfig`] or
    /// [`TransformError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: SparsityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            summary: Arc::new(TracingSummary),
        })
    }

    /// Route summaries to `summary` instead of `tracing`.
    #[must_use]
    pub fn with_summary_writer(mut self, summary: Arc<dyn SummaryWriter>) -> Self {
        self.summary = summary;
        self
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &SparsityConfig {
        &self.config
    }

    /// Fresh state for a weight of `shape`.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn init_state(
        &self,
        shape: &[usize],
        device: &candle_core::Device,
    ) -> Result<LayerSparsityState> {
        LayerSparsityState::new(shape, device, &self.config)
    }

    /// Declare mask and counters for weight `name`. Inference mode declares
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails or a name is taken.
    pub fn create_aux_variables(
        &self,
        store: &mut dyn VariableStore,
        name: &str,
        shape: &[usize],
        device: &candle_core::Device,
    ) -> Result<()> {
        if self.config.mode == SparsityMode::Inference {
            return Ok(());
        }
        debug!(name, ?shape, "creating sparsity variables");
        self.init_state(shape, device)?.create_variables(store, name)
    }

    /// Run one forward call's worth of sparsification on `weight`.
    ///
    /// Decides once whether this call recomputes the mask. On an update the
    /// mask is rebuilt from the importance score and applied; otherwise the
    /// weight passes through and only `step` advances.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::UnsupportedConfiguration`] for sparsity types
    /// other than structured N:M, [`TransformError::ShapeMismatch`] if the
    /// stored mask cannot be reshaped to the weight, and scoring errors.
    pub fn apply(
        &self,
        state: &mut LayerSparsityState,
        weight: &Tensor,
        inputs: Option<&Tensor>,
        layer_idx: usize,
    ) -> Result<Tensor> {
        if self.config.mode == SparsityMode::Inference {
            return Ok(weight.clone());
        }
        if self.config.sparsity_type != SparsityType::StructuredNm {
            return Err(TransformError::unsupported(
                "only structured N:M sparsity is implemented",
                self.config.sparsity_type,
            ));
        }

        let stored_shape = state.mask.dims().to_vec();
        let mut mask = reshape_mask(&state.mask, weight.dims())?;

        let update = state.schedule.decide(&self.config, layer_idx);
        if update {
            let (n, m) = self.config.nm().ok_or_else(|| {
                TransformError::InvalidConfig("structured sparsity needs an N:M rate".to_string())
            })?;
            let score = compute_score(weight, self.config.score, inputs)?;
            mask = nm_mask(&score, n, m)?;
            debug!(
                layer_idx,
                step = state.schedule.step,
                count = state.schedule.mask_update_count + 1,
                "recomputed sparsity mask"
            );
        } else {
            trace!(layer_idx, step = state.schedule.step, "mask unchanged");
        }
        state.schedule.advance(update);
        state.mask = mask.reshape(stored_shape)?;

        if state.schedule.num_shots > 0 {
            self.summary.add_summary(
                MASK_UPDATE_COUNT,
                state.schedule.mask_update_count as f64,
                UPDATE_COUNT_VERBOSITY,
            );
        }

        if update {
            apply_sparsity(weight, &mask)
        } else {
            Ok(weight.clone())
        }
    }

    /// [`Sparsifier::apply`] with state read from and written back to `store`.
    ///
    /// # Errors
    ///
    /// Returns error if the variables of `name` are missing or the step fails.
    pub fn apply_with_store(
        &self,
        store: &mut dyn VariableStore,
        name: &str,
        weight: &Tensor,
        inputs: Option<&Tensor>,
        layer_idx: usize,
    ) -> Result<Tensor> {
        if self.config.mode == SparsityMode::Inference {
            return Ok(weight.clone());
        }
        let mut state = LayerSparsityState::load(store, name)?;
        let out = self.apply(&mut state, weight, inputs, layer_idx)?;
        state.save(store, name)?;
        Ok(out)
    }
}
