//! SparseLinear layer - `nn::Linear` with a scheduled N:M sparsity mask.

use candle_core::Tensor;

use crate::error::{Result, TransformError};
use crate::quantization::project_last_dim;
use crate::sparsity::{LayerSparsityState, Sparsifier};
use crate::store::{VariableSpec, VariableStore};

/// Linear layer that sparsifies its weight on every forward call.
///
/// Each call advances the layer's schedule. Mask updates only happen on
/// scheduled steps, and only then is the returned weight masked.
#[derive(Debug, Clone)]
pub struct SparseLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    sparsifier: Sparsifier,
    state: LayerSparsityState,
    layer_idx: usize,
}

impl SparseLinear {
    /// Create a layer with a fresh mask and counters.
    ///
    /// # Arguments
    ///
    /// * `weight` - Weight tensor `[in_features, out_features]`
    /// * `bias` - Optional bias tensor `[out_features]`
    /// * `sparsifier` - Schedule and scoring to apply
    /// * `layer_idx` - Index of this layer in the model stack
    ///
    /// # Errors
    ///
    /// Returns error if the weight is not 2D.
    pub fn new(
        weight: &Tensor,
        bias: Option<&Tensor>,
        sparsifier: Sparsifier,
        layer_idx: usize,
    ) -> Result<Self> {
        weight.dims2()?;
        let state = sparsifier.init_state(weight.dims(), weight.device())?;
        Ok(Self {
            weight: weight.clone(),
            bias: bias.cloned(),
            sparsifier,
            state,
            layer_idx,
        })
    }

    /// Get the input features dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Get the output features dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Get the stored (dense) weight.
    #[must_use]
    pub const fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Get the mask and schedule counters.
    #[must_use]
    pub const fn state(&self) -> &LayerSparsityState {
        &self.state
    }

    /// Get the layer index.
    #[must_use]
    pub const fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Run one schedule step and return the weight for this call.
    ///
    /// # Errors
    ///
    /// Returns error if the sparsity step fails.
    pub fn sparsified_weight(&mut self, inputs: Option<&Tensor>) -> Result<Tensor> {
        self.sparsifier
            .apply(&mut self.state, &self.weight, inputs, self.layer_idx)
    }

    /// Forward pass: sparsify the weight, project, add bias.
    ///
    /// # Errors
    ///
    /// Returns error if the sparsity step or the projection fails.
    pub fn forward(&mut self, inputs: &Tensor) -> Result<Tensor> {
        let weight = self.sparsified_weight(Some(inputs))?;
        let output = project_last_dim(inputs, &weight)?;
        match &self.bias {
            Some(bias) => Ok(output.broadcast_add(bias)?),
            None => Ok(output),
        }
    }

    /// Declare the weight `name`, its mask and the schedule counters.
    ///
    /// # Errors
    ///
    /// Returns error if a name is already taken.
    pub fn store_variables(&self, store: &mut dyn VariableStore, name: &str) -> Result<()> {
        store.create_variable(name, VariableSpec::from_tensor(&self.weight, true))?;
        self.state.create_variables(store, name)
    }

    /// Write the current mask and counters back to `store`.
    ///
    /// # Errors
    ///
    /// Returns error if the variables were not declared.
    pub fn save_state(&self, store: &mut dyn VariableStore, name: &str) -> Result<()> {
        self.state.save(store, name)
    }

    /// Restore mask and counters from `store`.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is missing or the mask does not fit the
    /// weight.
    pub fn load_state(&mut self, store: &dyn VariableStore, name: &str) -> Result<()> {
        let state = LayerSparsityState::load(store, name)?;
        if state.mask.elem_count() != self.weight.elem_count() {
            return Err(TransformError::shape_mismatch(
                self.weight.dims(),
                state.mask.dims(),
            ));
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerSelection, SparsityConfig};
    use crate::store::TensorStore;
    use candle_core::{DType, Device};

    #[test]
    fn test_forward_schedule() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (16, 8), &device).unwrap();
        let sparsifier = Sparsifier::new(SparsityConfig::one_shot(2, 4, 1)).unwrap();
        let mut layer = SparseLinear::new(&weight, None, sparsifier, 0).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (3, 16), &device).unwrap();

        let dense = layer.sparsified_weight(None).unwrap();
        assert_eq!(
            dense.to_vec2::<f32>().unwrap(),
            weight.to_vec2::<f32>().unwrap()
        );

        let output = layer.forward(&input).unwrap();
        assert_eq!(output.dims(), &[3, 8]);
        assert_eq!(layer.state().schedule.mask_update_count, 1);
        assert_eq!(layer.state().schedule.step, 2);

        let kept = layer
            .state()
            .mask
            .to_dtype(DType::F32)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(kept, 64.0);
    }

    #[test]
    fn test_ineligible_layer_stays_dense() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (8, 8), &device).unwrap();
        let config = SparsityConfig::continuous(2, 4, 0, 1)
            .with_sparsified_layers(LayerSelection::indices([1, 3]));
        let sparsifier = Sparsifier::new(config).unwrap();
        let mut layer = SparseLinear::new(&weight, None, sparsifier, 2).unwrap();

        for _ in 0..5 {
            let w = layer.sparsified_weight(None).unwrap();
            assert_eq!(w.to_vec2::<f32>().unwrap(), weight.to_vec2::<f32>().unwrap());
        }
        assert_eq!(layer.state().schedule.step, 5);
        assert_eq!(layer.state().schedule.mask_update_count, 0);
    }

    #[test]
    fn test_bias_added() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((4, 4), DType::F32, &device).unwrap();
        let bias = Tensor::new(&[1.0f32, 0.0, -1.0, 2.0], &device).unwrap();
        let sparsifier = Sparsifier::new(SparsityConfig::inference()).unwrap();
        let mut layer = SparseLinear::new(&weight, Some(&bias), sparsifier, 0).unwrap();

        let input = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let output = layer.forward(&input).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(output, vec![vec![1.0, 0.0, -1.0, 2.0]]);
    }

    #[test]
    fn test_state_survives_store() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (4, 8), &device).unwrap();
        let config = SparsityConfig::few_shot(2, 4, 0, 3, 2);
        let sparsifier = Sparsifier::new(config).unwrap();

        let mut layer = SparseLinear::new(&weight, None, sparsifier.clone(), 0).unwrap();
        let mut store = TensorStore::new(&device);
        layer.store_variables(&mut store, "w").unwrap();
        assert_eq!(
            store.names(),
            vec!["mask_update_count", "num_shots", "step", "w", "w_mask"]
        );

        layer.sparsified_weight(None).unwrap();
        layer.save_state(&mut store, "w").unwrap();

        let mut resumed = SparseLinear::new(&weight, None, sparsifier, 0).unwrap();
        resumed.load_state(&store, "w").unwrap();
        assert_eq!(resumed.state().schedule.step, 1);
        assert_eq!(resumed.state().schedule.mask_update_count, 1);
        assert_eq!(resumed.state().schedule.num_shots, 2);
        assert_eq!(
            resumed.state().mask.to_vec2::<u8>().unwrap(),
            layer.state().mask.to_vec2::<u8>().unwrap()
        );
    }
}
