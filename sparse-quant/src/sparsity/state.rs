//! Durable per-layer sparsity state.

use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;

use crate::config::SparsityConfig;
use crate::error::{Result, TransformError};
use crate::sparsity::schedule::ScheduleState;
use crate::sparsity::Sparsifier;
use crate::store::{VariableSpec, VariableStore, MASK_POSTFIX, MASK_UPDATE_COUNT, NUM_SHOTS, STEP};

/// Mask and schedule counters of one sparsified weight.
#[derive(Debug, Clone)]
pub struct LayerSparsityState {
    /// Current mask, `U8`, 1 = keep.
    pub mask: Tensor,
    /// Step and update counters.
    pub schedule: ScheduleState,
}

impl LayerSparsityState {
    /// Fresh state: an all-keep mask and zeroed counters.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn new(shape: &[usize], device: &Device, config: &SparsityConfig) -> Result<Self> {
        Ok(Self {
            mask: Tensor::ones(shape, DType::U8, device)?,
            schedule: ScheduleState::for_config(config),
        })
    }

    /// Declare the persisted variables for weight `name` in `store`.
    ///
    /// # Errors
    ///
    /// Returns error if any of the names is already taken.
    pub fn create_variables(&self, store: &mut dyn VariableStore, name: &str) -> Result<()> {
        store.create_variable(
            &mask_name(name),
            VariableSpec::from_tensor(&self.mask, false),
        )?;
        store.create_variable(STEP, VariableSpec::counter(counter(self.schedule.step)?))?;
        store.create_variable(
            MASK_UPDATE_COUNT,
            VariableSpec::counter(counter(self.schedule.mask_update_count)?),
        )?;
        store.create_variable(NUM_SHOTS, VariableSpec::counter(self.schedule.num_shots))?;
        Ok(())
    }

    /// Write mask and counters back to `store`.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is missing or changed shape.
    pub fn save(&self, store: &mut dyn VariableStore, name: &str) -> Result<()> {
        let device = self.mask.device();
        store.update_var(&mask_name(name), self.mask.clone())?;
        store.update_var(STEP, Tensor::new(counter(self.schedule.step)?, device)?)?;
        store.update_var(
            MASK_UPDATE_COUNT,
            Tensor::new(counter(self.schedule.mask_update_count)?, device)?,
        )?;
        store.update_var(NUM_SHOTS, Tensor::new(self.schedule.num_shots, device)?)?;
        Ok(())
    }

    /// Read mask and counters for weight `name` from `store`.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is missing or a counter is negative.
    pub fn load(store: &dyn VariableStore, name: &str) -> Result<Self> {
        let mask = store.get_var(&mask_name(name))?.to_dtype(DType::U8)?;
        let step = read_counter(store, STEP)?;
        let mask_update_count = read_counter(store, MASK_UPDATE_COUNT)?;
        let num_shots = read_i64(store, NUM_SHOTS)?;

        Ok(Self {
            mask,
            schedule: ScheduleState {
                step,
                mask_update_count,
                num_shots,
            },
        })
    }
}

/// Name of the mask variable for weight `name`.
#[must_use]
pub fn mask_name(name: &str) -> String {
    format!("{name}{MASK_POSTFIX}")
}

fn counter(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| TransformError::InvalidScheduleConfig(format!("counter overflow: {value}")))
}

fn read_i64(store: &dyn VariableStore, name: &str) -> Result<i64> {
    Ok(store.get_var(name)?.to_dtype(DType::I64)?.to_scalar::<i64>()?)
}

fn read_counter(store: &dyn VariableStore, name: &str) -> Result<u64> {
    let value = read_i64(store, name)?;
    u64::try_from(value)
        .map_err(|_| TransformError::InvalidScheduleConfig(format!("{name} is negative: {value}")))
}

/// Per-layer states of a stack of layers.
///
/// Each layer sits behind its own lock, so different layers can be
/// transformed from different threads while calls on the same layer are
/// serialized.
#[derive(Debug)]
pub struct LayerStates {
    layers: Vec<Mutex<LayerSparsityState>>,
}

impl LayerStates {
    /// Wrap existing states; index `i` is layer `i`.
    pub fn new(states: impl IntoIterator<Item = LayerSparsityState>) -> Self {
        Self {
            layers: states.into_iter().map(Mutex::new).collect(),
        }
    }

    /// Fresh state for every weight shape.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn for_shapes(
        shapes: &[&[usize]],
        device: &Device,
        config: &SparsityConfig,
    ) -> Result<Self> {
        let states = shapes
            .iter()
            .map(|shape| LayerSparsityState::new(shape, device, config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(states))
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether there are no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn layer(&self, layer_idx: usize) -> Result<&Mutex<LayerSparsityState>> {
        self.layers.get(layer_idx).ok_or_else(|| {
            TransformError::InvalidConfig(format!(
                "layer {layer_idx} out of range for {} layers",
                self.layers.len()
            ))
        })
    }

    /// Run one sparsification step for `layer_idx`.
    ///
    /// # Errors
    ///
    /// Returns error if the layer does not exist or the step fails.
    pub fn apply(
        &self,
        sparsifier: &Sparsifier,
        layer_idx: usize,
        weight: &Tensor,
        inputs: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut state = self.layer(layer_idx)?.lock();
        sparsifier.apply(&mut state, weight, inputs, layer_idx)
    }

    /// Copy of one layer's state.
    ///
    /// # Errors
    ///
    /// Returns error if the layer does not exist.
    pub fn snapshot(&self, layer_idx: usize) -> Result<LayerSparsityState> {
        Ok(self.layer(layer_idx)?.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TensorStore;

    #[test]
    fn test_fresh_state() {
        let device = Device::Cpu;
        let config = SparsityConfig::few_shot(2, 4, 0, 1, 3);

        let state = LayerSparsityState::new(&[2, 8], &device, &config).unwrap();

        assert_eq!(state.mask.dtype(), DType::U8);
        assert_eq!(state.mask.to_vec2::<u8>().unwrap(), vec![vec![1; 8]; 2]);
        assert_eq!(state.schedule, ScheduleState::new(3));
    }

    #[test]
    fn test_store_round_trip() {
        let device = Device::Cpu;
        let config = SparsityConfig::continuous(2, 4, 0, 1);
        let mut store = TensorStore::new(&device);

        let mut state = LayerSparsityState::new(&[2, 4], &device, &config).unwrap();
        state.create_variables(&mut store, "w").unwrap();
        assert_eq!(
            store.names(),
            vec!["mask_update_count", "num_shots", "step", "w_mask"]
        );
        assert_eq!(store.get_scalar("num_shots").unwrap(), -1);

        state.mask = Tensor::new(&[[1u8, 0, 1, 0], [0, 1, 0, 1]], &device).unwrap();
        state.schedule.step = 7;
        state.schedule.mask_update_count = 2;
        state.save(&mut store, "w").unwrap();

        let loaded = LayerSparsityState::load(&store, "w").unwrap();
        assert_eq!(loaded.schedule, state.schedule);
        assert_eq!(
            loaded.mask.to_vec2::<u8>().unwrap(),
            state.mask.to_vec2::<u8>().unwrap()
        );
    }

    #[test]
    fn test_load_rejects_negative_counter() {
        let device = Device::Cpu;
        let mut store = TensorStore::new(&device);
        let mask = Tensor::ones((4,), DType::U8, &device).unwrap();
        store
            .create_variable("w_mask", VariableSpec::from_tensor(&mask, false))
            .unwrap();
        store.create_variable(STEP, VariableSpec::counter(-3)).unwrap();
        store
            .create_variable(MASK_UPDATE_COUNT, VariableSpec::counter(0))
            .unwrap();
        store
            .create_variable(NUM_SHOTS, VariableSpec::counter(1))
            .unwrap();

        assert!(matches!(
            LayerSparsityState::load(&store, "w"),
            Err(TransformError::InvalidScheduleConfig(_))
        ));
    }

    #[test]
    fn test_layer_states_bounds() {
        let device = Device::Cpu;
        let config = SparsityConfig::one_shot(2, 4, 0);
        let states = LayerStates::for_shapes(&[&[4, 4], &[4, 8]], &device, &config).unwrap();

        assert_eq!(states.len(), 2);
        assert_eq!(states.snapshot(1).unwrap().mask.dims(), &[4, 8]);
        assert!(matches!(
            states.snapshot(2),
            Err(TransformError::InvalidConfig(_))
        ));
    }
}
