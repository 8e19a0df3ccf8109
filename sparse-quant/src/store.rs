//! Named variable storage shared with the host layer.
//!
//! The host owns parameters and auxiliary state under string names. This
//! crate only needs to create, read and overwrite them, so the seam is the
//! small [`VariableStore`] trait; [`TensorStore`] is an in-memory
//! implementation.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, TransformError};

/// Postfix of the per-channel scale stored next to a quantized weight.
pub const SCALE_POSTFIX: &str = "_scale";

/// Postfix of the sparsity mask stored next to a weight.
pub const MASK_POSTFIX: &str = "_mask";

/// Name of the per-layer forward call counter.
pub const STEP: &str = "step";

/// Name of the per-layer mask recomputation counter.
pub const MASK_UPDATE_COUNT: &str = "mask_update_count";

/// Name of the per-layer shot budget.
pub const NUM_SHOTS: &str = "num_shots";

/// How a new variable is initialized.
#[derive(Debug, Clone)]
pub enum VariableInit {
    /// Every element set to this value.
    Constant(f64),
    /// An explicit initial value, converted to the declared dtype.
    Value(Tensor),
}

/// Declaration of a variable.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    /// Shape; empty for scalars.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
    /// Initial value.
    pub init: VariableInit,
    /// Whether an optimizer may update it.
    pub trainable: bool,
}

impl VariableSpec {
    /// Non-trainable scalar counter.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn counter(value: i64) -> Self {
        Self {
            shape: Vec::new(),
            dtype: DType::I64,
            init: VariableInit::Constant(value as f64),
            trainable: false,
        }
    }

    /// Variable initialized from an existing tensor.
    #[must_use]
    pub fn from_tensor(value: &Tensor, trainable: bool) -> Self {
        Self {
            shape: value.dims().to_vec(),
            dtype: value.dtype(),
            init: VariableInit::Value(value.clone()),
            trainable,
        }
    }
}

/// Host-side named variable storage.
pub trait VariableStore {
    /// Declare a new variable.
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or the initial value does not fit
    /// the declared shape.
    fn create_variable(&mut self, name: &str, spec: VariableSpec) -> Result<()>;

    /// Current value of a variable.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::MissingVariable`] if it was never created.
    fn get_var(&self, name: &str) -> Result<Tensor>;

    /// Overwrite a variable. The value is converted to the declared dtype.
    ///
    /// # Errors
    ///
    /// Returns error if the variable is missing or the shape changes.
    fn update_var(&mut self, name: &str, value: Tensor) -> Result<()>;

    /// Whether a variable with this name exists.
    fn contains(&self, name: &str) -> bool;
}

#[derive(Debug, Clone)]
struct StoredVariable {
    value: Tensor,
    trainable: bool,
}

/// In-memory [`VariableStore`].
#[derive(Debug, Clone)]
pub struct TensorStore {
    vars: HashMap<String, StoredVariable>,
    device: Device,
}

impl TensorStore {
    /// Empty store allocating on `device`.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self {
            vars: HashMap::new(),
            device: device.clone(),
        }
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variable names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.vars.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether a variable is trainable.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::MissingVariable`] if it was never created.
    pub fn is_trainable(&self, name: &str) -> Result<bool> {
        self.vars
            .get(name)
            .map(|v| v.trainable)
            .ok_or_else(|| TransformError::MissingVariable(name.to_string()))
    }

    /// Read a scalar variable as `i64`.
    ///
    /// # Errors
    ///
    /// Returns error if the variable is missing or not a scalar.
    pub fn get_scalar(&self, name: &str) -> Result<i64> {
        Ok(self.get_var(name)?.to_dtype(DType::I64)?.to_scalar::<i64>()?)
    }
}

impl VariableStore for TensorStore {
    fn create_variable(&mut self, name: &str, spec: VariableSpec) -> Result<()> {
        if self.vars.contains_key(name) {
            return Err(TransformError::InvalidConfig(format!(
                "variable {name} already exists"
            )));
        }

        let value = match spec.init {
            VariableInit::Constant(c) => {
                Tensor::full(c, spec.shape.as_slice(), &self.device)?.to_dtype(spec.dtype)?
            }
            VariableInit::Value(t) => {
                if t.dims() != spec.shape.as_slice() {
                    return Err(TransformError::shape_mismatch(&spec.shape, t.dims()));
                }
                t.to_dtype(spec.dtype)?.to_device(&self.device)?
            }
        };

        self.vars.insert(
            name.to_string(),
            StoredVariable {
                value,
                trainable: spec.trainable,
            },
        );
        Ok(())
    }

    fn get_var(&self, name: &str) -> Result<Tensor> {
        self.vars
            .get(name)
            .map(|v| v.value.clone())
            .ok_or_else(|| TransformError::MissingVariable(name.to_string()))
    }

    fn update_var(&mut self, name: &str, value: Tensor) -> Result<()> {
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| TransformError::MissingVariable(name.to_string()))?;

        if var.value.dims() != value.dims() {
            return Err(TransformError::shape_mismatch(var.value.dims(), value.dims()));
        }
        var.value = value.to_dtype(var.value.dtype())?.to_device(&self.device)?;
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }
}
