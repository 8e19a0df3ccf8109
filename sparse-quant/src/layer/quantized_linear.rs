//! QuantizedLinear layer - `nn::Linear` with a quantization lifecycle.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use tracing::{debug, warn};

use crate::config::QuantizationConfig;
use crate::error::{Result, TransformError};
use crate::layer::partition::{quantized_partition_specs, PartitionSpec};
use crate::quantization::{
    dequantize_weight, fakequant_matmul, fakequant_weight, forward_path, project_last_dim,
    quantize_weight, quantized_matmul, reduce_precision_activation, ForwardPath, QuantizedWeight,
};
use crate::store::{VariableSpec, VariableStore, SCALE_POSTFIX};

/// Warn once per process when a layer is built on the CPU device.
fn warn_cpu_fallback(device: &Device) {
    static WARN_ONCE: std::sync::Once = std::sync::Once::new();
    if matches!(device, Device::Cpu) {
        WARN_ONCE.call_once(|| {
            warn!("sparse-quant: CPU device in use; quantized projections run unaccelerated");
        });
    }
}

#[derive(Debug, Clone)]
enum StoredWeight {
    /// Full-precision weight, used while training.
    Dense(Tensor),
    /// Reduced weight for inference. `values` and `scale` are cached tensors
    /// of `quantized`.
    Quantized {
        quantized: QuantizedWeight,
        values: Tensor,
        scale: Tensor,
    },
}

/// Linear layer whose projection follows a [`QuantizationConfig`].
///
/// The weight is laid out `[in_features, out_features]` and the projection
/// is `...y,yz->...z`. In training the full-precision weight is kept and
/// optionally fake-quantized; in inference the reduced weight and its
/// per-channel scale are kept instead.
///
/// # Example
///
/// ```ignore
/// use sparse_quant::{QuantizationConfig, QuantizedLinear};
/// use candle_core::{Device, Tensor};
///
/// let device = Device::Cpu;
/// let weight = Tensor::randn(0.0f32, 1.0, (256, 512), &device)?;
/// let layer = QuantizedLinear::from_weight(&weight, None, &QuantizationConfig::inference())?;
///
/// let input = Tensor::randn(0.0f32, 1.0, (4, 256), &device)?;
/// let output = layer.forward(&input)?;
/// ```
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: StoredWeight,
    bias: Option<Tensor>,
    config: QuantizationConfig,
    path: ForwardPath,
    device: Device,
}

impl QuantizedLinear {
    /// Create a layer from a full-precision weight.
    ///
    /// In inference mode the weight is reduced immediately.
    ///
    /// # Arguments
    ///
    /// * `weight` - Weight tensor `[in_features, out_features]`
    /// * `bias` - Optional bias tensor `[out_features]`
    /// * `config` - Quantization configuration
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or unsupported, or the
    /// weight is not 2D.
    pub fn from_weight(
        weight: &Tensor,
        bias: Option<&Tensor>,
        config: &QuantizationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = forward_path(config)?;
        weight.dims2()?;

        let device = weight.device().clone();
        warn_cpu_fallback(&device);

        let stored = match path {
            ForwardPath::Quantized { .. } => {
                let quantized = quantize_weight(weight, config)?;
                quantized_storage(quantized, &device)?
            }
            ForwardPath::Dense | ForwardPath::FakeQuant => {
                StoredWeight::Dense(weight.to_dtype(DType::F32)?)
            }
        };
        debug!(?path, dims = ?weight.dims(), "built quantized linear layer");

        Ok(Self {
            weight: stored,
            bias: bias.cloned(),
            config: *config,
            path,
            device,
        })
    }

    /// Create an inference layer from an exported weight.
    ///
    /// # Errors
    ///
    /// Returns error if `config` does not select a quantized forward path, the
    /// weight is not 2D, or its values or scales do not match its shape.
    pub fn from_quantized(
        quantized: QuantizedWeight,
        bias: Option<Tensor>,
        config: &QuantizationConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let path = forward_path(config)?;
        if !matches!(path, ForwardPath::Quantized { .. }) {
            return Err(TransformError::InvalidConfig(format!(
                "a pre-quantized weight needs inference mode, got {:?}",
                config.mode
            )));
        }
        if quantized.shape.len() != 2 {
            return Err(TransformError::shape_mismatch(
                &[quantized.in_features(), quantized.out_features()],
                &quantized.shape,
            ));
        }
        quantized.check_layout()?;
        warn_cpu_fallback(device);

        Ok(Self {
            weight: quantized_storage(quantized, device)?,
            bias,
            config: *config,
            path,
            device: device.clone(),
        })
    }

    /// Rebuild a layer from the variables written by
    /// [`QuantizedLinear::store_variables`].
    ///
    /// # Errors
    ///
    /// Returns error if a variable is missing or holds out-of-range values.
    pub fn from_store(
        store: &dyn VariableStore,
        name: &str,
        bias: Option<Tensor>,
        config: &QuantizationConfig,
    ) -> Result<Self> {
        let weight = store.get_var(name)?;
        let device = weight.device().clone();
        match forward_path(config)? {
            ForwardPath::Quantized { .. } => {
                let scales = store
                    .get_var(&format!("{name}{SCALE_POSTFIX}"))?
                    .to_dtype(DType::F32)?
                    .to_vec1::<f32>()?;
                let data = weight
                    .to_dtype(DType::I64)?
                    .flatten_all()?
                    .to_vec1::<i64>()?
                    .into_iter()
                    .map(|v| {
                        i8::try_from(v).map_err(|_| {
                            TransformError::InvalidConfig(format!(
                                "stored value {v} of {name} does not fit 8 bits"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let quantized = QuantizedWeight {
                    data,
                    scales,
                    shape: weight.dims().to_vec(),
                    bits: config.weight_bits,
                };
                Self::from_quantized(quantized, bias, config, &device)
            }
            ForwardPath::Dense | ForwardPath::FakeQuant => {
                Self::from_weight(&weight, bias.as_ref(), config)
            }
        }
    }

    /// Get the input features dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        match &self.weight {
            StoredWeight::Dense(w) => w.dims()[0],
            StoredWeight::Quantized { quantized, .. } => quantized.in_features(),
        }
    }

    /// Get the output features dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        match &self.weight {
            StoredWeight::Dense(w) => w.dims()[1],
            StoredWeight::Quantized { quantized, .. } => quantized.out_features(),
        }
    }

    /// Get the forward path selected by the configuration.
    #[must_use]
    pub const fn path(&self) -> ForwardPath {
        self.path
    }

    /// Get the reduced weight, if this layer holds one.
    #[must_use]
    pub fn quantized_weight(&self) -> Option<&QuantizedWeight> {
        match &self.weight {
            StoredWeight::Dense(_) => None,
            StoredWeight::Quantized { quantized, .. } => Some(quantized),
        }
    }

    /// Get reference to the bias.
    #[must_use]
    pub const fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Get reference to the configuration.
    #[must_use]
    pub const fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    /// Get the device.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// The weight the forward path effectively multiplies by, in full
    /// precision: the stored weight, its fake-quantized version, or the
    /// dequantized reduced weight.
    ///
    /// # Errors
    ///
    /// Returns error if tensor operations fail.
    pub fn effective_weight(&self) -> Result<Tensor> {
        match (&self.weight, self.path) {
            (StoredWeight::Dense(w), ForwardPath::FakeQuant) => fakequant_weight(w, &self.config),
            (StoredWeight::Dense(w), _) => Ok(w.clone()),
            (StoredWeight::Quantized { quantized, .. }, _) => {
                dequantize_weight(quantized, &self.device)
            }
        }
    }

    /// Projection `...y,yz->...z` of `inputs` along the configured path,
    /// without bias.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Input tensor `[..., in_features]`
    ///
    /// # Errors
    ///
    /// Returns error if the last input dimension is not `in_features`.
    pub fn apply_quantization(&self, inputs: &Tensor) -> Result<Tensor> {
        match (&self.weight, self.path) {
            (StoredWeight::Dense(w), ForwardPath::FakeQuant) => {
                fakequant_matmul(inputs, w, &self.config)
            }
            (StoredWeight::Dense(w), _) => project_last_dim(inputs, w),
            (
                StoredWeight::Quantized { values, scale, .. },
                ForwardPath::Quantized {
                    dynamic_activation: true,
                },
            ) => {
                let act = reduce_precision_activation(inputs, &self.config)?;
                let act_values = act.values_tensor(&self.device)?;
                let combined = act
                    .scale_tensor(&self.device)?
                    .broadcast_mul(&scale.unsqueeze(0)?)?;
                quantized_matmul(&act_values, values, &combined)
            }
            (StoredWeight::Quantized { values, scale, .. }, _) => {
                quantized_matmul(&inputs.to_dtype(DType::F32)?, values, scale)
            }
        }
    }

    /// Export the reduced weight and scale for inference.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::UnsupportedConfiguration`] for static
    /// activation quantization or AQT.
    pub fn quantize_weight(&self) -> Result<QuantizedWeight> {
        match &self.weight {
            StoredWeight::Dense(w) => quantize_weight(w, &self.config),
            StoredWeight::Quantized { quantized, .. } => Ok(quantized.clone()),
        }
    }

    /// Partition specs of this layer's weight `name` and its scale.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration cannot be exported or
    /// `weight_split` does not have one entry per weight dimension.
    pub fn quantized_partition_specs(
        &self,
        name: &str,
        weight_split: &PartitionSpec,
    ) -> Result<BTreeMap<String, BTreeMap<String, PartitionSpec>>> {
        if weight_split.len() != 2 {
            return Err(TransformError::InvalidConfig(format!(
                "partition spec for {name} needs 2 entries, got {}",
                weight_split.len()
            )));
        }
        quantized_partition_specs(name, weight_split, &self.config)
    }

    /// Declare this layer's variables in `store`: `name` for the weight, and
    /// `<name>_scale` when the weight is reduced.
    ///
    /// # Errors
    ///
    /// Returns error if a name is already taken.
    pub fn store_variables(&self, store: &mut dyn VariableStore, name: &str) -> Result<()> {
        match &self.weight {
            StoredWeight::Dense(w) => {
                store.create_variable(name, VariableSpec::from_tensor(w, true))?;
            }
            StoredWeight::Quantized { values, scale, .. } => {
                let values = values.to_dtype(DType::I64)?;
                store.create_variable(name, VariableSpec::from_tensor(&values, false))?;
                store.create_variable(
                    &format!("{name}{SCALE_POSTFIX}"),
                    VariableSpec::from_tensor(scale, false),
                )?;
            }
        }
        Ok(())
    }
}

fn quantized_storage(quantized: QuantizedWeight, device: &Device) -> Result<StoredWeight> {
    let values = quantized.values_tensor(device)?;
    let scale = quantized.scale_tensor(device)?;
    Ok(StoredWeight::Quantized {
        quantized,
        values,
        scale,
    })
}

impl Module for QuantizedLinear {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let output = self
            .apply_quantization(input)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        match &self.bias {
            Some(bias) => output.broadcast_add(bias),
            None => Ok(output),
        }
    }
}
