//! Dynamic activation quantization.
//!
//! Implements per-token AbsMax quantization: every row of the input,
//! flattened to `[tokens, features]`, gets its own scale.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{representable_max, QuantizationConfig};
use crate::error::{Result, TransformError};

/// Quantized activations with per-token scales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizedActivations {
    /// Quantized values in row-major order.
    pub data: Vec<i8>,

    /// One scale per token (row of the flattened input).
    pub scales: Vec<f32>,

    /// Original shape `[..., features]`.
    pub shape: Vec<usize>,

    /// Bit width the values were reduced to.
    pub bits: u8,
}

impl QuantizedActivations {
    /// Number of tokens (product of all leading dimensions).
    #[must_use]
    pub fn num_tokens(&self) -> usize {
        self.scales.len()
    }

    /// Feature dimension.
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// Total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check that `data` fills `shape` and there is one scale per token.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::ShapeMismatch`] on either length mismatch.
    pub fn check_layout(&self) -> Result<()> {
        if self.data.len() != self.numel() {
            return Err(TransformError::shape_mismatch(
                &self.shape,
                &[self.data.len()],
            ));
        }
        let hidden_dim = self.hidden_dim();
        let tokens = if hidden_dim == 0 {
            0
        } else {
            self.numel() / hidden_dim
        };
        if self.scales.len() != tokens {
            return Err(TransformError::shape_mismatch(
                &[tokens],
                &[self.scales.len()],
            ));
        }
        Ok(())
    }

    /// Reduced values as an `F32` tensor in the original shape.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn values_tensor(&self, device: &Device) -> Result<Tensor> {
        let values: Vec<f32> = self.data.iter().map(|&q| f32::from(q)).collect();
        Ok(Tensor::from_vec(values, self.shape.clone(), device)?)
    }

    /// Scales as an `F32` tensor of shape `[tokens, 1]`.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn scale_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.scales.clone(),
            (self.scales.len(), 1),
            device,
        )?)
    }
}

/// Quantize activations with a per-token AbsMax scale.
///
/// # Algorithm
///
/// For each token (row):
/// 1. Compute `scale = max(max(|X|) / qmax, scale_floor)`
/// 2. Compute `X_q = round(X / scale)` clamped to `[-qmax, qmax]`
///
/// # Arguments
///
/// * `activations` - Input tensor `[..., features]`
/// * `config` - Quantization configuration
///
/// # Errors
///
/// Returns error if the configuration is invalid, or the input is a scalar or
/// has an empty feature dimension.
pub fn reduce_precision_activation(
    activations: &Tensor,
    config: &QuantizationConfig,
) -> Result<QuantizedActivations> {
    config.validate()?;
    let qmax = representable_max(config.activation_bits)?;

    let shape = activations.dims().to_vec();
    let hidden_dim = match shape.last() {
        Some(&d) if d > 0 => d,
        _ => {
            return Err(TransformError::InvalidConfig(format!(
                "activations must have a non-empty feature dimension, got shape {shape:?}"
            )))
        }
    };
    let num_tokens = activations.elem_count() / hidden_dim;

    let flat = activations
        .to_dtype(DType::F32)?
        .reshape((num_tokens, hidden_dim))?
        .to_vec2::<f32>()?;

    let mut data = Vec::with_capacity(num_tokens * hidden_dim);
    let mut scales = Vec::with_capacity(num_tokens);

    for row in &flat {
        let abs_max = row.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
        let scale = (abs_max / qmax).max(config.scale_floor);
        scales.push(scale);

        for &val in row {
            data.push((val / scale).round().clamp(-qmax, qmax) as i8);
        }
    }

    Ok(QuantizedActivations {
        data,
        scales,
        shape,
        bits: config.activation_bits,
    })
}

/// Dequantize activations back to an `F32` tensor.
///
/// # Errors
///
/// Returns [`TransformError::ShapeMismatch`] if the values or scales do not
/// match the shape, or error if tensor creation fails.
pub fn dequantize_activations(quantized: &QuantizedActivations, device: &Device) -> Result<Tensor> {
    quantized.check_layout()?;
    let hidden_dim = quantized.hidden_dim();
    let output: Vec<f32> = quantized
        .data
        .iter()
        .enumerate()
        .map(|(i, &q)| f32::from(q) * quantized.scales[i / hidden_dim])
        .collect();

    Ok(Tensor::from_vec(output, quantized.shape.clone(), device)?)
}
