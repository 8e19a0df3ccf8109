//! Weight quantization.
//!
//! Symmetric per-output-channel quantization: for every output channel `k`
//! (last dimension of the weight), `scale[k] = max(|W[.., k]|) / qmax` and
//! `W_q = round(W / scale)` clamped to `[-qmax, qmax]`.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{representable_max, QuantizationConfig};
use crate::error::{Result, TransformError};
use crate::quantization::check_export_supported;

/// Reduced-precision weight with one scale per output channel.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedWeight {
    /// Reduced values in row-major order, same layout as the source weight.
    pub data: Vec<i8>,

    /// Scale per output channel. Always positive.
    pub scales: Vec<f32>,

    /// Original weight shape. The last dimension is the output channel.
    pub shape: Vec<usize>,

    /// Bit width the values were reduced to.
    pub bits: u8,
}

impl std::fmt::Debug for QuantizedWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedWeight")
            .field("shape", &self.shape)
            .field("bits", &self.bits)
            .field("num_scales", &self.scales.len())
            .finish_non_exhaustive()
    }
}

impl QuantizedWeight {
    /// Number of output channels.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// Product of all non-output dimensions.
    #[must_use]
    pub fn in_features(&self) -> usize {
        let out = self.out_features();
        if out == 0 {
            0
        } else {
            self.numel() / out
        }
    }

    /// Total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Largest representable magnitude for `bits`.
    ///
    /// # Errors
    ///
    /// Returns error if `bits` is outside 2..=8.
    pub fn qmax(&self) -> Result<f32> {
        representable_max(self.bits)
    }

    /// Check that `data` fills `shape` and there is one scale per output
    /// channel.
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
        if self.scales.len() != self.out_features() {
            return Err(TransformError::shape_mismatch(
                &[self.out_features()],
                &[self.scales.len()],
            ));
        }
        Ok(())
    }

    /// Memory size in bytes: one byte per value plus the scales.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.data.len() + self.scales.len() * 4
    }

    /// Compression ratio vs FP32.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compression_ratio(&self) -> f32 {
        (self.numel() * 4) as f32 / self.memory_bytes() as f32
    }

    /// Reduced values as an `F32` tensor of integers, in the weight's shape.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn values_tensor(&self, device: &Device) -> Result<Tensor> {
        let values: Vec<f32> = self.data.iter().map(|&q| f32::from(q)).collect();
        Ok(Tensor::from_vec(values, self.shape.clone(), device)?)
    }

    /// Scales as an `F32` tensor of shape `[out_features]`.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn scale_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.scales.clone(),
            self.scales.len(),
            device,
        )?)
    }
}

/// Quantize a tensor per output channel.
///
/// # Arguments
///
/// * `tensor` - Weight tensor `[..., out_features]`
/// * `bits` - Target bit width (2-8)
/// * `scale_floor` - Lower bound applied to every scale
///
/// # Errors
///
/// Returns error if the tensor is a scalar or has no output channels, or the
/// bit width is out of range.
pub fn reduce_precision(tensor: &Tensor, bits: u8, scale_floor: f32) -> Result<QuantizedWeight> {
    let qmax = representable_max(bits)?;

    let shape = tensor.dims().to_vec();
    let out_features = match shape.last() {
        Some(&out) if out > 0 => out,
        _ => {
            return Err(TransformError::InvalidConfig(format!(
                "weight must have a non-empty output dimension, got shape {shape:?}"
            )))
        }
    };
    let rows = tensor.elem_count() / out_features;

    let flat = tensor
        .to_dtype(DType::F32)?
        .reshape((rows, out_features))?
        .to_vec2::<f32>()?;

    let mut abs_max = vec![0.0f32; out_features];
    for row in &flat {
        for (m, &val) in abs_max.iter_mut().zip(row) {
            *m = m.max(val.abs());
        }
    }
    let scales: Vec<f32> = abs_max
        .iter()
        .map(|&m| (m / qmax).max(scale_floor))
        .collect();

    let mut data = Vec::with_capacity(rows * out_features);
    for row in &flat {
        for (&val, &scale) in row.iter().zip(&scales) {
            data.push((val / scale).round().clamp(-qmax, qmax) as i8);
        }
    }

    Ok(QuantizedWeight {
        data,
        scales,
        shape,
        bits,
    })
}

/// Produce the reduced weight and scale to persist for inference.
///
/// Same arithmetic as [`reduce_precision`], gated on a quantization
/// configuration that supports export.
///
/// # Errors
///
/// Returns [`TransformError::UnsupportedConfiguration`] for static activation
/// quantization or AQT, and propagates quantization errors.
pub fn quantize_weight(weight: &Tensor, config: &QuantizationConfig) -> Result<QuantizedWeight> {
    config.validate()?;
    check_export_supported(config)?;
    reduce_precision(weight, config.weight_bits, config.scale_floor)
}

/// Reconstruct `reduced * scale` as an `F32` tensor.
///
/// # Errors
///
/// Returns [`TransformError::ShapeMismatch`] if the values or scales do not
/// match the shape, or error if tensor creation fails.
pub fn dequantize_weight(quantized: &QuantizedWeight, device: &Device) -> Result<Tensor> {
    quantized.check_layout()?;
    let out_features = quantized.out_features();
    let output: Vec<f32> = quantized
        .data
        .iter()
        .enumerate()
        .map(|(i, &q)| f32::from(q) * quantized.scales[i % out_features])
        .collect();

    Ok(Tensor::from_vec(output, quantized.shape.clone(), device)?)
}
