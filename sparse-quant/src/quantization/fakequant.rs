//! Fake quantization for quantization-aware training.
//!
//! Values are quantized and immediately dequantized with tensor ops, so the
//! forward pass sees quantization error while the arithmetic (and the
//! gradient path) stays in full precision.

use candle_core::{DType, Tensor, D};

use crate::config::QuantizationConfig;
use crate::error::{Result, TransformError};

/// Quantize-dequantize `input` with an explicit scale tensor.
///
/// `scale` must broadcast against `input`. Values are rounded and clamped to
/// `[-qmax, qmax]` before being scaled back.
///
/// # Errors
///
/// Returns error if tensor operations fail.
pub fn fake_quantize_with_scale(input: &Tensor, scale: &Tensor, qmax: f32) -> Result<Tensor> {
    let scaled = input.broadcast_div(scale)?;
    let clamped = scaled.round()?.clamp(-qmax, qmax)?;
    Ok(clamped.broadcast_mul(scale)?)
}

/// Symmetric AbsMax scale of a 2D tensor, reduced along `dim`.
fn absmax_scale(flat: &Tensor, dim: usize, qmax: f32, floor: f32) -> Result<Tensor> {
    let abs_max = flat.abs()?.max_keepdim(dim)?;
    let qmax = Tensor::new(qmax, flat.device())?;
    Ok(abs_max.broadcast_div(&qmax)?.maximum(f64::from(floor))?)
}

/// Fake-quantize a weight with per-output-channel scales.
///
/// # Errors
///
/// Returns error if the configuration is invalid, the weight is a scalar or
/// tensor operations fail.
pub fn fakequant_weight(weight: &Tensor, config: &QuantizationConfig) -> Result<Tensor> {
    config.validate()?;
    let qmax = config.weight_qmax()?;
    let dims = weight.dims().to_vec();
    let out_features = *dims.last().ok_or_else(|| {
        TransformError::InvalidConfig("weight must have at least one dimension".to_string())
    })?;
    let rows = weight.elem_count() / out_features.max(1);

    let flat = weight.to_dtype(DType::F32)?.reshape((rows, out_features))?;
    let scale = absmax_scale(&flat, 0, qmax, config.scale_floor)?;
    let fake = fake_quantize_with_scale(&flat, &scale, qmax)?;
    Ok(fake.reshape(dims)?)
}

/// Fake-quantize activations with per-token scales.
///
/// # Errors
///
/// Returns error if the configuration is invalid, the input is a scalar or
/// tensor operations fail.
pub fn fakequant_activation(activations: &Tensor, config: &QuantizationConfig) -> Result<Tensor> {
    config.validate()?;
    let qmax = config.activation_qmax()?;
    let dims = activations.dims().to_vec();
    let hidden_dim = *dims.last().ok_or_else(|| {
        TransformError::InvalidConfig("activations must have at least one dimension".to_string())
    })?;
    let tokens = activations.elem_count() / hidden_dim.max(1);

    let flat = activations
        .to_dtype(DType::F32)?
        .reshape((tokens, hidden_dim))?;
    let scale = absmax_scale(&flat, 1, qmax, config.scale_floor)?;
    let fake = fake_quantize_with_scale(&flat, &scale, qmax)?;
    Ok(fake.reshape(dims)?)
}

/// Largest elementwise absolute difference between two tensors.
///
/// # Errors
///
/// Returns error if tensor operations fail.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?
        .abs()?
        .flatten_all()?
        .max(D::Minus1)?
        .to_scalar::<f32>()?)
}
