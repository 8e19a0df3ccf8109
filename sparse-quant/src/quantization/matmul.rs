//! Projections over the last input dimension (`...y,yz->...z`).

use candle_core::Tensor;

use crate::config::QuantizationConfig;
use crate::error::{Result, TransformError};
use crate::quantization::{fakequant_activation, fakequant_weight};

/// Flatten `inputs` to `[tokens, y]` after checking it matches `weight`
/// `[y, z]`. Returns the flattened input and the output shape.
fn flatten_for_projection(inputs: &Tensor, weight: &Tensor) -> Result<(Tensor, Vec<usize>)> {
    let (in_dim, out_dim) = weight.dims2()?;
    let dims = inputs.dims();

    match dims.last() {
        Some(&y) if y == in_dim => {}
        _ => {
            let mut expected = dims.to_vec();
            if let Some(last) = expected.last_mut() {
                *last = in_dim;
            } else {
                expected.push(in_dim);
            }
            return Err(TransformError::shape_mismatch(&expected, dims));
        }
    }

    let tokens = inputs.elem_count() / in_dim.max(1);
    let mut out_shape = dims[..dims.len() - 1].to_vec();
    out_shape.push(out_dim);

    Ok((inputs.reshape((tokens, in_dim))?, out_shape))
}

/// Full-precision projection `einsum('...y,yz->...z', inputs, weight)`.
///
/// # Errors
///
/// Returns [`TransformError::ShapeMismatch`] if the last input dimension
/// differs from the weight's first dimension.
pub fn project_last_dim(inputs: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let (flat, out_shape) = flatten_for_projection(inputs, weight)?;
    Ok(flat.matmul(weight)?.reshape(out_shape)?)
}

/// Projection with reduced operands, scaled after the matmul.
///
/// Computes `einsum('...y,yz->...z', inputs, reduced_weight) * combined_scale`.
/// `combined_scale` is either the weight scale `[z]` or the product of the
/// per-token activation scale and the weight scale, `[tokens, z]`.
///
/// # Errors
///
/// Returns error on shape mismatch or if tensor operations fail.
pub fn quantized_matmul(
    inputs: &Tensor,
    reduced_weight: &Tensor,
    combined_scale: &Tensor,
) -> Result<Tensor> {
    let (flat, out_shape) = flatten_for_projection(inputs, reduced_weight)?;
    let output = flat.matmul(reduced_weight)?.broadcast_mul(combined_scale)?;
    Ok(output.reshape(out_shape)?)
}

/// Projection with fake-quantized inputs and weight.
///
/// # Errors
///
/// Returns error on shape mismatch or if tensor operations fail.
pub fn fakequant_matmul(
    inputs: &Tensor,
    weight: &Tensor,
    config: &QuantizationConfig,
) -> Result<Tensor> {
    let inputs = fakequant_activation(inputs, config)?;
    let weight = fakequant_weight(weight, config)?;
    project_last_dim(&inputs, &weight)
}
