//! Importance scores for mask selection.

use candle_core::{DType, Tensor};

use crate::config::SparsityScore;
use crate::error::{Result, TransformError};

/// Per-element importance of `weight`; higher survives pruning.
///
/// * `Magnitude`: `|w|`.
/// * `ActivationWeighted`: `|w[i, ..]| * sum_t |x[t, i]|`, where `i` runs
///   over the weight's first (input) dimension and `x` is `[..., i]`.
///
/// # Errors
///
/// Returns error if `ActivationWeighted` is requested without inputs, or the
/// inputs' feature dimension does not match the weight's first dimension.
pub fn compute_score(
    weight: &Tensor,
    score: SparsityScore,
    inputs: Option<&Tensor>,
) -> Result<Tensor> {
    let weight = weight.to_dtype(DType::F32)?;
    match score {
        SparsityScore::Magnitude => Ok(weight.abs()?),
        SparsityScore::ActivationWeighted => {
            let inputs = inputs.ok_or_else(|| {
                TransformError::InvalidConfig(
                    "activation-weighted score requires layer inputs".to_string(),
                )
            })?;
            activation_weighted(&weight, inputs)
        }
    }
}

fn activation_weighted(weight: &Tensor, inputs: &Tensor) -> Result<Tensor> {
    let dims = weight.dims();
    let in_dim = match dims.first() {
        Some(&d) if d > 0 => d,
        _ => return Err(TransformError::shape_mismatch(&[1], dims)),
    };
    if inputs.dims().last() != Some(&in_dim) {
        return Err(TransformError::shape_mismatch(&[in_dim], inputs.dims()));
    }

    let tokens = inputs.elem_count() / in_dim;
    let feature_norm = inputs
        .to_dtype(DType::F32)?
        .abs()?
        .reshape((tokens, in_dim))?
        .sum(0)?
        .reshape((in_dim, 1))?;

    let rest = weight.elem_count() / in_dim;
    let score = weight
        .abs()?
        .reshape((in_dim, rest))?
        .broadcast_mul(&feature_norm)?;
    Ok(score.reshape(dims)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_magnitude_score() {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[1.0f32, -2.0], [-0.5, 0.0]], &device).unwrap();

        let score = compute_score(&weight, SparsityScore::Magnitude, None)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        assert_eq!(score, vec![vec![1.0, 2.0], vec![0.5, 0.0]]);
    }

    #[test]
    fn test_activation_weighted_score() {
        let device = Device::Cpu;
        let weight = Tensor::new(
            &[[1.0f32, 2.0, 3.0, 4.0], [-4.0, -3.0, -2.0, -1.0]],
            &device,
        )
        .unwrap();
        let activation = Tensor::new(
            &[[1.0f32, 0.0], [1.0, 0.0], [-1.0, 0.0], [-1.0, 0.0]],
            &device,
        )
        .unwrap();

        let score = compute_score(
            &weight,
            SparsityScore::ActivationWeighted,
            Some(&activation),
        )
        .unwrap()
        .to_vec2::<f32>()
        .unwrap();

        assert_eq!(
            score,
            vec![vec![4.0, 8.0, 12.0, 16.0], vec![0.0, 0.0, 0.0, 0.0]]
        );
    }

    #[test]
    fn test_activation_weighted_3d_inputs() {
        let device = Device::Cpu;
        let weight = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        let inputs = Tensor::ones((2, 5, 3), DType::F32, &device).unwrap();

        let score = compute_score(&weight, SparsityScore::ActivationWeighted, Some(&inputs))
            .unwrap();

        assert_eq!(score.dims(), &[3, 4]);
        let values = score.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (v - 10.0).abs() < 1e-6));
    }

    #[test]
    fn test_activation_weighted_errors() {
        let device = Device::Cpu;
        let weight = Tensor::ones((3, 4), DType::F32, &device).unwrap();

        assert!(matches!(
            compute_score(&weight, SparsityScore::ActivationWeighted, None),
            Err(TransformError::InvalidConfig(_))
        ));

        let wrong = Tensor::ones((2, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            compute_score(&weight, SparsityScore::ActivationWeighted, Some(&wrong)),
            Err(TransformError::ShapeMismatch { .. })
        ));
    }
}
