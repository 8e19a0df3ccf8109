//! Structured N:M masks.
//!
//! Masks are `U8` tensors: `1` keeps an element, `0` prunes it.

use candle_core::{DType, Tensor};

use crate::error::{Result, TransformError};

/// Derive an N:M mask from `score`.
///
/// Every contiguous block of `m` elements along the last axis gets exactly
/// `n` zeros, placed on the `n` lowest scores of the block. Equal scores
/// are pruned in index order.
///
/// # Errors
///
/// Returns error if `n >= m`, or the last dimension is not a multiple of `m`.
pub fn nm_mask(score: &Tensor, n: usize, m: usize) -> Result<Tensor> {
    if m == 0 || n >= m {
        return Err(TransformError::InvalidConfig(format!(
            "n must be lower than m, got {n}:{m}"
        )));
    }

    let dims = score.dims().to_vec();
    let last = dims.last().copied().unwrap_or(1);
    if last % m != 0 {
        return Err(TransformError::InvalidConfig(format!(
            "last dimension {last} of shape {dims:?} is not divisible by m={m}"
        )));
    }

    let values = score.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let mut mask = vec![1u8; values.len()];

    let mut order: Vec<usize> = Vec::with_capacity(m);
    for (block_idx, block) in values.chunks(m).enumerate() {
        order.clear();
        order.extend(0..m);
        // Stable: ties keep index order.
        order.sort_by(|&a, &b| block[a].total_cmp(&block[b]));

        let base = block_idx * m;
        for &i in &order[..n] {
            mask[base + i] = 0;
        }
    }

    Ok(Tensor::from_vec(mask, dims, score.device())?)
}

/// Gate `weight` with `mask`: kept elements pass through, pruned ones are 0.
///
/// # Errors
///
/// Returns [`TransformError::ShapeMismatch`] if the shapes differ.
pub fn apply_sparsity(weight: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if weight.dims() != mask.dims() {
        return Err(TransformError::shape_mismatch(weight.dims(), mask.dims()));
    }
    let zeros = weight.zeros_like()?;
    Ok(mask.where_cond(weight, &zeros)?)
}

/// Reinterpret `mask` in `shape`, e.g. when a layer merges attention heads.
///
/// # Errors
///
/// Returns [`TransformError::ShapeMismatch`] if the element counts differ.
pub fn reshape_mask(mask: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if mask.dims() == shape {
        return Ok(mask.clone());
    }
    let numel: usize = shape.iter().product();
    if numel != mask.elem_count() {
        return Err(TransformError::shape_mismatch(shape, mask.dims()));
    }
    Ok(mask.reshape(shape)?)
}

/// Fraction of pruned elements in a mask.
///
/// # Errors
///
/// Returns error if tensor operations fail.
pub fn mask_sparsity(mask: &Tensor) -> Result<f32> {
    if mask.elem_count() == 0 {
        return Ok(0.0);
    }
    let kept = mask.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?;
    Ok(1.0 - kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_2_4_mask_prunes_lowest() {
        let device = Device::Cpu;
        let score = Tensor::new(
            &[[0.9f32, 0.1, 0.5, 0.3, 4.0, 3.0, 2.0, 1.0]],
            &device,
        )
        .unwrap();

        let mask = nm_mask(&score, 2, 4).unwrap().to_vec2::<u8>().unwrap();

        assert_eq!(mask, vec![vec![1, 0, 1, 0, 1, 1, 0, 0]]);
    }

    #[test]
    fn test_ties_pruned_in_index_order() {
        let device = Device::Cpu;
        let score = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0, 2.0, 0.0, 0.0, 2.0], &device).unwrap();

        let mask = nm_mask(&score, 2, 4).unwrap().to_vec1::<u8>().unwrap();

        assert_eq!(mask, vec![0, 0, 1, 1, 1, 0, 0, 1]);
    }

    #[test]
    fn test_1_4_mask_keeps_argmax() {
        let device = Device::Cpu;
        let score = Tensor::rand(0.0f32, 1.0, (10, 2, 4), &device).unwrap();

        let mask = nm_mask(&score, 3, 4).unwrap();
        let kept = mask.to_dtype(DType::F32).unwrap().sum_all().unwrap();
        assert_eq!(kept.to_scalar::<f32>().unwrap(), 20.0);

        let score_argmax = score.argmax(2).unwrap().flatten_all().unwrap();
        let mask_argmax = mask.argmax(2).unwrap().flatten_all().unwrap();
        assert_eq!(
            score_argmax.to_vec1::<u32>().unwrap(),
            mask_argmax.to_vec1::<u32>().unwrap()
        );
    }

    #[test]
    fn test_every_block_has_n_zeros() {
        let device = Device::Cpu;
        let score = Tensor::randn(0.0f32, 1.0, (16, 32), &device).unwrap();

        let mask = nm_mask(&score, 2, 4).unwrap();
        let flat = mask.flatten_all().unwrap().to_vec1::<u8>().unwrap();

        for block in flat.chunks(4) {
            assert_eq!(block.iter().filter(|&&v| v == 0).count(), 2);
        }
        assert!((mask_sparsity(&mask).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_nm() {
        let device = Device::Cpu;
        let score = Tensor::ones((2, 12), DType::F32, &device).unwrap();

        assert!(nm_mask(&score, 4, 1).is_err());
        assert!(nm_mask(&score, 4, 4).is_err());
        assert!(nm_mask(&score, 2, 5).is_err());
    }

    #[test]
    fn test_apply_sparsity_idempotent() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f32, 1.0, (8, 8), &device).unwrap();
        let mask = nm_mask(&weight.abs().unwrap(), 2, 4).unwrap();

        let once = apply_sparsity(&weight, &mask).unwrap();
        let twice = apply_sparsity(&once, &mask).unwrap();

        assert_eq!(
            once.to_vec2::<f32>().unwrap(),
            twice.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_apply_sparsity_values() {
        let device = Device::Cpu;
        let weight = Tensor::new(&[1.0f32, -2.0, 3.0, -4.0], &device).unwrap();
        let mask = Tensor::new(&[1u8, 0, 0, 1], &device).unwrap();

        let out = apply_sparsity(&weight, &mask).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![1.0, 0.0, 0.0, -4.0]);
    }

    #[test]
    fn test_reshape_mask() {
        let device = Device::Cpu;
        let mask = Tensor::ones((4, 6), DType::U8, &device).unwrap();

        assert_eq!(reshape_mask(&mask, &[4, 2, 3]).unwrap().dims(), &[4, 2, 3]);
        assert_eq!(reshape_mask(&mask, &[4, 6]).unwrap().dims(), &[4, 6]);
        assert!(matches!(
            reshape_mask(&mask, &[5, 5]),
            Err(TransformError::ShapeMismatch { .. })
        ));
    }
}
