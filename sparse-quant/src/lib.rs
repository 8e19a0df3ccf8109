//! Weight quantization and scheduled structured sparsity for linear layers.
//!
//! This crate provides two orthogonal weight transforms for projection
//! layers laid out `[in_features, out_features]`:
//! - **Quantization**: symmetric per-output-channel INTn weights, optional
//!   per-token dynamic activation quantization, fake quantization for
//!   quantization-aware training
//! - **Sparsity**: binary N:M masks recomputed on a step schedule
//!   (one-shot, few-shot or continuous), with per-layer gating
//!
//! # Features
//!
//! - `QuantizedLinear`: projection following the training/inference lifecycle
//! - `SparseLinear`: projection whose weight is masked on scheduled steps
//! - Export of reduced weights and scales, plus partition specs for them
//! - Per-layer state persisted through a `VariableStore`
//!
//! # Quick Start
//!
//! ```ignore
//! use sparse_quant::{QuantizationConfig, QuantizedLinear};
//! use candle_core::{Device, Tensor};
//! use candle_nn::Module;
//!
//! let device = Device::Cpu;
//! let weight = Tensor::randn(0.0f32, 1.0, (256, 512), &device)?;
//! let layer = QuantizedLinear::from_weight(&weight, None, &QuantizationConfig::inference())?;
//!
//! let input = Tensor::randn(0.0f32, 1.0, (4, 256), &device)?;
//! let output = layer.forward(&input)?;
//! ```
//!
//! # Quantization
//!
//! Weights are reduced per output channel `k`:
//! ```text
//! scale[k] = max(max(|W[.., k]|) / qmax, scale_floor)
//! W_q      = round(W / scale) clamped to [-qmax, qmax],  qmax = 2^(bits-1) - 1
//! ```
//!
//! Activations use the same arithmetic per token. The quantized projection
//! multiplies the reduced operands and applies the combined scale afterwards.
//!
//! # Sparsity
//!
//! See [`sparsity`] for the schedule.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::doc_markdown)] // Many technical terms don't need backticks

mod config;
mod error;
pub mod layer;
pub mod quantization;
pub mod sparsity;
pub mod store;
pub mod summary;

pub use config::{
    ActivationQuantizationType, LayerSelection, PruneRate, QuantizationConfig, QuantizationMode,
    QuantizationType, SparsityConfig, SparsityMode, SparsityScore, SparsityType,
};
pub use error::{Result, TransformError};
pub use layer::{QuantizedLinear, SparseLinear};
pub use quantization::{
    dequantize_activations, dequantize_weight, fakequant_matmul, quantize_weight,
    quantized_matmul, reduce_precision, reduce_precision_activation, QuantizedActivations,
    QuantizedWeight,
};
pub use sparsity::{LayerSparsityState, LayerStates, Sparsifier};
pub use store::{TensorStore, VariableStore};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{QuantizationConfig, SparsityConfig};
    pub use crate::error::{Result, TransformError};
    pub use crate::layer::{QuantizedLinear, SparseLinear};
    pub use crate::quantization::{quantize_weight, reduce_precision};
    pub use crate::sparsity::Sparsifier;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use candle_nn::Module;

    #[test]
    fn test_basic_workflow() {
        let device = Device::Cpu;
        let config = QuantizationConfig::inference();

        let weight = Tensor::randn(0.0f32, 1.0, (128, 64), &device).unwrap();
        let layer = QuantizedLinear::from_weight(&weight, None, &config).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (4, 128), &device).unwrap();
        let output = layer.forward(&input).unwrap();

        assert_eq!(output.shape().dims(), &[4, 64]);

        let ratio = layer.quantized_weight().unwrap().compression_ratio();
        assert!(ratio > 1.0, "should achieve compression");
    }

    #[test]
    fn test_quantization_workflow() {
        let device = Device::Cpu;
        let config = QuantizationConfig::default();

        let weight = Tensor::randn(0.0f32, 1.0, (128, 64), &device).unwrap();
        let quantized = quantize_weight(&weight, &config).unwrap();

        assert_eq!(quantized.shape, vec![128, 64]);
        assert_eq!(quantized.scales.len(), 64);

        let restored = dequantize_weight(&quantized, &device).unwrap();
        assert_eq!(restored.shape().dims(), &[128, 64]);
    }

    #[test]
    fn test_activation_quantization() {
        let device = Device::Cpu;
        let config = QuantizationConfig::default();

        let activations = Tensor::randn(0.0f32, 1.0, (4, 64), &device).unwrap();
        let quantized = reduce_precision_activation(&activations, &config).unwrap();

        assert_eq!(quantized.shape, vec![4, 64]);
        assert_eq!(quantized.scales.len(), 4); // Per-token

        let restored = dequantize_activations(&quantized, &device).unwrap();
        assert_eq!(restored.shape().dims(), &[4, 64]);
    }

    #[test]
    fn test_sparsity_workflow() {
        let device = Device::Cpu;
        let sparsifier = Sparsifier::new(SparsityConfig::one_shot(2, 4, 0)).unwrap();

        let weight = Tensor::randn(0.0f32, 1.0, (64, 32), &device).unwrap();
        let mut layer = SparseLinear::new(&weight, None, sparsifier, 0).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (4, 64), &device).unwrap();
        let output = layer.forward(&input).unwrap();

        assert_eq!(output.shape().dims(), &[4, 32]);
        let pruned = sparsity::mask_sparsity(&layer.state().mask).unwrap();
        assert!((pruned - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_config_builder() {
        let config = QuantizationConfig::new()
            .with_mode(QuantizationMode::Inference)
            .with_weight_bits(4)
            .with_activation_bits(8)
            .with_activation_quantization(ActivationQuantizationType::Dynamic);

        assert_eq!(config.weight_bits, 4);
        assert_eq!(config.activation_bits, 8);
        assert_eq!(config.mode, QuantizationMode::Inference);
        assert!(config.validate().is_ok());
    }
}
