//! Quantization of projection weights and activations.
//!
//! This module provides:
//! - **Weight quantization**: per-output-channel AbsMax -> INTn
//! - **Activation quantization**: per-token AbsMax -> INTn
//! - **Projections**: quantized, fake-quantized and dense `...y,yz->...z`
//! - **Dispatch**: mode/type/activation combination -> forward path

mod activation;
mod dispatch;
mod fakequant;
mod matmul;
mod weight;

pub use activation::{dequantize_activations, reduce_precision_activation, QuantizedActivations};
pub use dispatch::{check_export_supported, forward_path, ForwardPath};
pub use fakequant::{fake_quantize_with_scale, fakequant_activation, fakequant_weight, max_abs_diff};
pub use matmul::{fakequant_matmul, project_last_dim, quantized_matmul};
pub use weight::{dequantize_weight, quantize_weight, reduce_precision, QuantizedWeight};
