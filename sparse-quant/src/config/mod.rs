//! Configuration for quantization and sparsity.

mod quantization;
mod sparsity;

pub(crate) use quantization::representable_max;
pub use quantization::{
    ActivationQuantizationType, QuantizationConfig, QuantizationMode, QuantizationType,
};
pub use sparsity::{
    LayerSelection, PruneRate, SparsityConfig, SparsityMode, SparsityScore, SparsityType,
};
