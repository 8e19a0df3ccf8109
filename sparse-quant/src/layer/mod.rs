//! Linear layers that host the transforms.
//!
//! This module provides:
//! - `QuantizedLinear`: projection following the quantization lifecycle
//! - `SparseLinear`: projection with a scheduled N:M mask
//! - Partition specs for exported quantized variables

mod partition;
mod quantized_linear;
mod sparse_linear;

pub use partition::{quantized_partition_specs, PartitionSpec, PARAMS};
pub use quantized_linear::QuantizedLinear;
pub use sparse_linear::SparseLinear;
