//! Mode dispatch for quantized projections.
//!
//! Every `(mode, quantization type, activation type)` combination maps to
//! exactly one [`ForwardPath`] or to an explicit unsupported error.

use crate::config::{
    ActivationQuantizationType, QuantizationConfig, QuantizationMode, QuantizationType,
};
use crate::error::{Result, TransformError};

/// Computation a quantized layer performs in its forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPath {
    /// Full-precision projection with the stored weight.
    Dense,
    /// Quantize-dequantize both operands, full-precision projection.
    FakeQuant,
    /// Projection with the reduced weight, scales applied afterwards.
    Quantized {
        /// Whether activations are reduced per token before the matmul.
        dynamic_activation: bool,
    },
}

/// Select the forward path for a configuration.
///
/// # Errors
///
/// Returns [`TransformError::UnsupportedConfiguration`] for static activation
/// quantization and for AQT.
pub fn forward_path(config: &QuantizationConfig) -> Result<ForwardPath> {
    use ActivationQuantizationType as Act;
    use QuantizationMode as Mode;
    use QuantizationType as Kind;

    match (
        config.mode,
        config.quantization_type,
        config.activation_quantization_type,
    ) {
        (_, _, Act::Static) => Err(static_activation(config)),
        (Mode::Inference, _, Act::None) => Ok(ForwardPath::Quantized {
            dynamic_activation: false,
        }),
        (Mode::Inference, _, Act::Dynamic) => Ok(ForwardPath::Quantized {
            dynamic_activation: true,
        }),
        (_, Kind::Aqt, _) => Err(aqt(config)),
        (Mode::Training | Mode::Materialize, Kind::Ptq, _) => Ok(ForwardPath::Dense),
        (Mode::Training | Mode::Materialize, Kind::Fq, _) => Ok(ForwardPath::FakeQuant),
    }
}

/// Check that a configuration can produce an export artifact.
///
/// # Errors
///
/// Returns [`TransformError::UnsupportedConfiguration`] for static activation
/// quantization and for AQT.
pub fn check_export_supported(config: &QuantizationConfig) -> Result<()> {
    match (config.quantization_type, config.activation_quantization_type) {
        (_, ActivationQuantizationType::Static) => Err(static_activation(config)),
        (QuantizationType::Aqt, _) => Err(aqt(config)),
        (QuantizationType::Ptq | QuantizationType::Fq, _) => Ok(()),
    }
}

fn static_activation(config: &QuantizationConfig) -> TransformError {
    TransformError::unsupported("static activation quantization", config)
}

fn aqt(config: &QuantizationConfig) -> TransformError {
    TransformError::unsupported("AQT quantization", config)
}
