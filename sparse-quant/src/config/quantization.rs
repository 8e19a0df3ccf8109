//! Configuration for weight and activation quantization.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformError};

/// Lifecycle phase the quantized layer runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMode {
    /// Full-precision weight is stored and trained.
    #[default]
    Training,
    /// Full-precision weight is stored; the layer is about to be exported.
    Materialize,
    /// Reduced-precision weight and its scale are stored; no training.
    Inference,
}

/// Quantization algorithm applied outside inference mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationType {
    /// Post-training quantization: train dense, quantize on export.
    #[default]
    Ptq,
    /// Fake quantization: quantize-dequantize in the forward pass.
    Fq,
    /// Accurate quantized training. Not implemented.
    Aqt,
}

/// How activations are quantized in inference mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationQuantizationType {
    /// Activations stay in full precision.
    #[default]
    None,
    /// Per-token scale recomputed on every call.
    Dynamic,
    /// Calibrated, stored activation scale. Not implemented.
    Static,
}

/// Configuration for symmetric per-channel quantization.
///
/// Weights get one scale per output channel (`absmax / qmax`), activations
/// one scale per token when dynamic activation quantization is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Lifecycle phase.
    pub mode: QuantizationMode,

    /// Algorithm used in training and materialize modes.
    pub quantization_type: QuantizationType,

    /// Activation handling.
    pub activation_quantization_type: ActivationQuantizationType,

    /// Bit width of the reduced weight. Values are stored as `i8`.
    pub weight_bits: u8,

    /// Bit width of quantized activations.
    pub activation_bits: u8,

    /// Lower bound for every derived scale, so all-zero channels never
    /// produce a zero scale.
    pub scale_floor: f32,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            mode: QuantizationMode::Training,
            quantization_type: QuantizationType::Ptq,
            activation_quantization_type: ActivationQuantizationType::None,
            weight_bits: 8,
            activation_bits: 8,
            scale_floor: 1e-12,
        }
    }
}

impl QuantizationConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for serving a quantized checkpoint.
    #[must_use]
    pub fn inference() -> Self {
        Self {
            mode: QuantizationMode::Inference,
            ..Default::default()
        }
    }

    /// Configuration for quantization-aware training with fake quantization.
    #[must_use]
    pub fn training() -> Self {
        Self {
            mode: QuantizationMode::Training,
            quantization_type: QuantizationType::Fq,
            ..Default::default()
        }
    }

    /// Set the lifecycle mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: QuantizationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the quantization algorithm.
    #[must_use]
    pub const fn with_quantization_type(mut self, quantization_type: QuantizationType) -> Self {
        self.quantization_type = quantization_type;
        self
    }

    /// Set the activation quantization type.
    #[must_use]
    pub const fn with_activation_quantization(
        mut self,
        activation: ActivationQuantizationType,
    ) -> Self {
        self.activation_quantization_type = activation;
        self
    }

    /// Set the weight bit width.
    #[must_use]
    pub const fn with_weight_bits(mut self, bits: u8) -> Self {
        self.weight_bits = bits;
        self
    }

    /// Set the activation bit width.
    #[must_use]
    pub const fn with_activation_bits(mut self, bits: u8) -> Self {
        self.activation_bits = bits;
        self
    }

    /// Set the scale floor.
    #[must_use]
    pub const fn with_scale_floor(mut self, floor: f32) -> Self {
        self.scale_floor = floor;
        self
    }

    /// Largest representable weight magnitude, e.g. 127 for 8 bits.
    ///
    /// # Errors
    ///
    /// Returns error if `weight_bits` is outside 2..=8.
    pub fn weight_qmax(&self) -> Result<f32> {
        representable_max(self.weight_bits)
    }

    /// Largest representable activation magnitude.
    ///
    /// # Errors
    ///
    /// Returns error if `activation_bits` is outside 2..=8.
    pub fn activation_qmax(&self) -> Result<f32> {
        representable_max(self.activation_bits)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a bit width is outside 2..=8 or the scale floor is
    /// not a positive finite number.
    pub fn validate(&self) -> Result<()> {
        if !(2..=8).contains(&self.weight_bits) {
            return Err(TransformError::InvalidConfig(format!(
                "weight_bits must be 2-8, got {}",
                self.weight_bits
            )));
        }

        if !(2..=8).contains(&self.activation_bits) {
            return Err(TransformError::InvalidConfig(format!(
                "activation_bits must be 2-8, got {}",
                self.activation_bits
            )));
        }

        if !(self.scale_floor > 0.0 && self.scale_floor.is_finite()) {
            return Err(TransformError::InvalidConfig(format!(
                "scale_floor must be > 0, got {}",
                self.scale_floor
            )));
        }

        Ok(())
    }
}

/// `2^(bits-1) - 1` as a float. Values are stored as `i8`, so `bits` is
/// limited to 2..=8.
pub(crate) fn representable_max(bits: u8) -> Result<f32> {
    if !(2..=8).contains(&bits) {
        return Err(TransformError::InvalidConfig(format!(
            "bit width must be 2-8, got {bits}"
        )));
    }
    Ok(((1i32 << (bits - 1)) - 1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuantizationConfig::default();
        assert_eq!(config.mode, QuantizationMode::Training);
        assert_eq!(config.quantization_type, QuantizationType::Ptq);
        assert_eq!(
            config.activation_quantization_type,
            ActivationQuantizationType::None
        );
        assert_eq!(config.weight_bits, 8);
        assert!((config.weight_qmax().unwrap() - 127.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_named_constructors() {
        assert_eq!(
            QuantizationConfig::inference().mode,
            QuantizationMode::Inference
        );
        let training = QuantizationConfig::training();
        assert_eq!(training.mode, QuantizationMode::Training);
        assert_eq!(training.quantization_type, QuantizationType::Fq);
    }

    #[test]
    fn test_builder_pattern() {
        let config = QuantizationConfig::new()
            .with_mode(QuantizationMode::Materialize)
            .with_quantization_type(QuantizationType::Fq)
            .with_activation_quantization(ActivationQuantizationType::Dynamic)
            .with_weight_bits(4)
            .with_activation_bits(6);

        assert_eq!(config.mode, QuantizationMode::Materialize);
        assert_eq!(config.weight_bits, 4);
        assert!((config.weight_qmax().unwrap() - 7.0).abs() < f32::EPSILON);
        assert!((config.activation_qmax().unwrap() - 31.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_validation() {
        assert!(QuantizationConfig::default().validate().is_ok());
        assert!(QuantizationConfig::default()
            .with_weight_bits(1)
            .validate()
            .is_err());
        assert!(QuantizationConfig::default()
            .with_activation_bits(9)
            .validate()
            .is_err());
        assert!(QuantizationConfig::default()
            .with_scale_floor(0.0)
            .validate()
            .is_err());
        assert!(QuantizationConfig::default()
            .with_scale_floor(f32::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serde_names() {
        let config = QuantizationConfig::inference()
            .with_activation_quantization(ActivationQuantizationType::Dynamic);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mode\":\"inference\""));
        assert!(json.contains("\"activation_quantization_type\":\"dynamic\""));

        let parsed: QuantizationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
