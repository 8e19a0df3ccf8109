//! Partition specs for quantized layer variables.
//!
//! A spec names one mesh axis (or none) per tensor dimension. Specs are
//! produced here and forwarded to the host's sharding pass untouched.

use std::collections::BTreeMap;

use crate::config::QuantizationConfig;
use crate::error::{Result, TransformError};
use crate::quantization::check_export_supported;
use crate::store::SCALE_POSTFIX;

/// Mesh axis name per tensor dimension; `None` is replicated.
pub type PartitionSpec = Vec<Option<String>>;

/// Collection the specs are filed under.
pub const PARAMS: &str = "params";

/// Specs for a quantized weight `name` and its scale.
///
/// The weight keeps `weight_split`. The per-output-channel scale takes the
/// entry of the weight's output (last) axis.
///
/// # Errors
///
/// Returns [`TransformError::UnsupportedConfiguration`] when `config` cannot
/// be exported, and [`TransformError::InvalidConfig`] for an empty split.
pub fn quantized_partition_specs(
    name: &str,
    weight_split: &PartitionSpec,
    config: &QuantizationConfig,
) -> Result<BTreeMap<String, BTreeMap<String, PartitionSpec>>> {
    check_export_supported(config)?;

    let out_axis = weight_split.last().cloned().ok_or_else(|| {
        TransformError::InvalidConfig(format!("partition spec for {name} has no dimensions"))
    })?;

    let mut params = BTreeMap::new();
    params.insert(name.to_string(), weight_split.clone());
    params.insert(format!("{name}{SCALE_POSTFIX}"), vec![out_axis]);

    Ok(BTreeMap::from([(PARAMS.to_string(), params)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActivationQuantizationType, QuantizationType};

    fn split(axes: &[Option<&str>]) -> PartitionSpec {
        axes.iter().map(|a| a.map(str::to_string)).collect()
    }

    #[test]
    fn test_scale_follows_output_axis() {
        let config = QuantizationConfig::inference();
        let specs =
            quantized_partition_specs("w", &split(&[Some("data"), Some("mdl")]), &config).unwrap();

        let params = &specs[PARAMS];
        assert_eq!(params["w"], split(&[Some("data"), Some("mdl")]));
        assert_eq!(params["w_scale"], split(&[Some("mdl")]));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_replicated_output_axis() {
        let config = QuantizationConfig::default();
        let specs = quantized_partition_specs("w", &split(&[Some("data"), None]), &config).unwrap();
        assert_eq!(specs[PARAMS]["w_scale"], vec![None]);
    }

    #[test]
    fn test_rejected_configs() {
        let w = split(&[None, None]);
        let aqt = QuantizationConfig::default().with_quantization_type(QuantizationType::Aqt);
        assert!(matches!(
            quantized_partition_specs("w", &w, &aqt),
            Err(TransformError::UnsupportedConfiguration { .. })
        ));

        let static_act = QuantizationConfig::inference()
            .with_activation_quantization(ActivationQuantizationType::Static);
        assert!(quantized_partition_specs("w", &w, &static_act).is_err());

        assert!(matches!(
            quantized_partition_specs("w", &Vec::new(), &QuantizationConfig::default()),
            Err(TransformError::InvalidConfig(_))
        ));
    }
}
