//! Quantization lifecycle of a linear layer: train with fake quantization,
//! export the reduced weight, serve it.
//!
//! Run with: `cargo run --example basic`

use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use sparse_quant::layer::PartitionSpec;
use sparse_quant::quantization::max_abs_diff;
use sparse_quant::{
    ActivationQuantizationType, QuantizationConfig, QuantizationMode, QuantizedLinear,
    TensorStore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== sparse-quant Quantization Example ===\n");

    let device = Device::Cpu;

    println!("1. Training with fake quantization");
    let train_config = QuantizationConfig::training();
    println!("   Mode: {:?}", train_config.mode);
    println!("   Type: {:?}", train_config.quantization_type);
    println!("   Weight bits: {}", train_config.weight_bits);

    let weight = Tensor::randn(0.0f32, 0.5, (512, 256), &device)?;
    let bias = Tensor::zeros((256,), DType::F32, &device)?;
    let trained = QuantizedLinear::from_weight(&weight, Some(&bias), &train_config)?;
    println!("   Path: {:?}", trained.path());

    let input = Tensor::randn(0.0f32, 1.0, (4, 512), &device)?;
    let fq_output = trained.forward(&input)?;
    println!("   Output shape: {:?}", fq_output.shape());

    println!("\n2. Export");
    let exported = trained.quantize_weight()?;
    println!("   Reduced shape: {:?}", exported.shape);
    println!("   Scales: {}", exported.scales.len());
    println!("   Compression ratio: {:.2}x", exported.compression_ratio());

    let split: PartitionSpec = vec![Some("data".to_string()), Some("mdl".to_string())];
    let specs = trained.quantized_partition_specs("w", &split)?;
    for (name, spec) in &specs["params"] {
        println!("   Partition {name}: {spec:?}");
    }

    println!("\n3. Serving");
    let serve_config = QuantizationConfig::training()
        .with_mode(QuantizationMode::Inference)
        .with_activation_quantization(ActivationQuantizationType::Dynamic);
    let served = QuantizedLinear::from_quantized(exported, Some(bias), &serve_config, &device)?;
    println!("   Path: {:?}", served.path());

    let output = served.forward(&input)?;
    println!(
        "   Max |served - fake quant|: {:.5}",
        max_abs_diff(&output, &fq_output)?
    );

    let seq_input = Tensor::randn(0.0f32, 1.0, (2, 16, 512), &device)?;
    println!(
        "   3D input {:?} -> {:?}",
        seq_input.shape(),
        served.forward(&seq_input)?.shape()
    );

    println!("\n4. Checkpoint variables");
    let mut store = TensorStore::new(&device);
    served.store_variables(&mut store, "w")?;
    println!("   Stored: {:?}", store.names());

    println!("\nDone!");
    Ok(())
}
