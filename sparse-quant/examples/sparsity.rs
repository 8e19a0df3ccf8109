//! Few-shot N:M sparsity across a small stack of layers.
//!
//! Run with: `cargo run --example sparsity`

use candle_core::{Device, Tensor};
use sparse_quant::sparsity::mask_sparsity;
use sparse_quant::summary::RecordingSummary;
use sparse_quant::{LayerSelection, LayerStates, Sparsifier, SparsityConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== sparse-quant Sparsity Example ===\n");

    let device = Device::Cpu;

    println!("1. Configuration");
    let config = SparsityConfig::few_shot(2, 4, 10, 5, 2)
        .with_sparsified_layers(LayerSelection::indices([0, 2]));
    println!("   Mode: {:?}", config.mode);
    println!("   Prune rate: {:?}", config.prune_rate);
    println!("   Target step: {}", config.target_step);
    println!("   Interval: {}", config.mask_update_interval);
    println!("   Shots: {}", config.num_shots);

    let summary = RecordingSummary::shared();
    let sparsifier = Sparsifier::new(config)?.with_summary_writer(summary.clone());

    println!("\n2. Training loop over 3 layers");
    let weights = (0..3)
        .map(|_| Tensor::randn(0.0f32, 1.0, (64, 32), &device))
        .collect::<Result<Vec<_>, _>>()?;
    let shapes: Vec<&[usize]> = weights.iter().map(Tensor::dims).collect();
    let states = LayerStates::for_shapes(&shapes, &device, sparsifier.config())?;

    for step in 0..25 {
        for (layer_idx, weight) in weights.iter().enumerate() {
            let before = states.snapshot(layer_idx)?.schedule.mask_update_count;
            states.apply(&sparsifier, layer_idx, weight, None)?;
            let after = states.snapshot(layer_idx)?.schedule.mask_update_count;
            if after > before {
                println!("   step {step:>2}: layer {layer_idx} mask recomputed ({after})");
            }
        }
    }

    println!("\n3. Final state");
    for layer_idx in 0..states.len() {
        let state = states.snapshot(layer_idx)?;
        println!(
            "   layer {layer_idx}: step={} updates={} pruned={:.0}%",
            state.schedule.step,
            state.schedule.mask_update_count,
            mask_sparsity(&state.mask)? * 100.0
        );
    }

    let counts = summary.values("mask_update_count");
    println!("   Summaries recorded: {}", counts.len());

    println!("\nDone!");
    Ok(())
}
