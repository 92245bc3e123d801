//! Runs FSFNet on a random image batch and prints the shape of every tap.
//!
//! ```text
//! RUST_LOG=debug cargo run --release --example fsfnet_forward -- [config.json] [weights.safetensors]
//! ```
//!
//! Without a configuration file the default network with one class is used.
//! When a weights path is given and the file exists it is loaded, otherwise
//! the freshly initialized weights are written there.

use fsfnet::{ExecutionMode, FsfNetConfig, Session};
use log::info;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::path::Path;
use std::time::Instant;

fn summarize(label: &str, values: &ArrayD<f32>) {
    let len = values.len().max(1) as f32;
    let mean = values.sum() / len;
    let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    println!("{:>14}: {:?} mean={:.4} min={:.4} max={:.4}", label, values.shape(), mean, min, max);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.first() {
        Some(path) => FsfNetConfig::from_json_file(path)?,
        None => FsfNetConfig::default(),
    };
    info!("configuration: {:?}", config);

    let in_channels = config.in_channels;
    let mut session = Session::new(config)?;

    if let Some(weights) = args.get(1) {
        if Path::new(weights).exists() {
            session.load_weights(weights)?;
        } else {
            session.save_weights(weights)?;
            println!("wrote initial weights to {}", weights);
        }
    }

    let image = ArrayD::random(IxDyn(&[2, in_channels, 224, 224]), Uniform::new(0.0f32, 1.0));

    for mode in [ExecutionMode::Eval, ExecutionMode::Train] {
        session.set_mode(mode);
        let start = Instant::now();
        let prediction = session.forward(&image)?;
        println!("{:?} forward pass in {:.2?}", mode, start.elapsed());

        summarize("out_8", &prediction.out_8);
        summarize("out_16", &prediction.out_16);
        summarize("features", &prediction.features);
        summarize("logits", &prediction.logits);
        summarize("probabilities", &prediction.probabilities);
    }

    Ok(())
}
