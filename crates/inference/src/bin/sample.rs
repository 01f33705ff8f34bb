//! Generate a sample grid from trained consistency-model weights.

use std::path::PathBuf;

use clap::Parser;

use ct_common::DeviceChoice;
use ct_infer::{SampleSchedule, SamplingRuntime};

#[derive(Parser, Debug)]
#[command(name = "ct-sample", about = "Few-step sampling from a trained consistency model")]
struct Args {
    /// Weights written by ct-train (`ct_{dataset}.safetensors`).
    #[arg(long)]
    weights: PathBuf,
    /// Model config; defaults to the weights path with a `.json` extension.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Comma-separated, decreasing noise levels.
    #[arg(long, default_value = "80,40,20,10,5")]
    steps: SampleSchedule,
    #[arg(long, default_value_t = 16)]
    count: usize,
    #[arg(long = "img_size", default_value_t = 32)]
    img_size: usize,
    #[arg(long, default_value_t = 4)]
    nrow: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value = "auto")]
    device: DeviceChoice,
    #[arg(long, default_value = "samples.png")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args
        .config
        .clone()
        .unwrap_or_else(|| args.weights.with_extension("json"));
    let device = args.device.resolve()?;

    let mut runtime = SamplingRuntime::load(&args.weights, &config, device, args.seed)?;
    runtime.write_grid(args.count, args.img_size, &args.steps, args.nrow, &args.output)?;
    Ok(())
}
