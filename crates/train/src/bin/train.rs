//! CLI for consistency training on mnist / cifar10.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use ct_common::{DatasetKind, DeviceChoice, ImageDataset, ModelConfig, TrainConfig};

#[derive(Parser, Debug)]
#[command(name = "ct-train", about = "Consistency training of an image generator")]
struct Args {
    #[arg(long = "img_size", default_value = "32")]
    img_size: usize,
    #[arg(long = "batch_size", default_value = "64")]
    batch_size: usize,
    /// Depth of the background batch queue (0 = load on the training thread).
    #[arg(long = "num_workers", default_value = "4")]
    num_workers: usize,
    #[arg(long, default_value = "mnist")]
    dataset: DatasetKind,
    #[arg(long, default_value = "1e-3")]
    lr: f64,
    #[arg(long = "n_epochs", default_value = "10")]
    n_epochs: usize,
    #[arg(long = "sample_every_n_epoch", default_value = "1")]
    sample_every_n_epoch: usize,
    /// auto, cpu, cuda[:N] or metal[:N].
    #[arg(long, default_value = "auto")]
    device: DeviceChoice,
    /// Record metrics, sample galleries and model artifacts.
    #[arg(long, visible_alias = "wandb", default_value_t = true, action = ArgAction::Set)]
    track: bool,
    #[arg(long, default_value = "0")]
    seed: u64,
    /// Local dataset directory. Optional for mnist (downloaded from the hub),
    /// required for cifar10 (binary batches).
    #[arg(long = "data_dir")]
    data_dir: Option<PathBuf>,
    #[arg(long = "sample_dir", default_value = "contents")]
    sample_dir: PathBuf,
    #[arg(long = "checkpoint_dir", default_value = ".")]
    checkpoint_dir: PathBuf,
    #[arg(long = "tracking_dir", default_value = "runs")]
    tracking_dir: PathBuf,
    #[arg(long, default_value = "consistency-model")]
    project: String,
}

impl From<Args> for TrainConfig {
    fn from(args: Args) -> Self {
        Self {
            img_size: args.img_size,
            batch_size: args.batch_size,
            num_workers: args.num_workers,
            dataset: args.dataset,
            lr: args.lr,
            n_epochs: args.n_epochs,
            sample_every_n_epoch: args.sample_every_n_epoch,
            device: args.device,
            track: args.track,
            seed: args.seed,
            data_dir: args.data_dir,
            sample_dir: args.sample_dir,
            checkpoint_dir: args.checkpoint_dir,
            tracking_dir: args.tracking_dir,
            project: args.project,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = TrainConfig::from(Args::parse());
    config.validate()?;

    let device = config.device.resolve()?;
    tracing::info!(device = ?device, dataset = config.dataset.name(), "Starting training");

    let dataset = ImageDataset::load(config.dataset, config.data_dir.as_deref(), config.img_size)?;
    let model_config = ModelConfig::for_dataset(config.dataset);
    ct_train::run::train(&config, &dataset, model_config, device)?;
    Ok(())
}
