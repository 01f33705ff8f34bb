//! Full training run: epoch loop, sample grids, checkpoints, tracking.

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use ct_common::{prefetch, save_sample_grid, ImageDataset, ModelConfig, TrainConfig};

use crate::tracker::RunTracker;
use crate::trainer::{Trainer, TrainerConfig};

/// Noise levels of the two sample grids written at each checkpoint, keyed
/// by their gallery name.
pub const SAMPLE_STEPS: [(&str, &[f64]); 2] = [
    ("sampled_images_5", &[80.0, 40.0, 20.0, 10.0, 5.0]),
    ("sampled_images_2", &[80.0, 2.0]),
];
pub const GRID_NROW: usize = 4;

/// Train on `dataset` for epochs `1..=config.n_epochs`, writing sample grids
/// and weights on every sample epoch. Returns the trained state.
pub fn train(
    config: &TrainConfig,
    dataset: &ImageDataset,
    model_config: ModelConfig,
    device: Device,
) -> anyhow::Result<Trainer> {
    config.validate()?;
    if dataset.is_empty() {
        anyhow::bail!("dataset {} has no images", config.dataset.name());
    }
    let steps_per_epoch = dataset.num_batches(config.batch_size);
    let mut trainer = Trainer::new(
        model_config,
        TrainerConfig::from_run(config, steps_per_epoch),
        device,
    )?;

    let mut tracker = if config.track {
        Some(RunTracker::init(&config.tracking_dir, &config.project, config)?)
    } else {
        None
    };

    // Shuffling and flips use their own stream so batch order does not
    // depend on how many draws the trainer made.
    let mut data_rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));

    for epoch in 1..=config.n_epochs {
        let plan = trainer.begin_epoch(epoch);
        tracing::info!(epoch = plan.epoch, n = plan.n, "Epoch start");

        let pb = ProgressBar::new(steps_per_epoch as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] epoch {prefix} {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_prefix(plan.epoch.to_string());

        let order = dataset.shuffled_order(&mut data_rng);
        let batches = dataset.batches(order, config.batch_size, &mut data_rng);
        for batch in prefetch(batches, config.num_workers) {
            let m = trainer.step(&batch?, &plan)?;
            pb.set_message(format!("loss: {:.10}, N: {}", m.loss_ema, m.n));
            pb.inc(1);
            if let Some(tracker) = tracker.as_mut() {
                tracker.log(&m)?;
            }
        }
        pb.finish();

        if config.is_sample_epoch(epoch) {
            checkpoint(&mut trainer, config, dataset, epoch, tracker.as_mut())?;
        }
    }

    tracing::info!(steps = trainer.global_step, "Training complete");
    Ok(trainer)
}

/// Write both sample grids and the weights for `epoch`, and log them to
/// `tracker` when tracking is on.
pub fn checkpoint(
    trainer: &mut Trainer,
    config: &TrainConfig,
    dataset: &ImageDataset,
    epoch: usize,
    mut tracker: Option<&mut RunTracker>,
) -> anyhow::Result<()> {
    let dims = dataset.image_dims()?;
    for (key, steps) in SAMPLE_STEPS {
        let samples = trainer.sample(config.batch_size, dims, steps)?;
        let path = config.sample_path(steps.len(), epoch);
        let unit = save_sample_grid(&samples, GRID_NROW, &path)?;
        tracing::info!(path = %path.display(), steps = steps.len(), "Saved sample grid");
        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.log_images(key, epoch, &unit)?;
        }
    }

    let weights = config.weights_path();
    trainer.save_weights(&weights, &config.model_config_path())?;
    tracing::info!(path = %weights.display(), epoch, "Checkpoint saved");
    if let Some(tracker) = tracker {
        tracker.log_artifact(
            "model",
            "model",
            "consistency model weights",
            &weights,
            json!({ "epoch": epoch }),
        )?;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
