//! Sampling runtime: rebuild a trained network and draw image grids from it.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use ct_common::{save_sample_grid, ModelConfig};
use ct_core::{randn, ConsistencyModel};

use crate::sampler::SampleSchedule;

/// A loaded consistency model plus the RNG its noise is drawn from.
pub struct SamplingRuntime {
    model: ConsistencyModel,
    #[allow(dead_code)]
    varmap: VarMap,
    config: ModelConfig,
    device: Device,
    rng: StdRng,
}

impl SamplingRuntime {
    /// Load `weights` (safetensors written by the trainer) into a network
    /// built from the JSON `config` next to them.
    pub fn load(weights: &Path, config: &Path, device: Device, seed: u64) -> anyhow::Result<Self> {
        let config = ModelConfig::load(config)?;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ConsistencyModel::new(&config, vb)?;
        varmap.load(weights)?;
        tracing::info!(
            weights = %weights.display(),
            in_channels = config.in_channels,
            "Model loaded"
        );
        Ok(Self {
            model,
            varmap,
            config,
            device,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// `count` samples of `img_size × img_size`, raw model range (≈ `[-1, 1]`).
    pub fn generate(
        &mut self,
        count: usize,
        img_size: usize,
        schedule: &SampleSchedule,
    ) -> anyhow::Result<Tensor> {
        if img_size < 4 || img_size % 2 != 0 {
            anyhow::bail!("img_size must be an even number >= 4, got {img_size}");
        }
        let levels = schedule.levels();
        let Some(&t_max) = levels.first() else {
            anyhow::bail!("empty sample schedule");
        };
        let shape = (count, self.config.in_channels, img_size, img_size);
        let x_init = randn(shape, &mut self.rng, &self.device)?.affine(t_max, 0.0)?;
        Ok(self.model.sample(&x_init, levels, &mut self.rng)?)
    }

    /// Generate and save a grid with `nrow` images per row.
    pub fn write_grid(
        &mut self,
        count: usize,
        img_size: usize,
        schedule: &SampleSchedule,
        nrow: usize,
        output: &Path,
    ) -> anyhow::Result<()> {
        let samples = self.generate(count, img_size, schedule)?;
        save_sample_grid(&samples, nrow, output)?;
        tracing::info!(path = %output.display(), steps = schedule.len(), "Saved sample grid");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
