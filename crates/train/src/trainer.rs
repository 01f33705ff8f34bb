//! Trainer: consistency training of one network against its EMA target.
//!
//! Decouples the compute graph (noise draw, boundary pair, consistency loss)
//! from the optimisation step (backward, AdamW at the one-cycle lr/β1,
//! schedule advance, EMA update).

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ct_common::{ModelConfig, TrainConfig};
use ct_core::{randn, randn_like, reseed_vars, BoundarySchedule, ConsistencyModel, Ema, EpochPlan};

use crate::scheduler::OneCycleLr;

/// Smoothing of the displayed loss: `ema = 0.9 · ema + 0.1 · loss`.
const LOSS_EMA_DECAY: f32 = 0.9;

// ── Config ──────────────────────────────────────────────────────────────────

/// Training hyper-parameters.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Peak learning rate.
    pub lr: f64,
    pub n_epochs: usize,
    /// Optimiser steps per epoch (number of batches).
    pub steps_per_epoch: usize,
    pub seed: u64,
    pub schedule: BoundarySchedule,
}

impl TrainerConfig {
    pub fn from_run(run: &TrainConfig, steps_per_epoch: usize) -> Self {
        Self {
            lr: run.lr,
            n_epochs: run.n_epochs,
            steps_per_epoch,
            seed: run.seed,
            schedule: BoundarySchedule::default(),
        }
    }

    pub fn total_steps(&self) -> usize {
        self.steps_per_epoch * self.n_epochs
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub loss_ema: f32,
    /// Learning rate for the next step, after the schedule advanced.
    pub lr: f64,
    #[serde(rename = "N")]
    pub n: usize,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the live model, its EMA, the optimiser and
/// the seeded RNG every random draw comes from.
pub struct Trainer {
    pub model: ConsistencyModel,
    pub varmap: VarMap,
    optimizer: AdamW,
    lr_scheduler: OneCycleLr,
    ema: Ema,
    pub config: TrainerConfig,
    model_config: ModelConfig,
    rng: StdRng,
    loss_ema: Option<f32>,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Build the live network, redraw its weights from `seed`, and copy it
    /// into the EMA network.
    pub fn new(
        model_config: ModelConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        model_config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ConsistencyModel::new(&model_config, vb)?;

        let mut rng = StdRng::seed_from_u64(trainer_config.seed);
        reseed_vars(&varmap, &mut rng)?;
        model.seed_dropout(trainer_config.seed)?;
        let ema = Ema::new(&varmap, &model_config, &device)?;

        let vars = varmap.all_vars();
        let total_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        tracing::info!(
            total_params,
            hidden_dim = model_config.hidden_dim,
            in_channels = model_config.in_channels,
            "Model built"
        );

        let lr_scheduler = OneCycleLr::new(trainer_config.lr, trainer_config.total_steps());
        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: lr_scheduler.current_lr(),
                beta1: lr_scheduler.current_beta1(),
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            optimizer,
            lr_scheduler,
            ema,
            config: trainer_config,
            model_config,
            rng,
            loss_ema: None,
            global_step: 0,
            device,
        })
    }

    /// Noise levels and step count `N` for `epoch` (1-based).
    pub fn begin_epoch(&self, epoch: usize) -> EpochPlan {
        self.config.schedule.for_epoch(epoch, self.config.n_epochs)
    }

    /// One optimiser step on a batch of images in `[-1, 1]`.
    pub fn step(&mut self, images: &Tensor, plan: &EpochPlan) -> anyhow::Result<StepMetrics> {
        if plan.n < 2 {
            anyhow::bail!("epoch plan needs at least 2 boundaries, got {}", plan.n);
        }
        let x = images.to_device(&self.device)?.to_dtype(DType::F32)?;
        let b = x.dim(0)?;

        // Noise and one boundary pair per sample
        let z = randn_like(&x, &mut self.rng)?;
        let (t0, t1): (Vec<f32>, Vec<f32>) = (0..b)
            .map(|_| {
                let (t0, t1) = plan.pair(self.rng.gen_range(0..plan.n - 1));
                (t0 as f32, t1 as f32)
            })
            .unzip();
        let t0 = Tensor::from_vec(t0, b, &self.device)?;
        let t1 = Tensor::from_vec(t1, b, &self.device)?;

        let loss = self.model.loss(&x, &z, &t0, &t1, self.ema.model())?;
        let loss_val = loss.to_scalar::<f32>()?;

        // Optimiser step at the scheduled lr / β1
        self.optimizer.set_params(ParamsAdamW {
            lr: self.lr_scheduler.current_lr(),
            beta1: self.lr_scheduler.current_beta1(),
            ..self.optimizer.params().clone()
        });
        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;

        // Advance schedule, then pull the EMA toward the new weights
        self.lr_scheduler.advance();
        self.ema.update(&self.varmap, plan.n)?;

        let loss_ema = match self.loss_ema {
            None => loss_val,
            Some(prev) => LOSS_EMA_DECAY * prev + (1.0 - LOSS_EMA_DECAY) * loss_val,
        };
        self.loss_ema = Some(loss_ema);
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            loss_ema,
            lr: self.lr_scheduler.current_lr(),
            n: plan.n,
        })
    }

    /// Generate `count` images of shape `dims = (c, h, w)` with the live
    /// model in evaluation mode, starting from `N(0, 1) · steps[0]`.
    pub fn sample(
        &mut self,
        count: usize,
        dims: (usize, usize, usize),
        steps: &[f64],
    ) -> anyhow::Result<Tensor> {
        let Some(&t_max) = steps.first() else {
            anyhow::bail!("sampling needs at least one noise level");
        };
        let (c, h, w) = dims;
        let x_init = randn((count, c, h, w), &mut self.rng, &self.device)?.affine(t_max, 0.0)?;
        Ok(self.model.sample(&x_init, steps, &mut self.rng)?)
    }

    /// Write the live weights to `weights` and the network config to `config`.
    pub fn save_weights(&self, weights: &Path, config: &Path) -> anyhow::Result<()> {
        for path in [weights, config] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.varmap.save(weights)?;
        self.model_config.save(config)?;
        Ok(())
    }

    pub fn ema(&self) -> &Ema {
        &self.ema
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
