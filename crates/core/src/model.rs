//! Consistency model: boundary-conditioned wrapper around the [`UNet`].
//!
//! `f(x, t) = c_skip(t) · x + c_out(t) · F(x, c_noise(t))` with
//!
//! * `c_skip(t) = σ_d² / ((t − ε)² + σ_d²)`
//! * `c_out(t)  = σ_d (t − ε) / sqrt(σ_d² + t²)`
//! * `c_noise(t) = ¼ ln t`
//!
//! so `f(x, ε) = x` holds exactly, whatever the network outputs.

use candle_core::{DType, Result, Tensor};
use candle_nn::{loss, VarBuilder};
use rand::rngs::StdRng;

use ct_common::ModelConfig;

use crate::noise::randn_like;
use crate::unet::UNet;

pub struct ConsistencyModel {
    net: UNet,
    sigma_min: f64,
    sigma_data: f64,
}

impl ConsistencyModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            net: UNet::new(config, vb)?,
            sigma_min: config.sigma_min,
            sigma_data: config.sigma_data,
        })
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigma_min
    }

    pub fn seed_dropout(&self, seed: u64) -> Result<()> {
        self.net.seed_dropout(seed)
    }

    /// `(c_skip, c_out)` for per-sample noise levels `t: (b,)`, shaped `(b, 1, 1, 1)`.
    fn scalings(&self, t: &Tensor) -> Result<(Tensor, Tensor)> {
        let b = t.dim(0)?;
        let sd2 = self.sigma_data * self.sigma_data;
        let shifted = t.affine(1.0, -self.sigma_min)?;
        let c_skip = shifted.sqr()?.affine(1.0, sd2)?.recip()?.affine(sd2, 0.0)?;
        let c_out = shifted
            .affine(self.sigma_data, 0.0)?
            .div(&t.sqr()?.affine(1.0, sd2)?.sqrt()?)?;
        Ok((c_skip.reshape((b, 1, 1, 1))?, c_out.reshape((b, 1, 1, 1))?))
    }

    /// Denoise `x` at per-sample noise levels `t: (b,)`.
    ///
    /// `train` enables dropout; evaluation passes `false`.
    pub fn forward(&self, x: &Tensor, t: &Tensor, train: bool) -> Result<Tensor> {
        let t = t.to_dtype(DType::F32)?;
        let c_noise = t.log()?.affine(0.25, 0.0)?;
        let out = self.net.forward(x, &c_noise, train)?;
        let (c_skip, c_out) = self.scalings(&t)?;
        x.broadcast_mul(&c_skip)? + out.broadcast_mul(&c_out)?
    }

    /// [`forward`](Self::forward) with one noise level shared by the whole batch.
    pub fn forward_at(&self, x: &Tensor, t: f64, train: bool) -> Result<Tensor> {
        let b = x.dim(0)?;
        let t = Tensor::full(t as f32, b, x.device())?;
        self.forward(x, &t, train)
    }

    /// Consistency-training loss for clean images `x` and noise `z`.
    ///
    /// The online model sees `x + t1·z` at the larger level `t1`; the EMA
    /// target sees `x + t0·z` at the adjacent smaller level `t0` and is
    /// detached. Returns the mean squared difference.
    pub fn loss(
        &self,
        x: &Tensor,
        z: &Tensor,
        t0: &Tensor,
        t1: &Tensor,
        ema_model: &ConsistencyModel,
    ) -> Result<Tensor> {
        let b = x.dim(0)?;
        let perturb = |t: &Tensor| -> Result<Tensor> {
            x + z.broadcast_mul(&t.to_dtype(DType::F32)?.reshape((b, 1, 1, 1))?)?
        };
        let online = self.forward(&perturb(t1)?, t1, true)?;
        let target = ema_model.forward(&perturb(t0)?, t0, false)?.detach();
        loss::mse(&online, &target)
    }

    /// Multistep sampling from `x_init` (noise already scaled to `steps[0]`).
    ///
    /// Each subsequent level re-noises the current estimate with
    /// `sqrt(t² − ε²)·z` before denoising again.
    pub fn sample(&self, x_init: &Tensor, steps: &[f64], rng: &mut StdRng) -> Result<Tensor> {
        let Some((&first, rest)) = steps.split_first() else {
            candle_core::bail!("sampling needs at least one noise level");
        };
        let mut x = self.forward_at(x_init, first, false)?;
        for &t in rest {
            let scale = (t * t - self.sigma_min * self.sigma_min).max(0.0).sqrt();
            let z = randn_like(&x, rng)?;
            x = (x + z.affine(scale, 0.0)?)?;
            x = self.forward_at(&x, t, false)?;
        }
        Ok(x.detach())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
