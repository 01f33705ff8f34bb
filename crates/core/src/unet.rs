//! Time-conditioned convolutional U-Net backbone.
//!
//! ```text
//! x ─ stem ─ res(base) ────────────────────────────── cat ─ res(base) ─ out
//!                └ down(stride 2) ─ res(hidden) ×2 ─ up ┘
//! ```
//!
//! Every residual block receives the noise-level embedding, projected to its
//! channel count and added after the first convolution.

use std::sync::{Arc, Mutex};

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    conv2d, group_norm, linear, ops::silu, Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder,
};
use rand::rngs::StdRng;

use ct_common::ModelConfig;

use crate::noise::{dropout_rng, reseed_dropout, SeededDropout};

const NORM_EPS: f64 = 1e-5;

fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

// ── Noise-level embedding ───────────────────────────────────────────────────

/// Sinusoidal features of the (log-scaled) noise level followed by a 2-layer MLP.
struct TimeEmbedding {
    freqs: Vec<f32>,
    lin1: Linear,
    lin2: Linear,
}

impl TimeEmbedding {
    fn new(features: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let half = features / 2;
        let freqs = (0..half)
            .map(|k| (-(10_000f64.ln()) * k as f64 / half as f64).exp() as f32)
            .collect();
        Ok(Self {
            freqs,
            lin1: linear(2 * half, out_dim, vb.pp("lin1"))?,
            lin2: linear(out_dim, out_dim, vb.pp("lin2"))?,
        })
    }

    /// `c_noise`: `(b,)` → `(b, out_dim)`.
    fn forward(&self, c_noise: &Tensor) -> Result<Tensor> {
        let freqs = Tensor::new(self.freqs.as_slice(), c_noise.device())?.unsqueeze(0)?;
        let args = c_noise
            .to_dtype(freqs.dtype())?
            .unsqueeze(1)?
            .broadcast_mul(&freqs)?;
        let feats = Tensor::cat(&[args.sin()?, args.cos()?], 1)?;
        self.lin2.forward(&silu(&self.lin1.forward(&feats)?)?)
    }
}

// ── Residual block ──────────────────────────────────────────────────────────

struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    emb_proj: Linear,
    norm2: GroupNorm,
    dropout: SeededDropout,
    conv2: Conv2d,
    skip: Option<Conv2d>,
}

impl ResBlock {
    fn new(
        in_c: usize,
        out_c: usize,
        config: &ModelConfig,
        dropout_rng: &Arc<Mutex<StdRng>>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let groups = config.norm_groups;
        let skip = if in_c != out_c {
            Some(conv2d(in_c, out_c, 1, Default::default(), vb.pp("skip"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: group_norm(groups, in_c, NORM_EPS, vb.pp("norm1"))?,
            conv1: conv3x3(in_c, out_c, 1, vb.pp("conv1"))?,
            emb_proj: linear(config.hidden_dim, out_c, vb.pp("emb_proj"))?,
            norm2: group_norm(groups, out_c, NORM_EPS, vb.pp("norm2"))?,
            dropout: SeededDropout::new(config.dropout, dropout_rng.clone()),
            conv2: conv3x3(out_c, out_c, 1, vb.pp("conv2"))?,
            skip,
        })
    }

    fn forward(&self, x: &Tensor, emb: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.conv1.forward(&silu(&self.norm1.forward(x)?)?)?;
        let (b, c, _, _) = h.dims4()?;
        let e = self
            .emb_proj
            .forward(&silu(emb)?)?
            .reshape((b, c, 1, 1))?;
        let h = h.broadcast_add(&e)?;
        let h = silu(&self.norm2.forward(&h)?)?;
        let h = self.conv2.forward(&self.dropout.forward(&h, train)?)?;
        let residual = match &self.skip {
            Some(skip) => skip.forward(x)?,
            None => x.clone(),
        };
        residual + h
    }
}

// ── U-Net ───────────────────────────────────────────────────────────────────

/// Backbone `F(x, c_noise)` of the consistency model. Output has the shape of `x`.
pub struct UNet {
    time: TimeEmbedding,
    stem: Conv2d,
    down: ResBlock,
    downsample: Conv2d,
    mid1: ResBlock,
    mid2: ResBlock,
    up_conv: Conv2d,
    up: ResBlock,
    out_norm: GroupNorm,
    out_conv: Conv2d,
    dropout_rng: Arc<Mutex<StdRng>>,
}

impl UNet {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let base = config.base_channels();
        let hidden = config.hidden_dim;
        let rng = dropout_rng(0);
        Ok(Self {
            time: TimeEmbedding::new(base, hidden, vb.pp("time"))?,
            stem: conv3x3(config.in_channels, base, 1, vb.pp("stem"))?,
            down: ResBlock::new(base, base, config, &rng, vb.pp("down"))?,
            downsample: conv3x3(base, hidden, 2, vb.pp("downsample"))?,
            mid1: ResBlock::new(hidden, hidden, config, &rng, vb.pp("mid1"))?,
            mid2: ResBlock::new(hidden, hidden, config, &rng, vb.pp("mid2"))?,
            up_conv: conv3x3(hidden, base, 1, vb.pp("up_conv"))?,
            up: ResBlock::new(2 * base, base, config, &rng, vb.pp("up"))?,
            out_norm: group_norm(config.norm_groups, base, NORM_EPS, vb.pp("out_norm"))?,
            out_conv: conv3x3(base, config.in_channels, 1, vb.pp("out_conv"))?,
            dropout_rng: rng,
        })
    }

    /// Restart the dropout mask stream so training runs repeat exactly.
    pub fn seed_dropout(&self, seed: u64) -> Result<()> {
        reseed_dropout(&self.dropout_rng, seed)
    }

    /// `x`: `(b, c, h, w)` with even `h`, `w`; `c_noise`: `(b,)`.
    pub fn forward(&self, x: &Tensor, c_noise: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let emb = self.time.forward(c_noise)?;

        let skip = self.down.forward(&self.stem.forward(x)?, &emb, train)?;
        let mid = self.downsample.forward(&skip)?;
        let mid = self.mid1.forward(&mid, &emb, train)?;
        let mid = self.mid2.forward(&mid, &emb, train)?;

        let up = self.up_conv.forward(&mid.upsample_nearest2d(h, w)?)?;
        let up = Tensor::cat(&[&up, &skip], 1)?;
        let up = self.up.forward(&up, &emb, train)?;
        self.out_conv
            .forward(&silu(&self.out_norm.forward(&up)?)?)
    }
}
