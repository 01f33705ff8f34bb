//! Seeded randomness for noise tensors, parameter initialisation and dropout.
//!
//! Candle's CPU backend draws from a thread-local RNG that cannot be seeded,
//! so everything that must be reproducible is drawn here from a caller-owned
//! `StdRng` and uploaded to the target device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Device, Result, Shape, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Standard-normal tensor of `shape` on `device`.
pub fn randn<S: Into<Shape>>(shape: S, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Tensor::from_vec(values, shape, device)
}

/// Standard-normal tensor with the shape and device of `like`.
pub fn randn_like(like: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    randn(like.shape().clone(), rng, like.device())
}

/// Redraw every parameter of `varmap` from `rng`, keeping each tensor's
/// initial mean and standard deviation.
///
/// Constant initialisations (norm scales, zero biases) stay constant; random
/// ones are replaced by a uniform draw with matching moments. Variables are
/// visited in name order so the result depends only on the seed.
pub fn reseed_vars(varmap: &VarMap, rng: &mut StdRng) -> Result<()> {
    let data = lock_vars(varmap)?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        let t = var.as_tensor();
        let n = t.elem_count();
        let mean = t.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        let std = if n > 1 {
            t.broadcast_sub(&t.mean_all()?)?
                .sqr()?
                .mean_all()?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?
                .sqrt()
        } else {
            0.0
        };
        if std == 0.0 {
            continue;
        }
        // Uniform on [-√3σ, √3σ] has standard deviation σ.
        let bound = 3f32.sqrt() * std;
        let values: Vec<f32> = (0..n)
            .map(|_| mean + rng.gen_range(-bound..bound))
            .collect();
        let fresh = Tensor::from_vec(values, t.shape().clone(), t.device())?.to_dtype(t.dtype())?;
        var.set(&fresh)?;
    }
    Ok(())
}

// ── Dropout ─────────────────────────────────────────────────────────────────

/// Dropout drawing its masks from a shared, re-seedable `StdRng`.
#[derive(Clone)]
pub struct SeededDropout {
    p: f32,
    rng: Arc<Mutex<StdRng>>,
}

impl SeededDropout {
    pub fn new(p: f32, rng: Arc<Mutex<StdRng>>) -> Self {
        Self { p, rng }
    }

    /// Identity unless `train` is set and `p > 0`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.p <= 0.0 {
            return Ok(x.clone());
        }
        if self.p >= 1.0 {
            return x.zeros_like();
        }
        let keep = 1.0 / (1.0 - self.p);
        let mut rng = self
            .rng
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("dropout rng lock poisoned: {e}")))?;
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if rng.gen::<f32>() < self.p { 0.0 } else { keep })
            .collect();
        let mask = Tensor::from_vec(mask, x.shape().clone(), x.device())?.to_dtype(x.dtype())?;
        x * mask
    }
}

/// Fresh shared dropout RNG.
pub fn dropout_rng(seed: u64) -> Arc<Mutex<StdRng>> {
    Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))
}

/// Restart a shared dropout RNG from `seed`.
pub fn reseed_dropout(rng: &Mutex<StdRng>, seed: u64) -> Result<()> {
    let mut rng = rng
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("dropout rng lock poisoned: {e}")))?;
    *rng = StdRng::seed_from_u64(seed);
    Ok(())
}

pub(crate) fn lock_vars(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("variable map lock poisoned: {e}")))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn randn_is_reproducible() {
        let a = randn((2, 3), &mut StdRng::seed_from_u64(1), &Device::Cpu).unwrap();
        let b = randn((2, 3), &mut StdRng::seed_from_u64(1), &Device::Cpu).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn randn_moments() {
        let t = randn(10_000, &mut StdRng::seed_from_u64(2), &Device::Cpu).unwrap();
        let mean = t.mean_all().unwrap().to_scalar::<f32>().unwrap();
        let var = t.sqr().unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }

    fn build(varmap: &VarMap) {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((64, 64), "w", Init::Randn { mean: 0.0, stdev: 0.2 })
            .unwrap();
        vb.get_with_hints(64, "scale", Init::Const(1.0)).unwrap();
    }

    #[test]
    fn reseed_matches_across_varmaps() {
        let (a, b) = (VarMap::new(), VarMap::new());
        build(&a);
        build(&b);
        reseed_vars(&a, &mut StdRng::seed_from_u64(9)).unwrap();
        reseed_vars(&b, &mut StdRng::seed_from_u64(9)).unwrap();

        let get = |m: &VarMap, k: &str| -> Vec<f32> {
            m.data().lock().unwrap()[k].as_tensor().flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_eq!(get(&a, "w"), get(&b, "w"));
        assert!(get(&a, "scale").iter().all(|&v| v == 1.0));

        let w = get(&a, "w");
        let var: f32 = w.iter().map(|v| v * v).sum::<f32>() / w.len() as f32;
        assert!((var.sqrt() - 0.2).abs() < 0.02, "std {}", var.sqrt());
    }

    #[test]
    fn dropout_is_identity_in_eval() {
        let x = Tensor::ones((4, 4), DType::F32, &Device::Cpu).unwrap();
        let drop = SeededDropout::new(0.5, dropout_rng(0));
        let y: Vec<f32> = drop.forward(&x, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn dropout_masks_follow_the_seed() {
        let x = Tensor::ones(256, DType::F32, &Device::Cpu).unwrap();
        let rng = dropout_rng(3);
        let drop = SeededDropout::new(0.25, rng.clone());
        let first: Vec<f32> = drop.forward(&x, true).unwrap().to_vec1().unwrap();
        reseed_dropout(&rng, 3).unwrap();
        let again: Vec<f32> = drop.forward(&x, true).unwrap().to_vec1().unwrap();
        assert_eq!(first, again);
        assert!(first.iter().all(|&v| v == 0.0 || (v - 1.0 / 0.75).abs() < 1e-6));
        assert!(first.iter().any(|&v| v == 0.0));
    }
}
