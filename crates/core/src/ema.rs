//! Exponential-moving-average target network.
//!
//! The shadow network has its own [`VarMap`], initialised as a copy of the
//! live parameters. Its variables are never handed to the optimiser and its
//! outputs are detached, so [`Ema::update`] is the only thing that moves them.

use candle_core::{DType, Device, Result};
use candle_nn::{VarBuilder, VarMap};

use ct_common::ModelConfig;

use crate::model::ConsistencyModel;
use crate::noise::lock_vars;

/// Shadow copy of a [`ConsistencyModel`], decayed toward the live weights.
pub struct Ema {
    varmap: VarMap,
    model: ConsistencyModel,
}

impl Ema {
    /// Build a second network with the same layout and copy `live` into it.
    pub fn new(live: &VarMap, config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = ConsistencyModel::new(config, vb)?;
        copy_vars(live, &varmap)?;
        Ok(Self { varmap, model })
    }

    /// `μ(N) = exp(2 · ln 0.95 / N)`. Approaches 1 as `N` grows.
    pub fn decay(n: usize) -> f64 {
        (2.0 * 0.95f64.ln() / n as f64).exp()
    }

    /// `shadow ← μ(N) · shadow + (1 − μ(N)) · live` for every parameter.
    pub fn update(&self, live: &VarMap, n: usize) -> Result<()> {
        ema_update(&self.varmap, live, Self::decay(n))
    }

    /// The shadow network, for inference only.
    pub fn model(&self) -> &ConsistencyModel {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

/// Blend `live` into `shadow` in place with decay `mu`. Both maps must hold
/// the same variable names and shapes.
pub fn ema_update(shadow: &VarMap, live: &VarMap, mu: f64) -> Result<()> {
    let live = lock_vars(live)?;
    let shadow = lock_vars(shadow)?;
    if live.len() != shadow.len() {
        candle_core::bail!(
            "EMA parameter count mismatch: {} live vs {} shadow",
            live.len(),
            shadow.len()
        );
    }
    for (name, live_var) in live.iter() {
        let Some(shadow_var) = shadow.get(name) else {
            candle_core::bail!("EMA has no parameter named '{name}'");
        };
        let blended = (shadow_var.as_tensor().affine(mu, 0.0)?
            + live_var.as_tensor().detach().affine(1.0 - mu, 0.0)?)?;
        shadow_var.set(&blended)?;
    }
    Ok(())
}

/// Copy every value of `src` into the same-named variable of `dst`.
pub fn copy_vars(src: &VarMap, dst: &VarMap) -> Result<()> {
    let src = lock_vars(src)?;
    let dst = lock_vars(dst)?;
    for (name, dst_var) in dst.iter() {
        let Some(src_var) = src.get(name) else {
            candle_core::bail!("source has no parameter named '{name}'");
        };
        dst_var.set(src_var.as_tensor())?;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use candle_nn::Init;

    fn scalar_map(name: &str, value: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(1, name, Init::Const(value)).unwrap();
        varmap
    }

    fn value(varmap: &VarMap, name: &str) -> f32 {
        varmap.data().lock().unwrap()[name].as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn decay_for_single_step() {
        assert!((Ema::decay(1) - 0.9025).abs() < 1e-12);
    }

    #[test]
    fn decay_slows_as_n_grows() {
        let mus: Vec<f64> = [2, 10, 50, 150].iter().map(|&n| Ema::decay(n)).collect();
        assert!(mus.windows(2).all(|w| w[0] < w[1]));
        assert!(mus.iter().all(|&m| m < 1.0));
    }

    #[test]
    fn single_update_blends_toward_live() {
        let shadow = scalar_map("w", 0.0);
        let live = scalar_map("w", 1.0);
        ema_update(&shadow, &live, Ema::decay(1)).unwrap();
        assert!((value(&shadow, "w") - 0.0975).abs() < 1e-6);
        assert_eq!(value(&live, "w"), 1.0);
    }

    #[test]
    fn equal_parameters_do_not_move() {
        let shadow = scalar_map("w", 0.25);
        let live = scalar_map("w", 0.25);
        for n in [1, 7, 150] {
            ema_update(&shadow, &live, Ema::decay(n)).unwrap();
        }
        assert!((value(&shadow, "w") - 0.25).abs() < 1e-7);
    }

    #[test]
    fn mismatched_names_are_rejected() {
        let shadow = scalar_map("a", 0.0);
        let live = scalar_map("b", 1.0);
        assert!(ema_update(&shadow, &live, 0.5).is_err());
    }

    #[test]
    fn copy_makes_an_independent_buffer() {
        let src = scalar_map("w", 3.0);
        let dst = scalar_map("w", 0.0);
        copy_vars(&src, &dst).unwrap();
        assert_eq!(value(&dst, "w"), 3.0);

        let bumped = Tensor::new(&[5f32], &Device::Cpu).unwrap();
        src.data().lock().unwrap()["w"].set(&bumped).unwrap();
        assert_eq!(value(&dst, "w"), 3.0);
    }
}
