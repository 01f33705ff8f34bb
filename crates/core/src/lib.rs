//! # ct-core — Consistency Model Engine
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`boundaries`] | Karras noise levels, per-epoch step count `N` |
//! | [`unet`] | Time-conditioned convolutional backbone |
//! | [`model`] | `ConsistencyModel`: boundary-conditioned forward, loss, multistep sampling |
//! | [`ema`] | EMA target network and its decay rule |
//! | [`noise`] | Seeded Gaussian noise and parameter re-initialisation |
//!
//! Everything goes through `candle-core`/`candle-nn`, so the same code runs
//! on CPU, CUDA and Metal.

pub mod boundaries;
pub mod ema;
pub mod model;
pub mod noise;
pub mod unet;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use boundaries::{karras_boundaries, BoundarySchedule, EpochPlan, SIGMA_MAX, SIGMA_MIN};
pub use ema::Ema;
pub use model::ConsistencyModel;
pub use noise::{randn, randn_like, reseed_vars, SeededDropout};
pub use unet::UNet;
