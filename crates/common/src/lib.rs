//! # ct-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`TrainConfig`]** / **[`ModelConfig`]** — run options and network hyper-parameters.
//! * **[`ImageDataset`]** / **[`prefetch`]** — dataset loading, shuffling, batching.
//! * **[`grid`]** — rescale samples, tile them into a grid, write PNGs.

pub mod config;
pub mod data;
pub mod grid;

pub use config::{DatasetKind, DeviceChoice, ModelConfig, TrainConfig};
pub use data::{prefetch, ImageDataset};
pub use grid::{make_grid, save_image, save_sample_grid, to_unit_range};
