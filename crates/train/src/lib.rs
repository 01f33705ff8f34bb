//! # ct-train — Consistency Training
//!
//! Optimisation loop and run bookkeeping:
//!
//! * **[`Trainer`]** — owns live model + EMA + optimiser + schedules. One call
//!   to [`Trainer::step`] draws noise and boundary pairs, computes the
//!   consistency loss, runs AdamW, advances the schedule and updates the EMA.
//! * **[`OneCycleLr`]** — one-cycle learning rate with cycled AdamW β1.
//! * **[`RunTracker`]** — local experiment tracking (metrics, galleries, artifacts).
//! * **[`run::train`]** — the epoch loop with per-epoch sample grids and checkpoints.

pub mod run;
pub mod scheduler;
pub mod tracker;
pub mod trainer;

pub use scheduler::OneCycleLr;
pub use tracker::RunTracker;
pub use trainer::{StepMetrics, Trainer, TrainerConfig};
