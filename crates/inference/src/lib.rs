//! # ct-infer — Sampling Runtime
//!
//! * **[`SampleSchedule`]** — validated, decreasing noise levels (`80,40,20,10,5`).
//! * **[`SamplingRuntime`]** — load trained weights + config, generate image grids.

pub mod runtime;
pub mod sampler;

pub use runtime::SamplingRuntime;
pub use sampler::SampleSchedule;
