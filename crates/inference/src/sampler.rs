//! Noise-level schedules for few-step sampling.

use std::str::FromStr;

/// Decreasing noise levels; the first one also scales the initial noise.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSchedule {
    levels: Vec<f64>,
}

impl SampleSchedule {
    /// `[80, 40, 20, 10, 5]`
    pub fn five_step() -> Self {
        Self {
            levels: vec![80.0, 40.0, 20.0, 10.0, 5.0],
        }
    }

    /// `[80, 2]`
    pub fn two_step() -> Self {
        Self {
            levels: vec![80.0, 2.0],
        }
    }

    /// Non-empty, finite and strictly decreasing, all above `sigma_min`.
    pub fn new(levels: Vec<f64>, sigma_min: f64) -> anyhow::Result<Self> {
        if levels.is_empty() {
            anyhow::bail!("a sample schedule needs at least one noise level");
        }
        if let Some(bad) = levels.iter().find(|&&t| !t.is_finite() || t < sigma_min) {
            anyhow::bail!("noise level {bad} is below sigma_min {sigma_min} or not finite");
        }
        if levels.windows(2).any(|w| w[1] >= w[0]) {
            anyhow::bail!("noise levels must be strictly decreasing: {levels:?}");
        }
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl FromStr for SampleSchedule {
    type Err = anyhow::Error;

    /// Comma-separated levels such as `80,40,20,10,5`.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let levels = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|e| anyhow::anyhow!("bad noise level '{part}': {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Self::new(levels, ct_core::SIGMA_MIN)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
