//! Noise-level boundaries and the per-epoch discretisation schedule.
//!
//! Early epochs use few, coarse noise levels; the step count `N` grows with
//! the square root of training progress up to `end_steps` in the last epoch.

/// ρ of the Karras power-law spacing.
pub const KARRAS_RHO: f64 = 7.0;
/// Smallest noise level ε.
pub const SIGMA_MIN: f64 = 0.002;
/// Largest noise level T.
pub const SIGMA_MAX: f64 = 80.0;

/// `n` noise levels from `eps` to `t_max`, evenly spaced in `1/rho`-th-root space.
///
/// Strictly increasing with `result[0] == eps` and `result[n - 1] == t_max`.
/// Panics if `n < 2`.
pub fn karras_boundaries(rho: f64, eps: f64, n: usize, t_max: f64) -> Vec<f64> {
    assert!(n >= 2, "karras_boundaries needs at least 2 levels, got {n}");
    let lo = eps.powf(1.0 / rho);
    let hi = t_max.powf(1.0 / rho);
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| (lo + i as f64 / denom * (hi - lo)).powf(rho))
        .collect()
}

/// Noise levels used during one epoch.
#[derive(Debug, Clone)]
pub struct EpochPlan {
    pub epoch: usize,
    /// Number of boundaries; also sets the EMA decay for the epoch.
    pub n: usize,
    pub boundaries: Vec<f64>,
}

impl EpochPlan {
    /// Adjacent pair `(t0, t1)` for boundary index `i` in `0..n - 1`.
    pub fn pair(&self, i: usize) -> (f64, f64) {
        (self.boundaries[i], self.boundaries[i + 1])
    }
}

/// Square-root growth of the step count plus the Karras spacing parameters.
#[derive(Debug, Clone, Copy)]
pub struct BoundarySchedule {
    pub start_steps: usize,
    pub end_steps: usize,
    pub rho: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
}

impl Default for BoundarySchedule {
    fn default() -> Self {
        Self {
            start_steps: 2,
            end_steps: 150,
            rho: KARRAS_RHO,
            sigma_min: SIGMA_MIN,
            sigma_max: SIGMA_MAX,
        }
    }
}

impl BoundarySchedule {
    /// `N(e) = ceil(sqrt(e · (s1² − s0²) / K + s0²) − 1) + 1`.
    ///
    /// Never below 2 for `epoch >= 0`; reaches `end_steps` at `epoch == total_epochs`.
    pub fn step_count(&self, epoch: usize, total_epochs: usize) -> usize {
        assert!(total_epochs > 0, "total_epochs must be positive");
        let s0 = (self.start_steps * self.start_steps) as f64;
        let s1 = (self.end_steps * self.end_steps) as f64;
        let progress = epoch as f64 * (s1 - s0) / total_epochs as f64;
        ((progress + s0).sqrt() - 1.0).ceil() as usize + 1
    }

    pub fn for_epoch(&self, epoch: usize, total_epochs: usize) -> EpochPlan {
        let n = self.step_count(epoch, total_epochs);
        EpochPlan {
            epoch,
            n,
            boundaries: karras_boundaries(self.rho, self.sigma_min, n, self.sigma_max),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_count_grows_monotonically() {
        let sched = BoundarySchedule::default();
        for total in [1, 3, 10, 100] {
            let mut prev = 0;
            for epoch in 1..=total {
                let n = sched.step_count(epoch, total);
                assert!(n >= 2, "N({epoch}/{total}) = {n}");
                assert!(n >= prev, "N decreased at epoch {epoch}/{total}");
                prev = n;
            }
        }
    }

    #[test]
    fn step_count_endpoints() {
        let sched = BoundarySchedule::default();
        assert_eq!(sched.step_count(0, 10), 2);
        assert_eq!(sched.step_count(10, 10), 150);
        // sqrt(22496 / 10 + 4) = 47.47 → ceil(46.47) + 1
        assert_eq!(sched.step_count(1, 10), 48);
    }

    #[test]
    fn boundaries_shape_and_endpoints() {
        for n in [2, 3, 18, 150] {
            let b = karras_boundaries(KARRAS_RHO, SIGMA_MIN, n, SIGMA_MAX);
            assert_eq!(b.len(), n);
            assert!((b[0] - SIGMA_MIN).abs() < 1e-9);
            assert!((b[n - 1] - SIGMA_MAX).abs() < 1e-9);
            assert!(b.windows(2).all(|w| w[0] < w[1]), "not increasing for n={n}");
        }
    }

    #[test]
    #[should_panic(expected = "at least 2")]
    fn boundaries_reject_single_level() {
        karras_boundaries(KARRAS_RHO, SIGMA_MIN, 1, SIGMA_MAX);
    }

    #[test]
    fn plan_pairs_are_adjacent() {
        let plan = BoundarySchedule::default().for_epoch(3, 10);
        assert_eq!(plan.boundaries.len(), plan.n);
        let (t0, t1) = plan.pair(plan.n - 2);
        assert!(t0 < t1);
        assert!((t1 - SIGMA_MAX).abs() < 1e-9);
    }
}
