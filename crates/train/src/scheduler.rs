//! One-cycle learning-rate and momentum schedule.

use std::f64::consts::PI;

// ── One-cycle ───────────────────────────────────────────────────────────────

/// Learning rate ramps from `max_lr / div_factor` up to `max_lr` over the
/// first `pct_start` of training, then anneals down to
/// `max_lr / (div_factor · final_div_factor)`; both legs follow a cosine.
/// AdamW's β1 moves the opposite way, between `max_beta1` and `base_beta1`.
#[derive(Clone, Debug)]
pub struct OneCycleLr {
    step: usize,
    total_steps: usize,
    max_lr: f64,
    pct_start: f64,
    div_factor: f64,
    final_div_factor: f64,
    base_beta1: f64,
    max_beta1: f64,
}

/// Cosine interpolation from `start` (pct = 0) to `end` (pct = 1).
fn anneal_cos(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}

impl OneCycleLr {
    /// Schedule over `total_steps` optimiser steps with the usual defaults
    /// (`pct_start` 0.3, `div_factor` 25, `final_div_factor` 1e4, β1 0.85–0.95).
    pub fn new(max_lr: f64, total_steps: usize) -> Self {
        Self {
            step: 0,
            total_steps,
            max_lr,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
            base_beta1: 0.85,
            max_beta1: 0.95,
        }
    }

    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.div_factor
    }

    pub fn min_lr(&self) -> f64 {
        self.initial_lr() / self.final_div_factor
    }

    /// Position in the current leg: `(leg, pct)` where leg 0 is warm-up.
    fn phase(&self) -> (usize, f64) {
        let last = self.total_steps.saturating_sub(1) as f64;
        let warmup_end = self.pct_start * self.total_steps as f64 - 1.0;
        let step = (self.step as f64).min(last);
        if step <= warmup_end && warmup_end > 0.0 {
            (0, step / warmup_end)
        } else {
            let span = last - warmup_end.max(0.0);
            let pct = if span > 0.0 {
                (step - warmup_end.max(0.0)) / span
            } else {
                1.0
            };
            (1, pct)
        }
    }

    /// Learning rate for the current step.
    pub fn current_lr(&self) -> f64 {
        match self.phase() {
            (0, pct) => anneal_cos(self.initial_lr(), self.max_lr, pct),
            (_, pct) => anneal_cos(self.max_lr, self.min_lr(), pct),
        }
    }

    /// AdamW β1 for the current step.
    pub fn current_beta1(&self) -> f64 {
        match self.phase() {
            (0, pct) => anneal_cos(self.max_beta1, self.base_beta1, pct),
            (_, pct) => anneal_cos(self.base_beta1, self.max_beta1, pct),
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn advanced(mut sched: OneCycleLr, steps: usize) -> OneCycleLr {
        for _ in 0..steps {
            sched.advance();
        }
        sched
    }

    #[test]
    fn starts_at_max_over_div_factor() {
        let sched = OneCycleLr::new(1e-3, 1000);
        assert!((sched.current_lr() - 4e-5).abs() < 1e-12);
        assert!((sched.current_beta1() - 0.95).abs() < 1e-12);
    }

    #[test]
    fn peaks_at_end_of_warmup() {
        // warm-up ends at step 0.3 · 1000 − 1 = 299
        let sched = advanced(OneCycleLr::new(1e-3, 1000), 299);
        assert!((sched.current_lr() - 1e-3).abs() < 1e-12);
        assert!((sched.current_beta1() - 0.85).abs() < 1e-12);
    }

    #[test]
    fn ends_at_min_lr() {
        let sched = advanced(OneCycleLr::new(1e-3, 1000), 999);
        assert!((sched.current_lr() - 4e-9).abs() < 1e-15);
        assert!((sched.current_beta1() - 0.95).abs() < 1e-12);
        // Past the end the schedule holds its final value.
        let past = advanced(sched.clone(), 10);
        assert_eq!(past.current_lr(), sched.current_lr());
    }

    #[test]
    fn rises_then_falls() {
        let mut sched = OneCycleLr::new(1e-2, 200);
        let mut lrs = Vec::new();
        for _ in 0..200 {
            lrs.push(sched.current_lr());
            sched.advance();
        }
        let peak = lrs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 59);
        assert!(lrs[..=peak].windows(2).all(|w| w[0] <= w[1]));
        assert!(lrs[peak..].windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn zero_max_lr_stays_zero() {
        let sched = advanced(OneCycleLr::new(0.0, 50), 20);
        assert_eq!(sched.current_lr(), 0.0);
    }

    #[test]
    fn single_step_schedule() {
        let sched = OneCycleLr::new(1e-3, 1);
        assert!(sched.current_lr().is_finite());
    }
}
