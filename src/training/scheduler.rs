//! Learning Rate Scheduler Module
//!
//! Per-step schedules with an optional linear warmup. The learning rate for
//! step `s` (0-indexed) is the rate used by the `s`-th optimizer update.

use std::f64::consts::PI;

use crate::training::options::SchedulerKind;

#[derive(Debug, Clone)]
pub struct LrSchedule {
    kind: SchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrSchedule {
    pub fn new(kind: SchedulerKind, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps,
        }
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    /// Learning rate for the given optimizer step
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        // A single post-warmup step has nothing to decay over
        if decay_steps <= 1 {
            return self.base_lr;
        }

        // 0 at the first post-warmup step, 1 at the last step
        let progress = ((step - self.warmup_steps) as f64 / (decay_steps - 1) as f64).min(1.0);

        match self.kind {
            SchedulerKind::Constant => self.base_lr,
            SchedulerKind::Linear => self.base_lr * (1.0 - progress),
            SchedulerKind::Cosine => self.base_lr * 0.5 * (1.0 + (PI * progress).cos()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let schedule = LrSchedule::new(SchedulerKind::Constant, 0.001, 0, 100);
        assert_eq!(schedule.lr_at(0), 0.001);
        assert_eq!(schedule.lr_at(50), 0.001);
        assert_eq!(schedule.lr_at(99), 0.001);
    }

    #[test]
    fn test_linear_decays_to_zero() {
        let schedule = LrSchedule::new(SchedulerKind::Linear, 0.1, 0, 11);
        assert!((schedule.lr_at(0) - 0.1).abs() < 1e-12);
        assert!((schedule.lr_at(5) - 0.05).abs() < 1e-12);
        assert_eq!(schedule.lr_at(10), 0.0);

        let mut previous = f64::INFINITY;
        for step in 0..11 {
            let lr = schedule.lr_at(step);
            assert!(lr <= previous);
            previous = lr;
        }
    }

    #[test]
    fn test_linear_warmup() {
        let schedule = LrSchedule::new(SchedulerKind::Linear, 0.1, 4, 20);
        assert!((schedule.lr_at(0) - 0.025).abs() < 1e-12);
        assert!((schedule.lr_at(1) - 0.05).abs() < 1e-12);
        assert!((schedule.lr_at(3) - 0.1).abs() < 1e-12);
        assert!((schedule.lr_at(4) - 0.1).abs() < 1e-12);
        assert_eq!(schedule.lr_at(19), 0.0);
    }

    #[test]
    fn test_cosine_scheduler() {
        let schedule = LrSchedule::new(SchedulerKind::Cosine, 0.1, 0, 101);
        assert!((schedule.lr_at(0) - 0.1).abs() < 1e-12);
        assert!((schedule.lr_at(50) - 0.05).abs() < 1e-9);
        assert!(schedule.lr_at(100).abs() < 1e-12);
    }

    #[test]
    fn test_single_step_run_keeps_base_lr() {
        let schedule = LrSchedule::new(SchedulerKind::Linear, 0.01, 0, 1);
        assert_eq!(schedule.lr_at(0), 0.01);
    }
}
