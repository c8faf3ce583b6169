//! Per-epoch cosine learning-rate schedule.

// ── Cosine LR ───────────────────────────────────────────────────────────────

/// Cosine decay from `lr` to `lr_min` over `num_epochs` epochs.
///
/// ```text
/// lr(t) = lr_min + ½·(lr − lr_min)·(1 + cos(π · min(t, T−1) / (T−1)))
/// ```
///
/// The schedule is non-increasing and sits at `lr_min` from `t = T − 1` on.
#[derive(Debug, Clone)]
pub struct CosineLr {
    epoch: usize,
    lr: f64,
    lr_min: f64,
    num_epochs: usize,
}

impl CosineLr {
    pub fn new(lr: f64, lr_min: f64, num_epochs: usize) -> Self {
        Self {
            epoch: 0,
            lr,
            lr_min,
            num_epochs,
        }
    }

    /// Learning rate at epoch `t`.
    pub fn lr_at(&self, t: usize) -> f64 {
        // A single-epoch run never decays.
        if self.num_epochs <= 1 {
            return self.lr;
        }
        let span = (self.num_epochs - 1) as f64;
        let progress = t.min(self.num_epochs - 1) as f64 / span;
        let cos = (std::f64::consts::PI * progress).cos();
        self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    pub fn advance(&mut self) {
        self.epoch += 1;
    }

    /// Jump to `epoch`, e.g. when resuming a run.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_base_lr() {
        let sched = CosineLr::new(1e-2, 1e-6, 100);
        assert!((sched.current_lr() - 1e-2).abs() < 1e-12);
    }

    #[test]
    fn non_increasing_and_floors_at_last_epoch() {
        let sched = CosineLr::new(1e-2, 1e-6, 100);
        for t in 1..150 {
            assert!(sched.lr_at(t) <= sched.lr_at(t - 1) + 1e-15, "t={t}");
        }
        assert!((sched.lr_at(99) - 1e-6).abs() < 1e-12);
        assert!((sched.lr_at(140) - 1e-6).abs() < 1e-12);
    }

    #[test]
    fn midpoint_is_halfway() {
        let mut sched = CosineLr::new(1.0, 0.0, 101);
        sched.set_epoch(50);
        assert!((sched.current_lr() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn advance_moves_one_epoch() {
        let mut sched = CosineLr::new(1e-2, 1e-6, 10);
        let before = sched.current_lr();
        sched.advance();
        assert_eq!(sched.epoch(), 1);
        assert!(sched.current_lr() < before);
    }

    #[test]
    fn single_epoch_keeps_base_lr() {
        let sched = CosineLr::new(1e-3, 0.0, 1);
        assert_eq!(sched.lr_at(0), 1e-3);
        assert_eq!(sched.lr_at(5), 1e-3);
    }
}
