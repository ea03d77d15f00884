//! Epoch-based learning rate schedule.

// ── MultiStep Scheduler ─────────────────────────────────────────────────────

/// Step decay: the learning rate is multiplied by `gamma` at every milestone
/// epoch reached so far.
///
/// The state is the number of epochs completed. A scheduler for a run
/// starting at `start_epoch` is built with `last_epoch = start_epoch - 1` and
/// stepped once, so it sits on `start_epoch` exactly as a scheduler that was
/// stepped through every earlier epoch would.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    milestones: Vec<usize>,
    gamma: f64,
    last_epoch: i64,
}

impl MultiStepLr {
    pub fn new(mut milestones: Vec<usize>, gamma: f64, start_epoch: usize) -> Self {
        milestones.sort_unstable();
        let mut sched = Self {
            milestones,
            gamma,
            last_epoch: start_epoch as i64 - 1,
        };
        sched.advance();
        sched
    }

    /// One epoch boundary.
    pub fn advance(&mut self) {
        self.last_epoch += 1;
    }

    /// Epoch the schedule currently applies to.
    pub fn epoch(&self) -> usize {
        self.last_epoch.max(0) as usize
    }

    /// Milestones reached so far.
    pub fn decay_count(&self) -> usize {
        self.milestones
            .iter()
            .take_while(|&&m| (m as i64) <= self.last_epoch)
            .count()
    }

    /// `gamma ^ decay_count`.
    pub fn multiplier(&self) -> f64 {
        self.gamma.powi(self.decay_count() as i32)
    }

    pub fn lr(&self, base_lr: f64) -> f64 {
        base_lr * self.multiplier()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
