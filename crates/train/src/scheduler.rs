//! Learning-rate schedule, advanced once per superbatch.

use anyhow::bail;

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Learning rate schedule: warmup → cosine / linear / constant decay.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    decay: LrDecay,
}

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Cosine,
    Linear,
    None,
}

impl LrDecay {
    /// Parse a scheduler name (`linear`, `cosine`, `constant`,
    /// `constant_with_warmup`).
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "constant" | "constant_with_warmup" => Ok(Self::None),
            other => bail!("unknown scheduler {other:?}"),
        }
    }
}

impl LrScheduler {
    pub fn new(
        lr: f64,
        lr_min: f64,
        warmup_steps: usize,
        max_steps: usize,
        decay: LrDecay,
    ) -> Self {
        Self {
            step: 0,
            lr,
            lr_min,
            warmup_steps,
            max_steps,
            decay,
        }
    }

    /// Build from the run configuration. Decays to zero over `max_steps`;
    /// plain `constant` ignores the warmup.
    pub fn from_name(
        name: &str,
        lr: f64,
        warmup_steps: usize,
        max_steps: usize,
    ) -> anyhow::Result<Self> {
        let decay = LrDecay::from_name(name)?;
        let warmup_steps = if name == "constant" { 0 } else { warmup_steps };
        Ok(Self::new(lr, 0.0, warmup_steps, max_steps, decay))
    }

    /// Current learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let step = self.step;

        // Warmup phase: linear ramp from 0 to lr.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.lr * (step as f64 + 1.0) / self.warmup_steps as f64;
        }

        // No decay or no max_steps → constant lr.
        if self.max_steps == 0 || self.decay == LrDecay::None {
            return self.lr;
        }

        let step = step.min(self.max_steps);
        if step <= self.warmup_steps {
            return self.lr;
        }

        let decay_steps = (self.max_steps - self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;

        match self.decay {
            LrDecay::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
            LrDecay::Linear => self.lr - (self.lr - self.lr_min) * progress,
            LrDecay::None => self.lr,
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Number of times the schedule has been advanced.
    pub fn step(&self) -> usize {
        self.step
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
