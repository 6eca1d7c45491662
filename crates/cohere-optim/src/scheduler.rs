//! Learning-rate schedulers, stepped once per epoch.
//!
//! The driver reports each epoch's normalized loss to the scheduler and
//! hands the returned rate to the optimizer through
//! [`Optimizer::set_learning_rate`](crate::optimizer::Optimizer::set_learning_rate).

/// Epoch-level learning-rate policy.
pub trait LrScheduler: Send {
    /// Record the loss of the epoch that just finished and return the
    /// learning rate for the next one.
    fn step(&mut self, metric: f64) -> f64;

    fn current_lr(&self) -> f64;

    /// Number of epochs seen so far.
    fn current_step(&self) -> u64;
}

/// Reduce the learning rate once the loss stops improving.
///
/// An epoch counts as an improvement when its loss falls below
/// `best * (1 - threshold)`. After more than `patience` epochs without one,
/// the rate is multiplied by `factor`, never going below `min_lr`.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    threshold: f64,
    best: f64,
    num_bad_epochs: usize,
    step_count: u64,
}

impl ReduceLrOnPlateau {
    /// Defaults: factor 0.2, patience 10, relative threshold 1e-9, no floor.
    pub fn new(initial_lr: f64) -> Self {
        Self {
            lr: initial_lr,
            factor: 0.2,
            patience: 10,
            min_lr: 0.0,
            threshold: 1e-9,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            step_count: 0,
        }
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Relative improvement required to reset the patience counter.
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

impl LrScheduler for ReduceLrOnPlateau {
    fn step(&mut self, metric: f64) -> f64 {
        self.step_count += 1;
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            if self.lr - reduced > 1e-8 {
                log::info!("Reducing learning rate from {:.4e} to {:.4e}", self.lr, reduced);
                self.lr = reduced;
            }
            self.num_bad_epochs = 0;
        }
        self.lr
    }

    fn current_lr(&self) -> f64 {
        self.lr
    }

    fn current_step(&self) -> u64 {
        self.step_count
    }
}

/// Multiply the learning rate by `gamma` after every epoch.
#[derive(Debug, Clone)]
pub struct ExponentialLr {
    initial_lr: f64,
    gamma: f64,
    step_count: u64,
}

impl ExponentialLr {
    pub fn new(initial_lr: f64, gamma: f64) -> Self {
        Self {
            initial_lr,
            gamma,
            step_count: 0,
        }
    }
}

impl LrScheduler for ExponentialLr {
    fn step(&mut self, _metric: f64) -> f64 {
        self.step_count += 1;
        self.current_lr()
    }

    fn current_lr(&self) -> f64 {
        self.initial_lr * self.gamma.powi(self.step_count as i32)
    }

    fn current_step(&self) -> u64 {
        self.step_count
    }
}
