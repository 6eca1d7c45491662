//! Serializable optimizer and reconstruction settings.
//!
//! Defaults follow the conventional choices for each method: Adam on small
//! shuffled minibatches, L-BFGS on the full dataset, and SGD one pattern at a
//! time unless a batch size is given.

use cohere_data::Selection;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::lbfgs::Lbfgs;
use crate::optimizer::{OptimizeError, Optimizer};
use crate::scheduler::{ExponentialLr, LrScheduler, ReduceLrOnPlateau};
use crate::sgd::Sgd;

/// How the dataset is split into minibatches each epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batching {
    /// Patterns per optimizer step; `None` uses the whole dataset.
    pub batch_size: Option<usize>,
    /// Reshuffle the pattern order every epoch.
    pub shuffle: bool,
}

impl Batching {
    pub fn full() -> Self {
        Self {
            batch_size: None,
            shuffle: false,
        }
    }

    pub fn minibatch(batch_size: usize, shuffle: bool) -> Self {
        Self {
            batch_size: Some(batch_size),
            shuffle,
        }
    }
}

/// Adam settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    #[serde(default = "default_adam_lr")]
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub amsgrad: bool,
    #[serde(default = "default_adam_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Attach a plateau scheduler with default settings when no other
    /// scheduler is configured.
    #[serde(default)]
    pub schedule: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: default_adam_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
            amsgrad: false,
            batch_size: default_adam_batch_size(),
            shuffle: true,
            schedule: false,
        }
    }
}

/// L-BFGS settings. Runs on the full dataset with no line search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbfgsConfig {
    #[serde(default = "default_lbfgs_lr")]
    pub lr: f64,
    /// Inner iterations per optimizer step.
    #[serde(default = "default_lbfgs_max_iter")]
    pub max_iter: usize,
    /// Function evaluations allowed per step, `max_iter * 5 / 4` if unset.
    #[serde(default)]
    pub max_eval: Option<usize>,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_tolerance_grad")]
    pub tolerance_grad: f64,
    #[serde(default = "default_tolerance_change")]
    pub tolerance_change: f64,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            lr: default_lbfgs_lr(),
            max_iter: default_lbfgs_max_iter(),
            max_eval: None,
            history_size: default_history_size(),
            tolerance_grad: default_tolerance_grad(),
            tolerance_change: default_tolerance_change(),
        }
    }
}

/// Stochastic gradient descent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    #[serde(default = "default_sgd_lr")]
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub dampening: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub nesterov: bool,
    /// Patterns per step. Unset means one pattern at a time in dataset
    /// order; a value turns on shuffling.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: default_sgd_lr(),
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            batch_size: None,
        }
    }
}

/// Optimizer selection, tagged by `method` in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam(AdamConfig),
    Lbfgs(LbfgsConfig),
    Sgd(SgdConfig),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam(AdamConfig::default())
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Result<Box<dyn Optimizer>, OptimizeError> {
        let optimizer: Box<dyn Optimizer> = match self {
            OptimizerConfig::Adam(c) => Box::new(Adam::new(c)?),
            OptimizerConfig::Lbfgs(c) => Box::new(Lbfgs::new(c)?),
            OptimizerConfig::Sgd(c) => Box::new(Sgd::new(c)?),
        };
        Ok(optimizer)
    }

    pub fn batching(&self) -> Batching {
        match self {
            OptimizerConfig::Adam(c) => Batching::minibatch(c.batch_size, c.shuffle),
            OptimizerConfig::Lbfgs(_) => Batching::full(),
            OptimizerConfig::Sgd(c) => match c.batch_size {
                Some(size) => Batching::minibatch(size, true),
                None => Batching::minibatch(1, false),
            },
        }
    }

    /// Scheduler implied by the optimizer settings themselves.
    pub fn implied_scheduler(&self) -> Option<SchedulerConfig> {
        match self {
            OptimizerConfig::Adam(c) if c.schedule => Some(SchedulerConfig::default()),
            _ => None,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerConfig::Adam(c) => c.lr,
            OptimizerConfig::Lbfgs(c) => c.lr,
            OptimizerConfig::Sgd(c) => c.lr,
        }
    }
}

/// Learning-rate schedule, stepped once per epoch on the epoch loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerConfig {
    Plateau {
        #[serde(default = "default_plateau_factor")]
        factor: f64,
        #[serde(default = "default_plateau_patience")]
        patience: usize,
        #[serde(default = "default_plateau_threshold")]
        threshold: f64,
        #[serde(default)]
        min_lr: f64,
    },
    Exponential {
        gamma: f64,
    },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Plateau {
            factor: default_plateau_factor(),
            patience: default_plateau_patience(),
            threshold: default_plateau_threshold(),
            min_lr: 0.0,
        }
    }
}

impl SchedulerConfig {
    pub fn build(&self, initial_lr: f64) -> Result<Box<dyn LrScheduler>, OptimizeError> {
        let scheduler: Box<dyn LrScheduler> = match *self {
            SchedulerConfig::Plateau {
                factor,
                patience,
                threshold,
                min_lr,
            } => {
                if !(0.0..1.0).contains(&factor) {
                    return Err(OptimizeError::Config(format!(
                        "plateau factor must lie in [0, 1), got {factor}"
                    )));
                }
                Box::new(
                    ReduceLrOnPlateau::new(initial_lr)
                        .factor(factor)
                        .patience(patience)
                        .threshold(threshold)
                        .min_lr(min_lr),
                )
            }
            SchedulerConfig::Exponential { gamma } => {
                if gamma <= 0.0 {
                    return Err(OptimizeError::Config(format!(
                        "exponential decay rate must be positive, got {gamma}"
                    )));
                }
                Box::new(ExponentialLr::new(initial_lr, gamma))
            }
        };
        Ok(scheduler)
    }
}

/// Either one regularization weight or one per regularized quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegularizationFactor {
    Single(f64),
    Many(Vec<f64>),
}

impl RegularizationFactor {
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            RegularizationFactor::Single(f) => vec![*f],
            RegularizationFactor::Many(fs) => fs.clone(),
        }
    }
}

/// Settings shared by every reconstruction regardless of optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionSettings {
    /// Number of epochs.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Largest number of patterns simulated at once while accumulating the
    /// gradient of one minibatch.
    #[serde(default = "default_calculation_width")]
    pub calculation_width: usize,
    /// Restrict the reconstruction to these pattern indices.
    #[serde(default)]
    pub subset: Option<Selection>,
    #[serde(default)]
    pub regularization_factor: Option<RegularizationFactor>,
    /// Run each epoch on a worker thread.
    #[serde(default = "default_true")]
    pub threaded: bool,
    /// Seed for minibatch shuffling. Epoch `e` shuffles with `seed + e`.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            calculation_width: default_calculation_width(),
            subset: None,
            regularization_factor: None,
            threaded: true,
            seed: 0,
            scheduler: None,
        }
    }
}

impl ReconstructionSettings {
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn calculation_width(mut self, width: usize) -> Self {
        self.calculation_width = width;
        self
    }

    pub fn subset(mut self, selection: impl Into<Selection>) -> Self {
        self.subset = Some(selection.into());
        self
    }

    pub fn regularization(mut self, factors: Vec<f64>) -> Self {
        self.regularization_factor = Some(RegularizationFactor::Many(factors));
        self
    }

    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn validate(&self) -> Result<(), OptimizeError> {
        if self.calculation_width == 0 {
            return Err(OptimizeError::Config("calculation_width must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_adam_lr() -> f64 {
    0.005
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}
fn default_adam_batch_size() -> usize {
    15
}
fn default_lbfgs_lr() -> f64 {
    0.1
}
fn default_lbfgs_max_iter() -> usize {
    20
}
fn default_history_size() -> usize {
    2
}
fn default_tolerance_grad() -> f64 {
    1e-7
}
fn default_tolerance_change() -> f64 {
    1e-9
}
fn default_sgd_lr() -> f64 {
    0.01
}
fn default_plateau_factor() -> f64 {
    0.2
}
fn default_plateau_patience() -> usize {
    10
}
fn default_plateau_threshold() -> f64 {
    1e-9
}
fn default_iterations() -> usize {
    10
}
fn default_calculation_width() -> usize {
    10
}
fn default_true() -> bool {
    true
}
