//! # Cohere Optim
//!
//! Iterative reconstruction for `cohere-core` forward models. A
//! [`Reconstructor`] wraps a model; its `*_optimize` methods return an
//! [`Epochs`] iterator that runs one pass over a dataset per `next` call,
//! optionally on a worker thread that can be cancelled between sub-chunks.
//!
//! ## Modules
//!
//! - [`optimizer`]: The [`Optimizer`] and [`Objective`] traits and [`OptimizeError`].
//! - [`adam`], [`lbfgs`], [`sgd`]: Update rules, complex-parameter aware.
//! - [`scheduler`]: Plateau and exponential learning-rate schedules.
//! - [`config`]: Serializable optimizer and reconstruction settings.
//! - [`driver`]: The reconstructor and its epoch iterator.
//! - [`cancel`]: Cooperative cancellation.
//!
//! ```ignore
//! let mut rec = Reconstructor::new(model);
//! let settings = ReconstructionSettings::default().iterations(50);
//! for loss in rec.adam_optimize(&dataset, AdamConfig::default(), &settings)? {
//!     println!("{:.4e}", loss?);
//! }
//! ```

pub mod adam;
pub mod cancel;
pub mod config;
pub mod driver;
pub mod lbfgs;
pub mod optimizer;
pub mod scheduler;
pub mod sgd;

pub use adam::Adam;
pub use cancel::CancelToken;
pub use config::{
    AdamConfig, Batching, LbfgsConfig, OptimizerConfig, ReconstructionSettings, RegularizationFactor,
    SchedulerConfig, SgdConfig,
};
pub use driver::{Epochs, JobState, ReconstructionResults, Reconstructor};
pub use lbfgs::Lbfgs;
pub use optimizer::{Objective, OptimizeError, Optimizer};
pub use scheduler::{ExponentialLr, LrScheduler, ReduceLrOnPlateau};
pub use sgd::Sgd;
