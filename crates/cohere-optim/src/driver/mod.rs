//! Epoch-level reconstruction driver.
//!
//! A [`Reconstructor`] owns a forward model and its loss record. Calling one
//! of its `*_optimize` methods returns an [`Epochs`] iterator: each call to
//! `next` runs one full pass over the dataset and yields the normalized
//! epoch loss. Nothing runs until the iterator is pulled, and dropping it
//! early simply stops the reconstruction.
//!
//! Per epoch:
//! 1. The dataset (or the selected subset) is split into minibatches,
//!    reshuffled each epoch when shuffling is on.
//! 2. For each minibatch the optimizer is handed a re-evaluable objective
//!    that accumulates loss and gradient over sub-chunks of at most
//!    `calculation_width` patterns, plus the regularizer when configured.
//! 3. The per-batch losses are summed and divided by the total observed
//!    intensity of the dataset, computed once per job.
//! 4. The scheduler, if any, steps on the epoch loss.
//!
//! With `threaded` set, step 1-4 happen on a scoped worker thread while the
//! caller waits, waking every 10 ms to run an optional poll hook. A
//! [`CancelToken`] stops the current epoch at the next sub-chunk boundary;
//! the interrupted epoch leaves no trace in the loss record and the iterator
//! ends.

mod objective;
mod worker;

use std::collections::BTreeMap;
use std::iter::FusedIterator;
use std::time::{Duration, Instant};

use cohere_core::ForwardModel;
use cohere_data::{Dataset, DatasetError, Selection, Subset};
use log::{info, warn};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

pub use objective::BatchObjective;

use crate::cancel::CancelToken;
use crate::config::{AdamConfig, Batching, LbfgsConfig, OptimizerConfig, ReconstructionSettings, SgdConfig};
use crate::optimizer::{OptimizeError, Optimizer};
use crate::scheduler::LrScheduler;
use worker::EpochJob;

/// Lifecycle of an optimization job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    /// Every requested epoch completed.
    Finished,
    /// Stopped by its cancel token.
    Cancelled,
    /// An epoch returned an error.
    Failed,
}

/// Plain-data snapshot of a reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionResults {
    pub parameters: BTreeMap<String, ArrayD<f64>>,
    pub loss_history: Vec<f64>,
}

/// A forward model together with the record of its optimization.
#[derive(Debug, Clone)]
pub struct Reconstructor<M> {
    model: M,
    loss_history: Vec<f64>,
    latest_epoch_time: Option<Duration>,
}

impl<M: ForwardModel> Reconstructor<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            loss_history: Vec::new(),
            latest_epoch_time: None,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Normalized loss of every completed epoch, across all jobs.
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    pub fn latest_epoch_time(&self) -> Option<Duration> {
        self.latest_epoch_time
    }

    /// One-line progress summary of the latest epoch.
    pub fn report(&self) -> String {
        match (self.loss_history.last(), self.latest_epoch_time) {
            (Some(loss), Some(time)) => format!(
                "Iteration {} completed in {:.2} s with loss {:.6e}",
                self.loss_history.len(),
                time.as_secs_f64(),
                loss
            ),
            _ => "No reconstruction iterations performed yet!".to_string(),
        }
    }

    pub fn save_results(&self) -> ReconstructionResults {
        ReconstructionResults {
            parameters: self.model.save_results(),
            loss_history: self.loss_history.clone(),
        }
    }

    /// Start a job with an already-built optimizer.
    pub fn optimize<'a, D>(
        &'a mut self,
        dataset: &'a D,
        optimizer: Box<dyn Optimizer>,
        batching: Batching,
        settings: &ReconstructionSettings,
    ) -> Result<Epochs<'a, M, D>, OptimizeError>
    where
        D: Dataset<Input = M::Input> + ?Sized,
    {
        settings.validate()?;
        let selection = settings
            .subset
            .clone()
            .unwrap_or_else(|| Selection::Many((0..dataset.len()).collect()));
        let subset = Subset::new(dataset, selection)?;
        if subset.is_empty() {
            return Err(DatasetError::Empty.into());
        }

        let regularization = match &settings.regularization_factor {
            Some(factors) if self.model.supports_regularizer() => Some(factors.to_vec()),
            Some(_) => {
                warn!("Model does not support regularization, ignoring the regularization factor");
                None
            }
            None => None,
        };
        let scheduler = settings
            .scheduler
            .as_ref()
            .map(|s| s.build(optimizer.learning_rate()))
            .transpose()?;

        info!(
            "Starting {} reconstruction: {} epochs over {} patterns",
            optimizer.name(),
            settings.iterations,
            subset.len()
        );
        Ok(Epochs {
            reconstructor: self,
            subset,
            optimizer,
            scheduler,
            batching,
            iterations: settings.iterations,
            calculation_width: settings.calculation_width,
            threaded: settings.threaded,
            seed: settings.seed,
            regularization,
            normalization: None,
            completed: 0,
            state: JobState::Running,
            cancel: CancelToken::new(),
            poll: None,
        })
    }

    /// Start a job from an optimizer configuration. An optimizer-implied
    /// scheduler is used when the settings name none.
    pub fn optimize_with<'a, D>(
        &'a mut self,
        dataset: &'a D,
        config: &OptimizerConfig,
        settings: &ReconstructionSettings,
    ) -> Result<Epochs<'a, M, D>, OptimizeError>
    where
        D: Dataset<Input = M::Input> + ?Sized,
    {
        let mut settings = settings.clone();
        if settings.scheduler.is_none() {
            settings.scheduler = config.implied_scheduler();
        }
        let optimizer = config.build()?;
        self.optimize(dataset, optimizer, config.batching(), &settings)
    }

    /// Adam on shuffled minibatches.
    pub fn adam_optimize<'a, D>(
        &'a mut self,
        dataset: &'a D,
        config: AdamConfig,
        settings: &ReconstructionSettings,
    ) -> Result<Epochs<'a, M, D>, OptimizeError>
    where
        D: Dataset<Input = M::Input> + ?Sized,
    {
        self.optimize_with(dataset, &OptimizerConfig::Adam(config), settings)
    }

    /// L-BFGS on the full dataset.
    pub fn lbfgs_optimize<'a, D>(
        &'a mut self,
        dataset: &'a D,
        config: LbfgsConfig,
        settings: &ReconstructionSettings,
    ) -> Result<Epochs<'a, M, D>, OptimizeError>
    where
        D: Dataset<Input = M::Input> + ?Sized,
    {
        self.optimize_with(dataset, &OptimizerConfig::Lbfgs(config), settings)
    }

    pub fn sgd_optimize<'a, D>(
        &'a mut self,
        dataset: &'a D,
        config: SgdConfig,
        settings: &ReconstructionSettings,
    ) -> Result<Epochs<'a, M, D>, OptimizeError>
    where
        D: Dataset<Input = M::Input> + ?Sized,
    {
        self.optimize_with(dataset, &OptimizerConfig::Sgd(config), settings)
    }
}

/// A running optimization job, yielding one normalized loss per epoch.
pub struct Epochs<'a, M, D: ?Sized> {
    reconstructor: &'a mut Reconstructor<M>,
    subset: Subset<'a, D>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LrScheduler>>,
    batching: Batching,
    iterations: usize,
    calculation_width: usize,
    threaded: bool,
    seed: u64,
    regularization: Option<Vec<f64>>,
    normalization: Option<f64>,
    completed: usize,
    state: JobState,
    cancel: CancelToken,
    poll: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a, M, D> Epochs<'a, M, D>
where
    M: ForwardModel,
    D: Dataset<Input = M::Input> + ?Sized,
{
    /// Token that stops this job from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Called on the caller's thread roughly every 10 ms while a threaded
    /// epoch is running.
    pub fn on_poll(mut self, poll: impl FnMut() + 'a) -> Self {
        self.poll = Some(Box::new(poll));
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Epochs completed by this job.
    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Run every remaining epoch, stopping at the first error.
    pub fn run(&mut self) -> Result<usize, OptimizeError> {
        for loss in self.by_ref() {
            loss?;
        }
        Ok(self.completed)
    }

    fn normalization(&mut self) -> Result<f64, OptimizeError> {
        if let Some(n) = self.normalization {
            return Ok(n);
        }
        let total = self.subset.total_intensity()?;
        let n = if total.is_finite() && total > 0.0 {
            total
        } else {
            warn!("Total observed intensity is {}, epoch losses are not normalized", total);
            1.0
        };
        self.normalization = Some(n);
        Ok(n)
    }

    fn run_epoch(&mut self, normalization: f64) -> Result<f64, OptimizeError> {
        let Epochs {
            reconstructor,
            subset,
            optimizer,
            scheduler,
            batching,
            calculation_width,
            threaded,
            seed,
            regularization,
            completed,
            cancel,
            poll,
            ..
        } = self;

        let job = EpochJob {
            model: &mut reconstructor.model,
            optimizer,
            scheduler: scheduler.as_mut(),
            dataset: &*subset,
            batching: *batching,
            calculation_width: *calculation_width,
            regularization: regularization.as_deref(),
            normalization,
            seed: *seed,
            epoch: *completed,
            cancel: &*cancel,
        };
        if *threaded {
            worker::run_threaded(job, poll.as_deref_mut())
        } else {
            worker::run_epoch(job)
        }
    }
}

impl<M, D> Iterator for Epochs<'_, M, D>
where
    M: ForwardModel,
    D: Dataset<Input = M::Input> + ?Sized,
{
    type Item = Result<f64, OptimizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != JobState::Running {
            return None;
        }
        if self.completed >= self.iterations {
            self.state = JobState::Finished;
            return None;
        }

        let result = self.normalization().and_then(|n| {
            let start = Instant::now();
            self.run_epoch(n).map(|loss| (loss, start.elapsed()))
        });

        match result {
            Ok((loss, elapsed)) => {
                self.completed += 1;
                let record = &mut *self.reconstructor;
                record.loss_history.push(loss);
                record.latest_epoch_time = Some(elapsed);
                info!("{}", record.report());
                Some(Ok(loss))
            }
            Err(OptimizeError::Cancelled) => {
                info!("Reconstruction cancelled after {} epochs", self.completed);
                self.state = JobState::Cancelled;
                None
            }
            Err(e) => {
                warn!("Reconstruction stopped: {}", e);
                self.state = JobState::Failed;
                Some(Err(e))
            }
        }
    }
}

impl<M, D> FusedIterator for Epochs<'_, M, D>
where
    M: ForwardModel,
    D: Dataset<Input = M::Input> + ?Sized,
{
}


#[cfg(test)]
mod tests {
    use super::testing::{toy_dataset, ToyModel};
    use super::*;
    use crate::sgd::Sgd;

    #[test]
    fn test_report_before_and_after_an_epoch() {
        let dataset = toy_dataset(3);
        let mut rec = Reconstructor::new(ToyModel::new(3));
        assert_eq!(rec.report(), "No reconstruction iterations performed yet!");

        let settings = ReconstructionSettings::default().iterations(1).threaded(false);
        let losses: Vec<_> = rec
            .optimize(&dataset, Box::new(Sgd::with_lr(0.1)), Batching::full(), &settings)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(losses.len(), 1);
        assert!(rec.report().starts_with("Iteration 1 completed in "));
        assert!(rec.latest_epoch_time().is_some());
    }

    #[test]
    fn test_nothing_runs_until_pulled() {
        let dataset = toy_dataset(3);
        let mut rec = Reconstructor::new(ToyModel::new(3));
        let before = rec.model().field().clone();
        let epochs = rec
            .optimize(&dataset, Box::new(Sgd::with_lr(0.1)), Batching::full(), &ReconstructionSettings::default())
            .unwrap();
        assert_eq!(epochs.completed(), 0);
        drop(epochs);
        assert_eq!(rec.model().field(), &before);
        assert!(rec.loss_history().is_empty());
    }

    #[test]
    fn test_epoch_loss_is_normalized_by_total_intensity() {
        let dataset = toy_dataset(2);
        let model = ToyModel::new(2);
        let cancel = CancelToken::new();
        let batch = cohere_data::DataLoader::new(&dataset).full_batch().batches().next().unwrap().unwrap();
        let mut reference = model.clone();
        let (raw, _) = crate::optimizer::Objective::evaluate(&mut BatchObjective {
            model: &mut reference,
            batch: &batch,
            calculation_width: 10,
            regularization: None,
            cancel: &cancel,
        })
        .unwrap();

        let mut rec = Reconstructor::new(model);
        let settings = ReconstructionSettings::default().iterations(1).threaded(false);
        let mut epochs = rec
            .optimize(&dataset, Box::new(Sgd::with_lr(0.01)), Batching::full(), &settings)
            .unwrap();
        let loss = epochs.next().unwrap().unwrap();
        assert!((loss - raw / dataset.patterns.sum()).abs() < 1e-12);
        assert!(epochs.next().is_none());
        assert_eq!(epochs.state(), JobState::Finished);
    }

    #[test]
    fn test_default_seed_makes_shuffled_jobs_repeatable() {
        let dataset = toy_dataset(5);
        let settings = ReconstructionSettings::default().iterations(3).threaded(false);
        let mut runs = Vec::new();
        for _ in 0..2 {
            let mut rec = Reconstructor::new(ToyModel::new(5));
            rec.optimize(&dataset, Box::new(Sgd::with_lr(0.05)), Batching::minibatch(2, true), &settings)
                .unwrap()
                .run()
                .unwrap();
            runs.push((rec.loss_history().to_vec(), rec.model().field().clone()));
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn test_out_of_range_subset_is_rejected() {
        let dataset = toy_dataset(3);
        let mut rec = Reconstructor::new(ToyModel::new(3));
        let settings = ReconstructionSettings::default().subset(vec![0, 7]);
        assert!(matches!(
            rec.optimize(&dataset, Box::new(Sgd::with_lr(0.1)), Batching::full(), &settings),
            Err(OptimizeError::Dataset(DatasetError::IndexOutOfRange { index: 7, len: 3 }))
        ));
    }

    #[test]
    fn test_subset_restricts_the_fit() {
        let dataset = toy_dataset(3);
        let mut rec = Reconstructor::new(ToyModel::new(3));
        let before = rec.model().field().clone();
        let settings = ReconstructionSettings::default().iterations(2).threaded(false).subset(1);
        rec.optimize(&dataset, Box::new(Sgd::with_lr(0.1)), Batching::full(), &settings)
            .unwrap()
            .run()
            .unwrap();
        let after = rec.model().field();
        assert_eq!(after.index_axis(ndarray::Axis(0), 0), before.index_axis(ndarray::Axis(0), 0));
        assert_ne!(after.index_axis(ndarray::Axis(0), 1), before.index_axis(ndarray::Axis(0), 1));
    }
}
