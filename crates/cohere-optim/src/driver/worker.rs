//! Running one epoch, inline or on a worker thread.

use std::any::Any;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use cohere_core::ForwardModel;
use cohere_data::{DataLoader, Dataset};
use log::debug;

use super::objective::BatchObjective;
use crate::cancel::CancelToken;
use crate::config::Batching;
use crate::optimizer::{OptimizeError, Optimizer};
use crate::scheduler::LrScheduler;

/// How often the caller wakes while a threaded epoch runs.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything one epoch touches.
pub(crate) struct EpochJob<'j, M: ForwardModel, S: ?Sized> {
    pub model: &'j mut M,
    pub optimizer: &'j mut Box<dyn Optimizer>,
    pub scheduler: Option<&'j mut Box<dyn LrScheduler>>,
    pub dataset: &'j S,
    pub batching: Batching,
    pub calculation_width: usize,
    pub regularization: Option<&'j [f64]>,
    pub normalization: f64,
    pub seed: u64,
    pub epoch: usize,
    pub cancel: &'j CancelToken,
}

/// One pass over the dataset: an optimizer step per minibatch, then a
/// scheduler step on the normalized epoch loss.
pub(crate) fn run_epoch<M, S>(job: EpochJob<'_, M, S>) -> Result<f64, OptimizeError>
where
    M: ForwardModel,
    S: Dataset<Input = M::Input> + ?Sized,
{
    let mut loader = DataLoader::new(job.dataset).shuffle(job.batching.shuffle);
    loader = match job.batching.batch_size {
        Some(size) => loader.batch_size(size),
        None => loader.full_batch(),
    };
    loader = loader.seed(job.seed.wrapping_add(job.epoch as u64));

    let mut total = 0.0;
    for (i, batch) in loader.batches().enumerate() {
        let batch = batch?;
        let mut objective = BatchObjective {
            model: &mut *job.model,
            batch: &batch,
            calculation_width: job.calculation_width,
            regularization: job.regularization,
            cancel: job.cancel,
        };
        let loss = job.optimizer.step(&mut objective)?;
        debug!("epoch {} batch {}: loss {:.6e}", job.epoch, i, loss);
        total += loss;
    }

    let loss = total / job.normalization;
    if let Some(scheduler) = job.scheduler {
        let lr = scheduler.step(loss);
        job.optimizer.set_learning_rate(lr);
    }
    Ok(loss)
}

/// Run the epoch on a scoped worker thread. The calling thread waits on the
/// result, calling `poll` every [`POLL_INTERVAL`] until it arrives.
pub(crate) fn run_threaded<M, S>(
    job: EpochJob<'_, M, S>,
    mut poll: Option<&mut (dyn FnMut() + '_)>,
) -> Result<f64, OptimizeError>
where
    M: ForwardModel,
    S: Dataset<Input = M::Input> + ?Sized,
{
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| -> Result<f64, OptimizeError> {
        let worker = thread::Builder::new()
            .name("cohere-epoch".into())
            .spawn_scoped(scope, move || {
                // The receiver only disappears if the caller is unwinding.
                let _ = tx.send(run_epoch(job));
            })?;

        let mut outcome = None;
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(result) => {
                    outcome = Some(result);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(poll) = poll.as_deref_mut() {
                        poll();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        match worker.join() {
            Err(payload) => Err(OptimizeError::WorkerPanicked(panic_message(payload.as_ref()))),
            Ok(()) => outcome.unwrap_or_else(|| {
                Err(OptimizeError::WorkerPanicked("worker exited without a result".into()))
            }),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}
