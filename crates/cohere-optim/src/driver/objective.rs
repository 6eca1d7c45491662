//! The per-batch objective handed to an optimizer.

use cohere_core::{evaluate, ForwardModel, Gradients, Parameters};
use cohere_data::Batch;

use crate::cancel::CancelToken;
use crate::optimizer::{Objective, OptimizeError};

/// Loss of one minibatch, accumulated over sub-chunks of at most
/// `calculation_width` patterns, plus the regularizer when one is active.
pub struct BatchObjective<'b, M: ForwardModel> {
    pub model: &'b mut M,
    pub batch: &'b Batch<M::Input>,
    pub calculation_width: usize,
    pub regularization: Option<&'b [f64]>,
    pub cancel: &'b CancelToken,
}

impl<M: ForwardModel> Objective for BatchObjective<'_, M> {
    fn parameters(&self) -> &Parameters {
        self.model.parameters()
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        self.model.parameters_mut()
    }

    fn evaluate(&mut self) -> Result<(f64, Gradients), OptimizeError> {
        let model = &*self.model;
        let mut grads = model.parameters().zero_gradients();
        let mut total = 0.0;

        for chunk in self.batch.chunks(self.calculation_width) {
            if self.cancel.is_cancelled() {
                return Err(OptimizeError::Cancelled);
            }
            let observed = chunk.patterns.into_dyn();
            let (loss, chunk_grads) = evaluate(model, &chunk.inputs, &observed)?;
            total += loss;
            grads.accumulate(&chunk_grads)?;
        }

        if let Some(factors) = self.regularization {
            total += model.regularizer(factors, &mut grads)?;
        }
        Ok((total, grads))
    }
}
