//! Forward-model abstraction.
//!
//! The [`ForwardModel`] trait is the contract every reconstruction geometry
//! implements: an interaction stage producing exit waves, a propagator to the
//! detector plane, a measurement turning detector-plane waves into patterns,
//! and a loss. Each stage has an adjoint (`*_backward`) that maps a gradient
//! on its output to a gradient on its input, writing parameter gradients into
//! a [`Gradients`] set on the way.
//!
//! [`Simulate::forward`] composes the forward stages and [`evaluate`] walks
//! the chain back again; neither can be overridden by a model. The first
//! implementation is [`simple_ptycho::SimplePtycho`].

pub mod simple_ptycho;

use std::collections::BTreeMap;

use cohere_data::{DatasetError, DetectorGeometry};
use ndarray::{Array2, ArrayD};
use thiserror::Error;

use crate::losses::LossError;
use crate::measurement::MeasurementError;
use crate::polarization::PolarizationError;
use crate::propagators::PropagatorError;
use crate::types::{Gradients, ParameterError, Parameters, Pattern, Wavefield};

/// Errors that can occur while simulating or differentiating a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model does not implement {capability}")]
    Unimplemented { capability: &'static str },

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Detector geometry is missing '{0}'")]
    MissingGeometry(&'static str),

    #[error("Measurement error: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("Polarization error: {0}")]
    Polarization(#[from] PolarizationError),

    #[error("Propagator error: {0}")]
    Propagator(#[from] PropagatorError),

    #[error("Loss error: {0}")]
    Loss(#[from] LossError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
}

fn unimplemented<T>(capability: &'static str) -> Result<T, ModelError> {
    Err(ModelError::Unimplemented { capability })
}

/// A differentiable physical model of a diffraction experiment.
///
/// Only parameter access is required. Every other capability defaults to
/// [`ModelError::Unimplemented`], so a partial model fails loudly the first
/// time a missing stage is reached.
pub trait ForwardModel: Send {
    /// Per-pattern inputs, e.g. a scan index and translation.
    type Input: Clone + Send + Sync;

    fn parameters(&self) -> &Parameters;

    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Exit waves for a batch of inputs, shape `(B, ..., M, N)`.
    fn interaction(&self, _inputs: &[Self::Input]) -> Result<Wavefield, ModelError> {
        unimplemented("interaction")
    }

    /// Accumulate parameter gradients given the gradient on the exit waves.
    fn interaction_backward(
        &self,
        _inputs: &[Self::Input],
        _grad_exit: &Wavefield,
        _grads: &mut Gradients,
    ) -> Result<(), ModelError> {
        unimplemented("interaction_backward")
    }

    /// Exit waves to detector-plane waves.
    fn forward_propagator(&self, _wavefield: &Wavefield) -> Result<Wavefield, ModelError> {
        unimplemented("forward_propagator")
    }

    /// Gradient on the exit waves from the gradient on the detector-plane
    /// waves. `wavefield` is the propagator input.
    fn forward_propagator_backward(&self, _wavefield: &Wavefield, _grad: &Wavefield) -> Result<Wavefield, ModelError> {
        unimplemented("forward_propagator_backward")
    }

    /// Optional inverse of [`forward_propagator`](Self::forward_propagator).
    fn backward_propagator(&self, _wavefield: &Wavefield) -> Result<Wavefield, ModelError> {
        unimplemented("backward_propagator")
    }

    /// Detector-plane waves to simulated patterns.
    fn measurement(&self, _wavefield: &Wavefield) -> Result<Pattern, ModelError> {
        unimplemented("measurement")
    }

    /// Gradient on the detector-plane waves from the gradient on the patterns.
    /// Gradients of measurement parameters (e.g. a background) go to `grads`.
    fn measurement_backward(
        &self,
        _wavefield: &Wavefield,
        _grad: &Pattern,
        _grads: &mut Gradients,
    ) -> Result<Wavefield, ModelError> {
        unimplemented("measurement_backward")
    }

    fn loss(&self, observed: &Pattern, simulated: &Pattern, mask: Option<&Array2<bool>>) -> Result<f64, ModelError> {
        Ok(self.loss_gradient(observed, simulated, mask)?.0)
    }

    /// Loss and its gradient with respect to the simulated patterns.
    fn loss_gradient(
        &self,
        _observed: &Pattern,
        _simulated: &Pattern,
        _mask: Option<&Array2<bool>>,
    ) -> Result<(f64, Pattern), ModelError> {
        unimplemented("loss")
    }

    /// Valid-pixel mask over the detector, `true` where pixels are trusted.
    fn mask(&self) -> Option<&Array2<bool>> {
        None
    }

    fn supports_regularizer(&self) -> bool {
        false
    }

    /// Regularization penalty for the given factors. Its gradient is added
    /// to `grads`.
    fn regularizer(&self, _factors: &[f64], _grads: &mut Gradients) -> Result<f64, ModelError> {
        unimplemented("regularizer")
    }

    /// Plain-array snapshot of the model state.
    fn save_results(&self) -> BTreeMap<String, ArrayD<f64>> {
        self.parameters().packed()
    }

    fn detector_geometry(&self) -> DetectorGeometry {
        DetectorGeometry::default()
    }
}

/// Simulation entry point shared by every [`ForwardModel`].
pub trait Simulate: ForwardModel {
    /// `measurement(forward_propagator(interaction(inputs)))`.
    fn forward(&self, inputs: &[Self::Input]) -> Result<Pattern, ModelError> {
        let exit = self.interaction(inputs)?;
        let detector = self.forward_propagator(&exit)?;
        self.measurement(&detector)
    }
}

impl<M: ForwardModel + ?Sized> Simulate for M {}

/// Loss of a batch against its observed patterns and the gradient of that
/// loss with respect to every trainable parameter.
pub fn evaluate<M: ForwardModel + ?Sized>(
    model: &M,
    inputs: &[M::Input],
    observed: &Pattern,
) -> Result<(f64, Gradients), ModelError> {
    let exit = model.interaction(inputs)?;
    let detector = model.forward_propagator(&exit)?;
    let simulated = model.measurement(&detector)?;
    let (loss, grad_simulated) = model.loss_gradient(observed, &simulated, model.mask())?;

    let mut grads = model.parameters().zero_gradients();
    let grad_detector = model.measurement_backward(&detector, &grad_simulated, &mut grads)?;
    let grad_exit = model.forward_propagator_backward(&exit, &grad_detector)?;
    model.interaction_backward(inputs, &grad_exit, &mut grads)?;
    Ok((loss, grads))
}
