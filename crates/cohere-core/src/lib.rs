//! # Cohere Core
//!
//! Differentiable forward models for coherent diffraction imaging. This crate
//! holds everything needed to simulate a diffraction pattern from a model's
//! parameters and to carry the gradient of a loss back to those parameters.
//!
//! ## Architecture
//!
//! Every geometry implements the [`model::ForwardModel`] trait: interaction,
//! propagation, measurement and loss, each paired with an adjoint. The
//! [`model::evaluate`] function composes the stages forward and their adjoints
//! backward, producing a loss and a [`types::Gradients`] set that the
//! optimizers in `cohere-optim` consume.
//!
//! ## Modules
//!
//! - [`types`]: Wavefields, patterns, parameters and gradients.
//! - [`measurement`]: Detector response: intensity, incoherent sums, background, saturation, binning.
//! - [`polarization`]: Jones matrices and their application to vector fields.
//! - [`propagators`]: Centered far-field propagation.
//! - [`projectors`]: The modulus constraint used by ePIE.
//! - [`losses`]: Amplitude MSE, intensity MSE and Poisson likelihood.
//! - [`model`]: The forward-model contract and the `SimplePtycho` geometry.

pub mod losses;
pub mod measurement;
pub mod model;
pub mod polarization;
pub mod projectors;
pub mod propagators;
pub mod types;

pub use model::simple_ptycho::SimplePtycho;
pub use model::{evaluate, ForwardModel, ModelError, Simulate};
pub use types::{Gradients, ParamValue, Parameter, Parameters, Pattern, Wavefield};
