//! The optimizer contract and the errors a reconstruction can raise.
//!
//! An [`Optimizer`] never sees a model or a dataset. It is handed an
//! [`Objective`]: something that can report the current parameters, move
//! them, and evaluate a fresh loss and gradient at wherever they currently
//! are. First-order methods evaluate once per step; L-BFGS re-evaluates after
//! every inner iteration.

use cohere_core::types::ParameterError;
use cohere_core::{Gradients, ModelError, Parameters};
use cohere_data::DatasetError;
use thiserror::Error;

/// Errors raised while optimizing a model.
#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Could not start the optimization worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Optimization worker panicked: {0}")]
    WorkerPanicked(String),

    /// Raised inside an epoch when its cancel token fires. The driver turns
    /// it into a clean end of iteration; callers never see it.
    #[error("Reconstruction cancelled")]
    Cancelled,
}

/// A re-evaluable loss over some model's parameters.
pub trait Objective {
    fn parameters(&self) -> &Parameters;

    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Loss and gradient at the current parameter values. Gradients start
    /// from zero on every call, so evaluating twice without moving the
    /// parameters gives identical results.
    fn evaluate(&mut self) -> Result<(f64, Gradients), OptimizeError>;
}

/// A parameter update rule.
pub trait Optimizer: Send {
    /// Perform one optimization step and return the loss at the parameters
    /// the step started from.
    fn step(&mut self, objective: &mut dyn Objective) -> Result<f64, OptimizeError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Short name used in log messages.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A convex quadratic objective shared by the optimizer unit tests.

    use super::*;
    use cohere_core::Parameter;
    use ndarray::{arr1, ArrayD};
    use num_complex::Complex64;

    /// $L = \sum_i w_i |x_i - t_i|^2 + \sum_j |z_j - c_j|^2$ over a real
    /// vector `x` and a complex vector `z`.
    pub struct Quadratic {
        pub params: Parameters,
        pub weights: ArrayD<f64>,
        pub target: ArrayD<f64>,
        pub complex_target: ArrayD<Complex64>,
        pub evaluations: usize,
    }

    impl Quadratic {
        pub fn new() -> Self {
            let mut params = Parameters::new();
            params.insert("x", Parameter::real(arr1(&[0.0, 0.0, 0.0]).into_dyn()));
            params.insert(
                "z",
                Parameter::complex(arr1(&[Complex64::new(0.0, 0.0), Complex64::new(1.0, 1.0)]).into_dyn()),
            );
            Self {
                params,
                weights: arr1(&[1.0, 2.0, 0.5]).into_dyn(),
                target: arr1(&[1.0, -2.0, 0.5]).into_dyn(),
                complex_target: arr1(&[Complex64::new(0.5, -1.0), Complex64::new(-0.25, 0.75)]).into_dyn(),
                evaluations: 0,
            }
        }

        pub fn loss(&self) -> f64 {
            let x = self.params.real("x").unwrap();
            let z = self.params.complex("z").unwrap();
            let real: f64 = x
                .iter()
                .zip(self.target.iter())
                .zip(self.weights.iter())
                .map(|((x, t), w)| w * (x - t).powi(2))
                .sum();
            let complex: f64 = z.iter().zip(self.complex_target.iter()).map(|(z, c)| (z - c).norm_sqr()).sum();
            real + complex
        }
    }

    impl Objective for Quadratic {
        fn parameters(&self) -> &Parameters {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.params
        }

        fn evaluate(&mut self) -> Result<(f64, Gradients), OptimizeError> {
            self.evaluations += 1;
            let mut grads = self.params.zero_gradients();
            if let Some(g) = grads.real_mut("x") {
                let x = self.params.real("x")?;
                for (((g, x), t), w) in g.iter_mut().zip(x.iter()).zip(self.target.iter()).zip(self.weights.iter()) {
                    *g = 2.0 * w * (x - t);
                }
            }
            if let Some(g) = grads.complex_mut("z") {
                let z = self.params.complex("z")?;
                for ((g, z), c) in g.iter_mut().zip(z.iter()).zip(self.complex_target.iter()) {
                    *g = (z - c) * 2.0;
                }
            }
            Ok((self.loss(), grads))
        }
    }
}
