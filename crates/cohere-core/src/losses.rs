//! Loss functions comparing observed and simulated patterns.
//!
//! Every loss is a plain sum over pixels; the optimization driver divides by
//! the total observed intensity, so nothing here normalizes. An optional
//! boolean mask (`true` = trusted pixel) matching the last two axes removes
//! masked pixels from both the loss and its gradient without rescaling the
//! rest.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Pattern;

#[derive(Debug, Error)]
pub enum LossError {
    #[error("Shape mismatch: {0}")]
    Shape(String),
}

/// Available loss functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    AmplitudeMse,
    IntensityMse,
    PoissonNll,
}

impl LossKind {
    pub fn evaluate(
        &self,
        observed: &Pattern,
        simulated: &Pattern,
        mask: Option<&Array2<bool>>,
    ) -> Result<f64, LossError> {
        Ok(self.gradient(observed, simulated, mask)?.0)
    }

    /// Loss value and its gradient with respect to `simulated`.
    pub fn gradient(
        &self,
        observed: &Pattern,
        simulated: &Pattern,
        mask: Option<&Array2<bool>>,
    ) -> Result<(f64, Pattern), LossError> {
        match self {
            LossKind::AmplitudeMse => amplitude_mse_gradient(observed, simulated, mask),
            LossKind::IntensityMse => intensity_mse_gradient(observed, simulated, mask),
            LossKind::PoissonNll => poisson_nll_gradient(observed, simulated, mask),
        }
    }
}

/// $\sum (\sqrt{s} - \sqrt{o})^2$.
pub fn amplitude_mse(observed: &Pattern, simulated: &Pattern, mask: Option<&Array2<bool>>) -> Result<f64, LossError> {
    Ok(amplitude_mse_gradient(observed, simulated, mask)?.0)
}

pub fn amplitude_mse_gradient(
    observed: &Pattern,
    simulated: &Pattern,
    mask: Option<&Array2<bool>>,
) -> Result<(f64, Pattern), LossError> {
    pixelwise(observed, simulated, mask, |o, s| {
        let (ro, rs) = (o.max(0.0).sqrt(), s.sqrt());
        let grad = if rs > 0.0 { 1.0 - ro / rs } else { 0.0 };
        ((rs - ro).powi(2), grad)
    })
}

/// $\sum (s - o)^2$.
pub fn intensity_mse(observed: &Pattern, simulated: &Pattern, mask: Option<&Array2<bool>>) -> Result<f64, LossError> {
    Ok(intensity_mse_gradient(observed, simulated, mask)?.0)
}

pub fn intensity_mse_gradient(
    observed: &Pattern,
    simulated: &Pattern,
    mask: Option<&Array2<bool>>,
) -> Result<(f64, Pattern), LossError> {
    pixelwise(observed, simulated, mask, |o, s| ((s - o).powi(2), 2.0 * (s - o)))
}

/// Poisson negative log-likelihood up to a constant, $\sum (s - o \ln s)$.
pub fn poisson_nll(observed: &Pattern, simulated: &Pattern, mask: Option<&Array2<bool>>) -> Result<f64, LossError> {
    Ok(poisson_nll_gradient(observed, simulated, mask)?.0)
}

pub fn poisson_nll_gradient(
    observed: &Pattern,
    simulated: &Pattern,
    mask: Option<&Array2<bool>>,
) -> Result<(f64, Pattern), LossError> {
    pixelwise(observed, simulated, mask, |o, s| (s - o * s.ln(), 1.0 - o / s))
}

fn pixelwise<F>(
    observed: &Pattern,
    simulated: &Pattern,
    mask: Option<&Array2<bool>>,
    f: F,
) -> Result<(f64, Pattern), LossError>
where
    F: Fn(f64, f64) -> (f64, f64),
{
    if observed.shape() != simulated.shape() {
        return Err(LossError::Shape(format!(
            "observed shape {:?} does not match simulated shape {:?}",
            observed.shape(),
            simulated.shape()
        )));
    }
    let nd = simulated.ndim();
    if let Some(mask) = mask {
        if nd < 2 || mask.shape() != &simulated.shape()[nd - 2..] {
            return Err(LossError::Shape(format!(
                "mask shape {:?} does not match pattern shape {:?}",
                mask.shape(),
                simulated.shape()
            )));
        }
    }

    let mut grad = Pattern::zeros(simulated.raw_dim());
    let mut total = 0.0;
    grad.indexed_iter_mut()
        .zip(observed.iter())
        .zip(simulated.iter())
        .for_each(|(((idx, g), &o), &s)| {
            let trusted = mask.map_or(true, |m| m[[idx[nd - 2], idx[nd - 1]]]);
            if trusted {
                let (loss, d) = f(o, s);
                total += loss;
                *g = d;
            }
        });
    Ok((total, grad))
}
