//! Adam with bias correction, optional coupled weight decay and AMSGrad.
//!
//! Complex parameters are treated as pairs of real parameters: the second
//! moment of a complex gradient `g` is `|g|^2`, so the real and imaginary
//! parts share one adaptive step size.

use std::collections::BTreeMap;

use cohere_core::types::{ParameterError, Scalar};
use cohere_core::ParamValue;
use log::trace;
use ndarray::{ArrayD, Zip};

use crate::config::AdamConfig;
use crate::optimizer::{Objective, OptimizeError, Optimizer};

/// Per-parameter moment estimates.
#[derive(Debug, Clone)]
struct Moments {
    step: i32,
    exp_avg: ParamValue,
    exp_avg_sq: ArrayD<f64>,
    max_exp_avg_sq: Option<ArrayD<f64>>,
}

impl Moments {
    fn new(like: &ParamValue, amsgrad: bool) -> Self {
        let sq = ArrayD::zeros(like.shape());
        Self {
            step: 0,
            exp_avg: like.zeros_like(),
            max_exp_avg_sq: amsgrad.then(|| sq.clone()),
            exp_avg_sq: sq,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    amsgrad: bool,
    state: BTreeMap<String, Moments>,
}

impl Adam {
    pub fn new(config: &AdamConfig) -> Result<Self, OptimizeError> {
        for (name, beta) in [("beta1", config.beta1), ("beta2", config.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(OptimizeError::Config(format!("{name} must lie in [0, 1), got {beta}")));
            }
        }
        if config.lr < 0.0 || config.eps < 0.0 || config.weight_decay < 0.0 {
            return Err(OptimizeError::Config(
                "Adam learning rate, eps and weight decay must be non-negative".into(),
            ));
        }
        Ok(Self {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
            amsgrad: config.amsgrad,
            state: BTreeMap::new(),
        })
    }

    /// Adam with default settings at the given learning rate.
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
            state: BTreeMap::new(),
        }
    }

    fn update<T: Scalar>(
        &self,
        param: &mut ArrayD<T>,
        grad: &ArrayD<T>,
        exp_avg: &mut ArrayD<T>,
        exp_avg_sq: &mut ArrayD<f64>,
        max_exp_avg_sq: Option<&mut ArrayD<f64>>,
        step: i32,
    ) {
        let (b1, b2, wd, eps) = (self.beta1, self.beta2, self.weight_decay, self.eps);
        let step_size = self.lr / (1.0 - b1.powi(step));
        let bias_correction2_sqrt = (1.0 - b2.powi(step)).sqrt();

        Zip::from(&mut *exp_avg)
            .and(&mut *exp_avg_sq)
            .and(&*param)
            .and(grad)
            .for_each(|m, v, &p, &g| {
                let g = if wd != 0.0 { g + p * wd } else { g };
                *m = *m * b1 + g * (1.0 - b1);
                *v = *v * b2 + g.norm_sqr() * (1.0 - b2);
            });

        let second = match max_exp_avg_sq {
            Some(max) => {
                Zip::from(&mut *max).and(&*exp_avg_sq).for_each(|mx, &v| *mx = mx.max(v));
                max
            }
            None => exp_avg_sq,
        };

        Zip::from(param).and(&*exp_avg).and(&*second).for_each(|p, &m, &v| {
            let denom = v.sqrt() / bias_correction2_sqrt + eps;
            *p = *p - m * (step_size / denom);
        });
    }
}

impl Optimizer for Adam {
    fn step(&mut self, objective: &mut dyn Objective) -> Result<f64, OptimizeError> {
        let (loss, grads) = objective.evaluate()?;
        let params = objective.parameters_mut();

        for (name, grad) in grads.iter() {
            let entry = params
                .get_mut(name)
                .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
            if !entry.trainable {
                continue;
            }
            let amsgrad = self.amsgrad;
            let mut moments = self
                .state
                .remove(name)
                .unwrap_or_else(|| Moments::new(grad, amsgrad));
            moments.step += 1;

            match (&mut entry.value, grad, &mut moments.exp_avg) {
                (ParamValue::Real(p), ParamValue::Real(g), ParamValue::Real(m)) => {
                    check_shape(name, p.shape(), g.shape())?;
                    self.update(p, g, m, &mut moments.exp_avg_sq, moments.max_exp_avg_sq.as_mut(), moments.step)
                }
                (ParamValue::Complex(p), ParamValue::Complex(g), ParamValue::Complex(m)) => {
                    check_shape(name, p.shape(), g.shape())?;
                    self.update(p, g, m, &mut moments.exp_avg_sq, moments.max_exp_avg_sq.as_mut(), moments.step)
                }
                (value, grad, _) => {
                    return Err(ParameterError::KindMismatch {
                        name: name.to_string(),
                        expected: value.kind(),
                        found: grad.kind(),
                    }
                    .into())
                }
            }
            trace!("adam: '{}' at step {}", name, moments.step);
            self.state.insert(name.to_string(), moments);
        }
        Ok(loss)
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn name(&self) -> &'static str {
        "Adam"
    }
}

fn check_shape(name: &str, expected: &[usize], found: &[usize]) -> Result<(), ParameterError> {
    if expected != found {
        return Err(ParameterError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}
