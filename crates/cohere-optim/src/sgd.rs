//! Stochastic gradient descent with optional momentum and weight decay.

use std::collections::BTreeMap;

use cohere_core::types::ParameterError;
use cohere_core::ParamValue;

use crate::config::SgdConfig;
use crate::optimizer::{Objective, OptimizeError, Optimizer};

#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    dampening: f64,
    weight_decay: f64,
    nesterov: bool,
    /// Momentum buffers, created on the first step of each parameter.
    velocity: BTreeMap<String, ParamValue>,
}

impl Sgd {
    pub fn new(config: &SgdConfig) -> Result<Self, OptimizeError> {
        if config.lr < 0.0 || config.momentum < 0.0 || config.weight_decay < 0.0 {
            return Err(OptimizeError::Config(
                "SGD learning rate, momentum and weight decay must be non-negative".into(),
            ));
        }
        if config.nesterov && (config.momentum <= 0.0 || config.dampening != 0.0) {
            return Err(OptimizeError::Config(
                "Nesterov momentum requires a positive momentum and zero dampening".into(),
            ));
        }
        Ok(Self {
            lr: config.lr,
            momentum: config.momentum,
            dampening: config.dampening,
            weight_decay: config.weight_decay,
            nesterov: config.nesterov,
            velocity: BTreeMap::new(),
        })
    }

    /// Plain gradient descent at the given learning rate.
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            velocity: BTreeMap::new(),
        }
    }
}

impl Optimizer for Sgd {
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

            let mut direction = grad.clone();
            if self.weight_decay != 0.0 {
                direction.add_scaled(name, &entry.value, self.weight_decay)?;
            }

            if self.momentum != 0.0 {
                if let Some(buf) = self.velocity.get_mut(name) {
                    buf.scale(self.momentum);
                    buf.add_scaled(name, &direction, 1.0 - self.dampening)?;
                } else {
                    self.velocity.insert(name.to_string(), direction.clone());
                }
                let buf = &self.velocity[name];
                if self.nesterov {
                    direction.add_scaled(name, buf, self.momentum)?;
                } else {
                    direction = buf.clone();
                }
            }

            entry.value.add_scaled(name, &direction, -self.lr)?;
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
        "SGD"
    }
}
