//! Limited-memory BFGS with a fixed step length.
//!
//! One call to [`Optimizer::step`] runs up to `max_iter` inner iterations,
//! re-evaluating the objective after each one. Curvature pairs persist across
//! calls, so consecutive epochs keep refining the same inverse-Hessian
//! estimate. Pairs with non-positive curvature (`y·s <= 1e-10`) are skipped.

use std::collections::VecDeque;

use cohere_core::Gradients;
use log::debug;

use crate::config::LbfgsConfig;
use crate::optimizer::{Objective, OptimizeError, Optimizer};

/// State carried between steps.
#[derive(Debug, Clone, Default)]
struct History {
    iterations: usize,
    evaluations: usize,
    /// Last search direction and step length.
    direction: Option<Gradients>,
    step_length: f64,
    /// Gradient differences `y`, parameter differences `s`, and `1 / y·s`.
    grad_diffs: VecDeque<Gradients>,
    steps: VecDeque<Gradients>,
    rho: VecDeque<f64>,
    hessian_diag: f64,
    prev_grad: Option<Gradients>,
}

#[derive(Debug, Clone)]
pub struct Lbfgs {
    lr: f64,
    max_iter: usize,
    max_eval: usize,
    history_size: usize,
    tolerance_grad: f64,
    tolerance_change: f64,
    history: History,
}

impl Lbfgs {
    pub fn new(config: &LbfgsConfig) -> Result<Self, OptimizeError> {
        if config.max_iter == 0 || config.history_size == 0 {
            return Err(OptimizeError::Config(
                "L-BFGS needs at least one iteration and one history slot".into(),
            ));
        }
        if config.lr <= 0.0 {
            return Err(OptimizeError::Config(format!(
                "L-BFGS learning rate must be positive, got {}",
                config.lr
            )));
        }
        Ok(Self {
            lr: config.lr,
            max_iter: config.max_iter,
            max_eval: config.max_eval.unwrap_or(config.max_iter * 5 / 4),
            history_size: config.history_size,
            tolerance_grad: config.tolerance_grad,
            tolerance_change: config.tolerance_change,
            history: History::default(),
        })
    }

    /// Total objective evaluations across every step so far.
    pub fn evaluations(&self) -> usize {
        self.history.evaluations
    }

    /// Two-loop recursion: `-H g` from the stored curvature pairs.
    fn search_direction(&self, grad: &Gradients) -> Result<Gradients, OptimizeError> {
        let h = &self.history;
        let count = h.grad_diffs.len();
        let mut alpha = vec![0.0; count];

        let mut q = grad.clone();
        q.scale(-1.0);
        for i in (0..count).rev() {
            alpha[i] = h.steps[i].dot(&q)? * h.rho[i];
            q.add_scaled(&h.grad_diffs[i], -alpha[i])?;
        }

        q.scale(h.hessian_diag);
        for i in 0..count {
            let beta = h.grad_diffs[i].dot(&q)? * h.rho[i];
            q.add_scaled(&h.steps[i], alpha[i] - beta)?;
        }
        Ok(q)
    }

    /// Fold the latest curvature pair into the history.
    fn update_history(&mut self, grad: &Gradients) -> Result<(), OptimizeError> {
        let (Some(prev_grad), Some(direction)) = (&self.history.prev_grad, &self.history.direction) else {
            return Ok(());
        };
        let mut y = grad.clone();
        y.add_scaled(prev_grad, -1.0)?;
        let mut s = direction.clone();
        s.scale(self.history.step_length);
        let ys = y.dot(&s)?;

        if ys > 1e-10 {
            let h = &mut self.history;
            if h.grad_diffs.len() == self.history_size {
                h.grad_diffs.pop_front();
                h.steps.pop_front();
                h.rho.pop_front();
            }
            h.hessian_diag = ys / y.dot(&y)?;
            h.grad_diffs.push_back(y);
            h.steps.push_back(s);
            h.rho.push_back(1.0 / ys);
        }
        Ok(())
    }
}

impl Optimizer for Lbfgs {
    fn step(&mut self, objective: &mut dyn Objective) -> Result<f64, OptimizeError> {
        let (orig_loss, mut grad) = objective.evaluate()?;
        let mut loss = orig_loss;
        let mut current_evals = 1;
        self.history.evaluations += 1;

        if grad.abs_max() <= self.tolerance_grad {
            return Ok(orig_loss);
        }

        let mut n_iter = 0;
        while n_iter < self.max_iter {
            n_iter += 1;
            self.history.iterations += 1;

            let direction = if self.history.iterations == 1 {
                self.history.hessian_diag = 1.0;
                let mut d = grad.clone();
                d.scale(-1.0);
                d
            } else {
                self.update_history(&grad)?;
                self.search_direction(&grad)?
            };

            let prev_loss = loss;
            let step_length = if self.history.iterations == 1 {
                (1.0 / grad.abs_sum()).min(1.0) * self.lr
            } else {
                self.lr
            };

            let gtd = grad.dot(&direction)?;
            if gtd > -self.tolerance_change {
                self.history.prev_grad = Some(grad);
                self.history.direction = Some(direction);
                self.history.step_length = step_length;
                break;
            }

            objective.parameters_mut().add_scaled(&direction, step_length)?;
            let step_size = direction.abs_max() * step_length;
            self.history.prev_grad = Some(grad.clone());
            self.history.direction = Some(direction);
            self.history.step_length = step_length;

            if n_iter == self.max_iter {
                break;
            }
            let (new_loss, new_grad) = objective.evaluate()?;
            loss = new_loss;
            grad = new_grad;
            current_evals += 1;
            self.history.evaluations += 1;

            if current_evals >= self.max_eval
                || grad.abs_max() <= self.tolerance_grad
                || step_size <= self.tolerance_change
                || (loss - prev_loss).abs() < self.tolerance_change
            {
                break;
            }
        }
        debug!("L-BFGS step: {} iterations, {} evaluations", n_iter, current_evals);
        Ok(orig_loss)
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn name(&self) -> &'static str {
        "L-BFGS"
    }
}
