//! Core types shared across the cohere engine.
//!
//! Wavefields and patterns are dynamic-rank `ndarray` arrays whose last two
//! axes are always the spatial (detector row, detector column) axes. Model
//! state lives in [`Parameters`], a name-ordered map of real or complex
//! arrays; the gradient of a loss with respect to that state lives in a
//! matching [`Gradients`] map.
//!
//! Complex gradients follow the convention
//! $g = \partial L / \partial \mathrm{Re}\,p + i\,\partial L / \partial \mathrm{Im}\,p$,
//! so that $p \leftarrow p - \eta g$ is a steepest-descent step.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Mul, Sub};

use ndarray::{ArrayD, Dimension, IxDyn, Zip};
use num_complex::Complex64;
use thiserror::Error;

/// Complex field sampled on a grid, spatial axes last.
pub type Wavefield = ArrayD<Complex64>;

/// Real, non-negative detector-like readout, spatial axes last.
pub type Pattern = ArrayD<f64>;

/// Errors from combining parameters and gradients.
#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("Unknown parameter '{0}'")]
    Unknown(String),

    #[error("Parameter '{name}' is {expected}, not {found}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Parameter '{name}' has shape {expected:?}, got {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Element types a parameter array can hold.
pub trait Scalar:
    Copy
    + Send
    + Sync
    + Debug
    + PartialEq
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<f64, Output = Self>
    + AddAssign
    + 'static
{
    const ZERO: Self;

    /// $|x|^2$.
    fn norm_sqr(self) -> f64;

    /// $\mathrm{Re}(\bar{x} y)$, the real inner product of two elements.
    fn real_dot(self, other: Self) -> f64;
}

impl Scalar for f64 {
    const ZERO: Self = 0.0;

    fn norm_sqr(self) -> f64 {
        self * self
    }

    fn real_dot(self, other: Self) -> f64 {
        self * other
    }
}

impl Scalar for Complex64 {
    const ZERO: Self = Complex64::new(0.0, 0.0);

    fn norm_sqr(self) -> f64 {
        Complex64::norm_sqr(&self)
    }

    fn real_dot(self, other: Self) -> f64 {
        self.re * other.re + self.im * other.im
    }
}

/// The value of one parameter or gradient entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Real(ArrayD<f64>),
    Complex(ArrayD<Complex64>),
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

fn axpy<T: Scalar>(y: &mut ArrayD<T>, x: &ArrayD<T>, alpha: f64) {
    Zip::from(y).and(x).for_each(|y, &x| *y += x * alpha);
}

fn real_dot<T: Scalar>(a: &ArrayD<T>, b: &ArrayD<T>) -> f64 {
    a.iter().zip(b.iter()).map(|(&a, &b)| a.real_dot(b)).sum()
}

impl ParamValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Real(_) => "real",
            ParamValue::Complex(_) => "complex",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ParamValue::Real(a) => a.shape(),
            ParamValue::Complex(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A zero array of the same kind and shape.
    pub fn zeros_like(&self) -> Self {
        match self {
            ParamValue::Real(a) => ParamValue::Real(ArrayD::zeros(a.raw_dim())),
            ParamValue::Complex(a) => ParamValue::Complex(ArrayD::zeros(a.raw_dim())),
        }
    }

    /// `self += alpha * other`.
    pub fn add_scaled(&mut self, name: &str, other: &ParamValue, alpha: f64) -> Result<(), ParameterError> {
        check_shape(name, self.shape(), other.shape())?;
        match (self, other) {
            (ParamValue::Real(y), ParamValue::Real(x)) => axpy(y, x, alpha),
            (ParamValue::Complex(y), ParamValue::Complex(x)) => axpy(y, x, alpha),
            (y, x) => {
                return Err(ParameterError::KindMismatch {
                    name: name.to_string(),
                    expected: y.kind(),
                    found: x.kind(),
                })
            }
        }
        Ok(())
    }

    pub fn scale(&mut self, alpha: f64) {
        match self {
            ParamValue::Real(a) => a.mapv_inplace(|x| x * alpha),
            ParamValue::Complex(a) => a.mapv_inplace(|x| x * alpha),
        }
    }

    /// Real inner product $\sum \mathrm{Re}(\bar{a} b)$.
    pub fn dot(&self, name: &str, other: &ParamValue) -> Result<f64, ParameterError> {
        check_shape(name, self.shape(), other.shape())?;
        match (self, other) {
            (ParamValue::Real(a), ParamValue::Real(b)) => Ok(real_dot(a, b)),
            (ParamValue::Complex(a), ParamValue::Complex(b)) => Ok(real_dot(a, b)),
            (a, b) => Err(ParameterError::KindMismatch {
                name: name.to_string(),
                expected: a.kind(),
                found: b.kind(),
            }),
        }
    }

    /// Largest element magnitude.
    pub fn abs_max(&self) -> f64 {
        match self {
            ParamValue::Real(a) => a.iter().fold(0.0_f64, |m, x| m.max(x.abs())),
            ParamValue::Complex(a) => a.iter().fold(0.0_f64, |m, x| m.max(x.norm())),
        }
    }

    /// Sum of element magnitudes.
    pub fn abs_sum(&self) -> f64 {
        match self {
            ParamValue::Real(a) => a.iter().map(|x| x.abs()).sum(),
            ParamValue::Complex(a) => a.iter().map(|x| x.norm()).sum(),
        }
    }

    /// Plain real array. Complex values gain a trailing axis of length 2
    /// holding the real and imaginary parts.
    pub fn to_packed(&self) -> ArrayD<f64> {
        match self {
            ParamValue::Real(a) => a.clone(),
            ParamValue::Complex(a) => {
                let ndim = a.ndim();
                let mut shape = a.shape().to_vec();
                shape.push(2);
                ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                    let z = a[&idx.slice()[..ndim]];
                    if idx[ndim] == 0 {
                        z.re
                    } else {
                        z.im
                    }
                })
            }
        }
    }
}

/// A named piece of model state.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: ParamValue,
    /// Frozen parameters receive no gradient and are never stepped.
    pub trainable: bool,
}

impl Parameter {
    pub fn real(value: ArrayD<f64>) -> Self {
        Self {
            value: ParamValue::Real(value),
            trainable: true,
        }
    }

    pub fn complex(value: ArrayD<Complex64>) -> Self {
        Self {
            value: ParamValue::Complex(value),
            trainable: true,
        }
    }

    pub fn frozen(mut self) -> Self {
        self.trainable = false;
        self
    }
}

/// The mutable state a model is fitted through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: BTreeMap<String, Parameter>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, parameter: Parameter) {
        self.entries.insert(name.into(), parameter);
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.entries.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze or unfreeze a parameter.
    pub fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<(), ParameterError> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
        entry.trainable = trainable;
        Ok(())
    }

    pub fn real(&self, name: &str) -> Result<&ArrayD<f64>, ParameterError> {
        match self.get(name).map(|p| &p.value) {
            Some(ParamValue::Real(a)) => Ok(a),
            Some(other) => Err(ParameterError::KindMismatch {
                name: name.to_string(),
                expected: "real",
                found: other.kind(),
            }),
            None => Err(ParameterError::Unknown(name.to_string())),
        }
    }

    pub fn complex(&self, name: &str) -> Result<&ArrayD<Complex64>, ParameterError> {
        match self.get(name).map(|p| &p.value) {
            Some(ParamValue::Complex(a)) => Ok(a),
            Some(other) => Err(ParameterError::KindMismatch {
                name: name.to_string(),
                expected: "complex",
                found: other.kind(),
            }),
            None => Err(ParameterError::Unknown(name.to_string())),
        }
    }

    pub fn complex_mut(&mut self, name: &str) -> Result<&mut ArrayD<Complex64>, ParameterError> {
        match self.entries.get_mut(name).map(|p| &mut p.value) {
            Some(ParamValue::Complex(a)) => Ok(a),
            Some(other) => Err(ParameterError::KindMismatch {
                name: name.to_string(),
                expected: "complex",
                found: other.kind(),
            }),
            None => Err(ParameterError::Unknown(name.to_string())),
        }
    }

    /// Zeroed gradients for every trainable parameter.
    pub fn zero_gradients(&self) -> Gradients {
        let entries = self
            .entries
            .iter()
            .filter(|(_, p)| p.trainable)
            .map(|(k, p)| (k.clone(), p.value.zeros_like()))
            .collect();
        Gradients { entries }
    }

    /// `p += alpha * g` for every trainable parameter with a gradient.
    pub fn add_scaled(&mut self, direction: &Gradients, alpha: f64) -> Result<(), ParameterError> {
        for (name, step) in direction.iter() {
            let entry = self
                .entries
                .get_mut(name)
                .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
            if entry.trainable {
                entry.value.add_scaled(name, step, alpha)?;
            }
        }
        Ok(())
    }

    /// Trainable parameter values, in the same layout as a [`Gradients`].
    pub fn trainable_values(&self) -> Gradients {
        let entries = self
            .entries
            .iter()
            .filter(|(_, p)| p.trainable)
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .collect();
        Gradients { entries }
    }

    /// Detached plain-array copy of every parameter, complex values packed.
    pub fn packed(&self) -> BTreeMap<String, ArrayD<f64>> {
        self.entries
            .iter()
            .map(|(k, p)| (k.clone(), p.value.to_packed()))
            .collect()
    }
}

/// Gradient of a scalar loss with respect to the trainable parameters.
///
/// Also used as a generic direction in parameter space by the optimizers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gradients {
    entries: BTreeMap<String, ParamValue>,
}

impl Gradients {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` when gradients for `name` are being collected.
    pub fn tracks(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Mutable access to a real gradient, `None` if the parameter is frozen.
    pub fn real_mut(&mut self, name: &str) -> Option<&mut ArrayD<f64>> {
        match self.entries.get_mut(name) {
            Some(ParamValue::Real(a)) => Some(a),
            _ => None,
        }
    }

    /// Mutable access to a complex gradient, `None` if the parameter is frozen.
    pub fn complex_mut(&mut self, name: &str) -> Option<&mut ArrayD<Complex64>> {
        match self.entries.get_mut(name) {
            Some(ParamValue::Complex(a)) => Some(a),
            _ => None,
        }
    }

    /// Add a contribution to the gradient of `name`. Contributions to
    /// parameters that are not tracked are dropped.
    pub fn accumulate_value(&mut self, name: &str, value: &ParamValue) -> Result<(), ParameterError> {
        match self.entries.get_mut(name) {
            Some(entry) => entry.add_scaled(name, value, 1.0),
            None => Ok(()),
        }
    }

    /// Sum another gradient set into this one.
    pub fn accumulate(&mut self, other: &Gradients) -> Result<(), ParameterError> {
        for (name, value) in other.iter() {
            match self.entries.get_mut(name) {
                Some(entry) => entry.add_scaled(name, value, 1.0)?,
                None => {
                    self.entries.insert(name.to_string(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// `self += alpha * other`.
    pub fn add_scaled(&mut self, other: &Gradients, alpha: f64) -> Result<(), ParameterError> {
        for (name, value) in other.iter() {
            let entry = self
                .entries
                .get_mut(name)
                .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
            entry.add_scaled(name, value, alpha)?;
        }
        Ok(())
    }

    pub fn scale(&mut self, alpha: f64) {
        for value in self.entries.values_mut() {
            value.scale(alpha);
        }
    }

    /// Real inner product over all entries.
    pub fn dot(&self, other: &Gradients) -> Result<f64, ParameterError> {
        let mut total = 0.0;
        for (name, value) in self.iter() {
            let theirs = other
                .get(name)
                .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
            total += value.dot(name, theirs)?;
        }
        Ok(total)
    }

    pub fn abs_max(&self) -> f64 {
        self.entries.values().fold(0.0_f64, |m, v| m.max(v.abs_max()))
    }

    pub fn abs_sum(&self) -> f64 {
        self.entries.values().map(ParamValue::abs_sum).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn toy_parameters() -> Parameters {
        let mut params = Parameters::new();
        params.insert("a", Parameter::real(arr1(&[1.0, 2.0]).into_dyn()));
        params.insert(
            "b",
            Parameter::complex(arr1(&[Complex64::new(1.0, -1.0)]).into_dyn()),
        );
        params.insert("c", Parameter::real(arr1(&[5.0]).into_dyn()).frozen());
        params
    }

    #[test]
    fn test_zero_gradients_skip_frozen() {
        let grads = toy_parameters().zero_gradients();
        assert!(grads.tracks("a"));
        assert!(grads.tracks("b"));
        assert!(!grads.tracks("c"));
        assert_abs_diff_eq!(grads.abs_sum(), 0.0);
    }

    #[test]
    fn test_add_scaled_steps_trainable_only() {
        let mut params = toy_parameters();
        let mut grads = params.zero_gradients();
        grads.real_mut("a").unwrap().fill(1.0);
        grads.complex_mut("b").unwrap().fill(Complex64::new(0.0, 2.0));

        params.add_scaled(&grads, -0.5).unwrap();
        assert_abs_diff_eq!(params.real("a").unwrap()[[0]], 0.5);
        assert_abs_diff_eq!(params.complex("b").unwrap()[[0]].im, -2.0);
        assert_abs_diff_eq!(params.real("c").unwrap()[[0]], 5.0);
    }

    #[test]
    fn test_complex_dot_is_real_inner_product() {
        let mut grads = toy_parameters().zero_gradients();
        grads.complex_mut("b").unwrap().fill(Complex64::new(3.0, 4.0));
        // |3 + 4i|^2
        assert_abs_diff_eq!(grads.dot(&grads).unwrap(), 25.0);
        assert_abs_diff_eq!(grads.abs_max(), 5.0);
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let mut value = ParamValue::Real(ArrayD::zeros(IxDyn(&[1])));
        let other = ParamValue::Complex(ArrayD::zeros(IxDyn(&[1])));
        assert!(matches!(
            value.add_scaled("x", &other, 1.0),
            Err(ParameterError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_packed_complex_gains_trailing_axis() {
        let packed = toy_parameters().packed();
        assert_eq!(packed["b"].shape(), &[1, 2]);
        assert_abs_diff_eq!(packed["b"][[0, 0]], 1.0);
        assert_abs_diff_eq!(packed["b"][[0, 1]], -1.0);
        assert_eq!(packed["a"].shape(), &[2]);
    }
}
