//! Detector measurement models.
//!
//! These functions turn a simulated detector-plane wavefield into the
//! non-negative readout an area detector would record. The pipeline order is
//! fixed and load-bearing for both the simulated counts and their gradients:
//!
//! 1. $|w|^2$ (summed over the incoherent axis for [`incoherent_sum`]);
//! 2. average every $k \times k$ block when `oversampling = k > 1`;
//! 3. restrict to the detector slice;
//! 4. add `epsilon`;
//! 5. add the squared background ([`quadratic_background`] only);
//! 6. clamp into `[0, saturation]`.
//!
//! Each forward function has a `_backward` companion that maps a gradient on
//! the readout to a gradient on the wavefield (see [`crate::types`] for the
//! complex gradient convention).

use std::ops::Range;

use ndarray::{ArrayD, Axis, Dimension, IxDyn, Slice, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Pattern, Wavefield};

/// Errors raised by the measurement models.
#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("Shape mismatch: {0}")]
    Shape(String),
}

/// Region of the (binned) simulation grid covered by the detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorSlice {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl DetectorSlice {
    pub fn new(rows: Range<usize>, cols: Range<usize>) -> Self {
        Self { rows, cols }
    }

    /// Output shape of the slice.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.cols.len())
    }
}

/// Detector response shared by all measurement models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementOptions {
    #[serde(default)]
    pub detector_slice: Option<DetectorSlice>,
    /// Offset keeping every readout strictly positive.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Well depth: readouts are clamped into `[0, saturation]`.
    #[serde(default)]
    pub saturation: Option<f64>,
    /// Simulation pixels per detector pixel along each axis.
    #[serde(default = "default_oversampling")]
    pub oversampling: usize,
}

fn default_epsilon() -> f64 {
    1e-7
}

fn default_oversampling() -> usize {
    1
}

impl Default for MeasurementOptions {
    fn default() -> Self {
        Self {
            detector_slice: None,
            epsilon: default_epsilon(),
            saturation: None,
            oversampling: default_oversampling(),
        }
    }
}

impl MeasurementOptions {
    pub fn with_slice(mut self, slice: DetectorSlice) -> Self {
        self.detector_slice = Some(slice);
        self
    }

    pub fn with_saturation(mut self, saturation: f64) -> Self {
        self.saturation = Some(saturation);
        self
    }

    pub fn with_oversampling(mut self, oversampling: usize) -> Self {
        self.oversampling = oversampling;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// The same options with saturation disabled.
    fn unsaturated(&self) -> Self {
        Self {
            saturation: None,
            ..self.clone()
        }
    }

    /// Detector-plane shape produced from a simulation grid of `(m, n)`.
    pub fn output_shape(&self, m: usize, n: usize) -> (usize, usize) {
        match &self.detector_slice {
            Some(slice) => slice.shape(),
            None => (m / self.oversampling.max(1), n / self.oversampling.max(1)),
        }
    }
}

/// Which incoherent measurement a background is added to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    #[default]
    Intensity,
    IncoherentSum,
}

impl MeasurementKind {
    pub fn apply(&self, wavefield: &Wavefield, options: &MeasurementOptions) -> Result<Pattern, MeasurementError> {
        match self {
            MeasurementKind::Intensity => intensity(wavefield, options),
            MeasurementKind::IncoherentSum => incoherent_sum(wavefield, options),
        }
    }

    pub fn backward(
        &self,
        wavefield: &Wavefield,
        grad_output: &Pattern,
        options: &MeasurementOptions,
    ) -> Result<Wavefield, MeasurementError> {
        match self {
            MeasurementKind::Intensity => intensity_backward(wavefield, grad_output, options),
            MeasurementKind::IncoherentSum => incoherent_sum_backward(wavefield, grad_output, options),
        }
    }
}

/// Intensity $|w|^2$ of a stack of wavefields, shape `(..., M, N)`.
pub fn intensity(wavefield: &Wavefield, options: &MeasurementOptions) -> Result<Pattern, MeasurementError> {
    spatial_shape(wavefield.shape())?;
    let raw = wavefield.mapv(|z| z.norm_sqr());
    let pre = detect(&raw, options)?;
    Ok(saturate(pre, options.saturation))
}

/// Gradient of [`intensity`] with respect to the wavefield.
pub fn intensity_backward(
    wavefield: &Wavefield,
    grad_output: &Pattern,
    options: &MeasurementOptions,
) -> Result<Wavefield, MeasurementError> {
    spatial_shape(wavefield.shape())?;
    let raw = wavefield.mapv(|z| z.norm_sqr());
    let grad_raw = detect_backward(&raw, grad_output, options)?;
    let mut grad = wavefield.clone();
    Zip::from(&mut grad)
        .and(&grad_raw)
        .for_each(|w, &g| *w = *w * (2.0 * g));
    Ok(grad)
}

/// Intensities summed over the leading (incoherent mode) axis, shape
/// `(L, ..., M, N)` to `(..., M', N')`.
pub fn incoherent_sum(wavefields: &Wavefield, options: &MeasurementOptions) -> Result<Pattern, MeasurementError> {
    let raw = summed_intensity(wavefields)?;
    let pre = detect(&raw, options)?;
    Ok(saturate(pre, options.saturation))
}

/// Gradient of [`incoherent_sum`] with respect to every mode.
pub fn incoherent_sum_backward(
    wavefields: &Wavefield,
    grad_output: &Pattern,
    options: &MeasurementOptions,
) -> Result<Wavefield, MeasurementError> {
    let raw = summed_intensity(wavefields)?;
    let grad_raw = detect_backward(&raw, grad_output, options)?;
    let grad_raw = grad_raw
        .broadcast(wavefields.raw_dim())
        .ok_or_else(|| MeasurementError::Shape("cannot broadcast gradient over modes".into()))?;
    let mut grad = wavefields.clone();
    Zip::from(&mut grad)
        .and(&grad_raw)
        .for_each(|w, &g| *w = *w * (2.0 * g));
    Ok(grad)
}

/// Measurement plus a squared background, $I + b^2$.
///
/// `background` holds the square root of the detector background and has the
/// detector-plane shape; it broadcasts over any leading axes. Squaring keeps
/// the fitted background non-negative for any real value. Saturation is only
/// applied after the background is added.
pub fn quadratic_background(
    wavefield: &Wavefield,
    background: &Pattern,
    options: &MeasurementOptions,
    kind: MeasurementKind,
) -> Result<Pattern, MeasurementError> {
    let pre = background_sum(wavefield, background, options, kind)?;
    Ok(saturate(pre, options.saturation))
}

/// Gradients of [`quadratic_background`] with respect to the wavefield and
/// the background.
pub fn quadratic_background_backward(
    wavefield: &Wavefield,
    background: &Pattern,
    grad_output: &Pattern,
    options: &MeasurementOptions,
    kind: MeasurementKind,
) -> Result<(Wavefield, Pattern), MeasurementError> {
    let pre = background_sum(wavefield, background, options, kind)?;
    check_same_shape(pre.shape(), grad_output.shape())?;
    let grad_pre = saturate_backward(&pre, grad_output, options.saturation);

    let mut grad_background = grad_pre.clone();
    let background_view = background.broadcast(grad_pre.raw_dim()).ok_or_else(|| {
        MeasurementError::Shape("background does not broadcast to the readout".into())
    })?;
    Zip::from(&mut grad_background)
        .and(&background_view)
        .for_each(|g, &b| *g *= 2.0 * b);
    while grad_background.ndim() > background.ndim() {
        grad_background = grad_background.sum_axis(Axis(0));
    }

    let grad_wave = kind.backward(wavefield, &grad_pre, &options.unsaturated())?;
    Ok((grad_wave, grad_background))
}

fn background_sum(
    wavefield: &Wavefield,
    background: &Pattern,
    options: &MeasurementOptions,
    kind: MeasurementKind,
) -> Result<Pattern, MeasurementError> {
    let base = kind.apply(wavefield, &options.unsaturated())?;
    if background.ndim() > base.ndim()
        || background.shape() != &base.shape()[base.ndim() - background.ndim()..]
    {
        return Err(MeasurementError::Shape(format!(
            "background shape {:?} does not match readout shape {:?}",
            background.shape(),
            base.shape()
        )));
    }
    let squared = background.mapv(|b| b * b);
    let squared = squared.broadcast(base.raw_dim()).ok_or_else(|| {
        MeasurementError::Shape("background does not broadcast to the readout".into())
    })?;
    Ok(base + &squared)
}

fn summed_intensity(wavefields: &Wavefield) -> Result<Pattern, MeasurementError> {
    if wavefields.ndim() < 3 {
        return Err(MeasurementError::Shape(format!(
            "incoherent sum needs a mode axis and two spatial axes, got shape {:?}",
            wavefields.shape()
        )));
    }
    Ok(wavefields.mapv(|z| z.norm_sqr()).sum_axis(Axis(0)))
}

fn spatial_shape(shape: &[usize]) -> Result<(usize, usize), MeasurementError> {
    match shape {
        [.., m, n] => Ok((*m, *n)),
        _ => Err(MeasurementError::Shape(format!(
            "expected at least two spatial axes, got shape {:?}",
            shape
        ))),
    }
}

fn check_same_shape(expected: &[usize], found: &[usize]) -> Result<(), MeasurementError> {
    if expected != found {
        return Err(MeasurementError::Shape(format!(
            "gradient shape {:?} does not match readout shape {:?}",
            found, expected
        )));
    }
    Ok(())
}

/// Steps 2-4: bin, slice, add epsilon.
fn detect(raw: &Pattern, options: &MeasurementOptions) -> Result<Pattern, MeasurementError> {
    let binned = bin(raw, options.oversampling)?;
    let mut out = match &options.detector_slice {
        Some(slice) => crop(&binned, slice)?,
        None => binned,
    };
    out.mapv_inplace(|x| x + options.epsilon);
    Ok(out)
}

/// Adjoint of [`detect`] followed by [`saturate`].
fn detect_backward(
    raw: &Pattern,
    grad_output: &Pattern,
    options: &MeasurementOptions,
) -> Result<Pattern, MeasurementError> {
    let pre = detect(raw, options)?;
    check_same_shape(pre.shape(), grad_output.shape())?;
    let grad_pre = saturate_backward(&pre, grad_output, options.saturation);

    let binned_shape = binned_shape(raw.shape(), options.oversampling);
    let grad_binned = match &options.detector_slice {
        Some(slice) => uncrop(&grad_pre, &binned_shape, slice),
        None => grad_pre,
    };
    Ok(unbin(&grad_binned, options.oversampling, raw.shape()))
}

fn saturate(mut pre: Pattern, saturation: Option<f64>) -> Pattern {
    if let Some(max) = saturation {
        pre.mapv_inplace(|x| x.clamp(0.0, max));
    }
    pre
}

/// The clamp passes gradient only where its input lies inside the bounds.
fn saturate_backward(pre: &Pattern, grad_output: &Pattern, saturation: Option<f64>) -> Pattern {
    match saturation {
        None => grad_output.clone(),
        Some(max) => {
            let mut grad = grad_output.clone();
            Zip::from(&mut grad).and(pre).for_each(|g, &x| {
                if !(0.0..=max).contains(&x) {
                    *g = 0.0;
                }
            });
            grad
        }
    }
}

fn binned_shape(shape: &[usize], factor: usize) -> Vec<usize> {
    let mut out = shape.to_vec();
    let nd = out.len();
    if factor > 1 {
        out[nd - 2] /= factor;
        out[nd - 1] /= factor;
    }
    out
}

/// Average non-overlapping `factor x factor` blocks of the last two axes.
fn bin(raw: &Pattern, factor: usize) -> Result<Pattern, MeasurementError> {
    if factor <= 1 {
        return Ok(raw.clone());
    }
    let (m, n) = spatial_shape(raw.shape())?;
    if m % factor != 0 || n % factor != 0 {
        return Err(MeasurementError::Shape(format!(
            "spatial shape ({m}, {n}) is not divisible by oversampling {factor}"
        )));
    }
    let nd = raw.ndim();
    let out_shape = binned_shape(raw.shape(), factor);
    let norm = 1.0 / (factor * factor) as f64;
    Ok(ArrayD::from_shape_fn(IxDyn(&out_shape), |idx| {
        let mut src = idx.slice().to_vec();
        let mut total = 0.0;
        for di in 0..factor {
            for dj in 0..factor {
                src[nd - 2] = idx[nd - 2] * factor + di;
                src[nd - 1] = idx[nd - 1] * factor + dj;
                total += raw[src.as_slice()];
            }
        }
        total * norm
    }))
}

/// Adjoint of [`bin`]: every source pixel receives `g / factor^2`.
fn unbin(grad: &Pattern, factor: usize, raw_shape: &[usize]) -> Pattern {
    if factor <= 1 {
        return grad.clone();
    }
    let nd = raw_shape.len();
    let norm = 1.0 / (factor * factor) as f64;
    ArrayD::from_shape_fn(IxDyn(raw_shape), |idx| {
        let mut dst = idx.slice().to_vec();
        dst[nd - 2] /= factor;
        dst[nd - 1] /= factor;
        grad[dst.as_slice()] * norm
    })
}

fn crop(binned: &Pattern, slice: &DetectorSlice) -> Result<Pattern, MeasurementError> {
    let (m, n) = spatial_shape(binned.shape())?;
    if slice.rows.end > m || slice.cols.end > n || slice.rows.is_empty() || slice.cols.is_empty() {
        return Err(MeasurementError::Shape(format!(
            "detector slice {:?} x {:?} does not fit the ({m}, {n}) grid",
            slice.rows, slice.cols
        )));
    }
    let nd = binned.ndim();
    Ok(binned
        .slice_each_axis(|ax| axis_slice(ax.axis.index(), nd, slice))
        .to_owned())
}

/// Adjoint of [`crop`]: scatter into a zeroed grid.
fn uncrop(grad: &Pattern, binned_shape: &[usize], slice: &DetectorSlice) -> Pattern {
    let nd = binned_shape.len();
    let mut full = ArrayD::zeros(IxDyn(binned_shape));
    full.slice_each_axis_mut(|ax| axis_slice(ax.axis.index(), nd, slice))
        .assign(grad);
    full
}

fn axis_slice(axis: usize, nd: usize, slice: &DetectorSlice) -> Slice {
    if axis == nd - 2 {
        Slice::from(slice.rows.clone())
    } else if axis == nd - 1 {
        Slice::from(slice.cols.clone())
    } else {
        Slice::from(..)
    }
}

/// Convenience for building a real pattern from complex intensities in tests
/// and simulations: elementwise $|w|^2$ with no detector response.
pub fn raw_intensity(wavefield: &Wavefield) -> Pattern {
    wavefield.mapv(|z: Complex64| z.norm_sqr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3};

    fn ramp(shape: &[usize]) -> Wavefield {
        let mut k = 0.0;
        ArrayD::from_shape_fn(IxDyn(shape), |_| {
            k += 1.0;
            Complex64::new(0.1 * k, -0.05 * k + 0.3)
        })
    }

    #[test]
    fn test_intensity_is_abs_squared_plus_epsilon() {
        let w = ramp(&[2, 3, 3]);
        let opts = MeasurementOptions::default().with_epsilon(1e-3);
        let out = intensity(&w, &opts).unwrap();
        for (z, i) in w.iter().zip(out.iter()) {
            assert_abs_diff_eq!(*i, z.norm_sqr() + 1e-3, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_oversampling_averages_blocks() {
        let w = ramp(&[4, 6]);
        let opts = MeasurementOptions::default().with_epsilon(0.0).with_oversampling(2);
        let out = intensity(&w, &opts).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        let raw = raw_intensity(&w);
        let expected = (raw[[2, 4]] + raw[[2, 5]] + raw[[3, 4]] + raw[[3, 5]]) / 4.0;
        assert_abs_diff_eq!(out[[1, 2]], expected, epsilon = 1e-14);
    }

    #[test]
    fn test_oversampling_must_divide_grid() {
        let w = ramp(&[5, 6]);
        let opts = MeasurementOptions::default().with_oversampling(2);
        assert!(matches!(intensity(&w, &opts), Err(MeasurementError::Shape(_))));
    }

    #[test]
    fn test_slice_then_saturation() {
        let w = ramp(&[1, 4, 4]);
        let opts = MeasurementOptions::default()
            .with_slice(DetectorSlice::new(1..3, 0..2))
            .with_saturation(0.5);
        let out = intensity(&w, &opts).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert!(out.iter().all(|&x| (0.0..=0.5).contains(&x)));
    }

    #[test]
    fn test_incoherent_sum_sums_before_binning() {
        let w = ramp(&[3, 2, 4, 4]);
        let opts = MeasurementOptions::default().with_oversampling(2);
        let out = incoherent_sum(&w, &opts).unwrap();
        assert_eq!(out.shape(), &[2, 2, 2]);

        let plain = MeasurementOptions::default().with_epsilon(0.0).with_oversampling(2);
        let mut expected = Array3::<f64>::zeros((2, 2, 2)).into_dyn();
        for mode in w.axis_iter(Axis(0)) {
            expected = expected + intensity(&mode.to_owned(), &plain).unwrap();
        }
        for (a, b) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b + 1e-7, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_quadratic_background_is_nonnegative() {
        let w = ramp(&[2, 3, 3]) * Complex64::new(0.0, 0.0);
        let background = Array2::from_elem((3, 3), -4.0).into_dyn();
        let out = quadratic_background(&w, &background, &MeasurementOptions::default(), MeasurementKind::Intensity)
            .unwrap();
        assert_eq!(out.shape(), &[2, 3, 3]);
        for &x in out.iter() {
            assert_abs_diff_eq!(x, 16.0 + 1e-7, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_background_added_before_saturation() {
        let w = ramp(&[3, 3]) * Complex64::new(0.0, 0.0);
        let background = Array2::from_elem((3, 3), 2.0).into_dyn();
        let opts = MeasurementOptions::default().with_saturation(3.0);
        let out = quadratic_background(&w, &background, &opts, MeasurementKind::Intensity).unwrap();
        // 4 + eps clamps to the saturation ceiling
        assert!(out.iter().all(|&x| x == 3.0));
    }

    /// Central finite difference of `sum(c * f(w))` along a single complex
    /// direction of one element.
    fn check_wave_gradient<F>(w: &Wavefield, weights: &Pattern, grad: &Wavefield, f: F)
    where
        F: Fn(&Wavefield) -> Pattern,
    {
        let h = 1e-6;
        let objective = |w: &Wavefield| (f(w) * weights).sum();
        for flat in [0, w.len() / 2, w.len() - 1] {
            for dir in [Complex64::new(1.0, 0.0), Complex64::new(0.0, 1.0)] {
                let mut plus = w.clone();
                let mut minus = w.clone();
                *plus.iter_mut().nth(flat).unwrap() += dir * h;
                *minus.iter_mut().nth(flat).unwrap() -= dir * h;
                let fd = (objective(&plus) - objective(&minus)) / (2.0 * h);
                let g = grad.iter().nth(flat).unwrap();
                let analytic = if dir.re != 0.0 { g.re } else { g.im };
                assert_abs_diff_eq!(fd, analytic, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_intensity_backward_matches_finite_difference() {
        let w = ramp(&[2, 4, 4]);
        let opts = MeasurementOptions::default()
            .with_oversampling(2)
            .with_slice(DetectorSlice::new(0..2, 1..2));
        let weights = ArrayD::from_shape_fn(IxDyn(&[2, 2, 1]), |idx| 1.0 + idx[1] as f64);
        let grad = intensity_backward(&w, &weights, &opts).unwrap();
        check_wave_gradient(&w, &weights, &grad, |w| intensity(w, &opts).unwrap());
    }

    #[test]
    fn test_incoherent_sum_backward_matches_finite_difference() {
        let w = ramp(&[2, 1, 2, 2]);
        let opts = MeasurementOptions::default();
        let weights = ArrayD::from_elem(IxDyn(&[1, 2, 2]), 0.7);
        let grad = incoherent_sum_backward(&w, &weights, &opts).unwrap();
        check_wave_gradient(&w, &weights, &grad, |w| incoherent_sum(w, &opts).unwrap());
    }

    #[test]
    fn test_saturated_pixels_pass_no_gradient() {
        let w = ArrayD::from_elem(IxDyn(&[2, 2]), Complex64::new(2.0, 0.0));
        let opts = MeasurementOptions::default().with_saturation(1.0);
        let weights = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0);
        let grad = intensity_backward(&w, &weights, &opts).unwrap();
        assert!(grad.iter().all(|z| z.norm() == 0.0));
    }

    #[test]
    fn test_background_gradient() {
        let w = ramp(&[2, 2, 2]);
        let background = Array2::from_shape_vec((2, 2), vec![0.5, -1.0, 2.0, 0.0])
            .unwrap()
            .into_dyn();
        let weights = ArrayD::from_elem(IxDyn(&[2, 2, 2]), 1.0);
        let (_, grad_bg) = quadratic_background_backward(
            &w,
            &background,
            &weights,
            &MeasurementOptions::default(),
            MeasurementKind::Intensity,
        )
        .unwrap();
        // d/db sum_batch (b^2) = 2 * batch * b
        for (g, b) in grad_bg.iter().zip(background.iter()) {
            assert_abs_diff_eq!(*g, 4.0 * b, epsilon = 1e-12);
        }
    }
}
