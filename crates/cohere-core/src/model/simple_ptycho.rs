//! Far-field 2D ptychography with one probe and one object.
//!
//! Each exit wave is the probe times the window of the object it illuminates.
//! Windows sit at rounded pixel positions derived from the stage translation
//! through the probe basis, so translations never interpolate. The detector
//! sees the centered far-field intensity, optionally on top of a fitted
//! quadratic background, and the fit uses an amplitude MSE by default.
//!
//! Parameters:
//!
//! | name         | kind    | shape                     |
//! |--------------|---------|---------------------------|
//! | `probe`      | complex | `(M, N)`, scaled by `probe_norm` |
//! | `obj`        | complex | `(Y, X)`                  |
//! | `background` | real    | detector shape, optional  |

use std::collections::BTreeMap;
use std::ops::Range;

use cohere_data::{DataLoader, Dataset, DatasetError, DetectorGeometry, Ptycho2DDataset, PtychoInput};
use log::debug;
use ndarray::{arr0, arr1, s, Array2, Array3, ArrayD, Axis, Ix2, Ix3};
use num_complex::Complex64;

use super::{ForwardModel, ModelError, Simulate};
use crate::losses::LossKind;
use crate::measurement::{
    intensity, intensity_backward, quadratic_background, quadratic_background_backward, DetectorSlice,
    MeasurementKind, MeasurementOptions,
};
use crate::projectors::modulus;
use crate::propagators::{far_field, inverse_far_field};
use crate::types::{Gradients, ParamValue, Parameter, Parameters, Pattern, Wavefield};

const PROBE: &str = "probe";
const OBJECT: &str = "obj";
const BACKGROUND: &str = "background";

/// Reference ptychography geometry.
#[derive(Debug, Clone)]
pub struct SimplePtycho {
    params: Parameters,
    /// Illumination wavelength (m).
    pub wavelength: f64,
    detector_geometry: DetectorGeometry,
    /// Real-space step of one probe pixel along rows and columns, 3x2 (m).
    pub probe_basis: [[f64; 2]; 3],
    /// Pixel offset subtracted from every translation so windows start at 0.
    pub min_translation: [f64; 2],
    probe_norm: f64,
    measurement: MeasurementOptions,
    loss: LossKind,
    mask: Option<Array2<bool>>,
}

impl SimplePtycho {
    /// Model from a probe and object guess. The probe is stored divided by
    /// its peak amplitude so both parameters learn at comparable rates.
    pub fn new(
        wavelength: f64,
        detector_geometry: DetectorGeometry,
        probe_basis: [[f64; 2]; 3],
        probe_guess: Array2<Complex64>,
        obj_guess: Array2<Complex64>,
    ) -> Self {
        let peak = probe_guess.iter().fold(0.0_f64, |m, z| m.max(z.norm()));
        let probe_norm = if peak > 0.0 { peak } else { 1.0 };

        let mut params = Parameters::new();
        params.insert(PROBE, Parameter::complex(probe_guess.mapv(|z| z / probe_norm).into_dyn()));
        params.insert(OBJECT, Parameter::complex(obj_guess.into_dyn()));

        Self {
            params,
            wavelength,
            detector_geometry,
            probe_basis,
            min_translation: [0.0, 0.0],
            probe_norm,
            measurement: MeasurementOptions::default(),
            loss: LossKind::default(),
            mask: None,
        }
    }

    /// Initialize every piece of the model from a dataset.
    ///
    /// The centroid of the summed patterns fixes an exit-wave grid whose zero
    /// frequency lands on it, and the detector becomes a slice of that grid.
    /// The probe basis follows from the grid and the detector geometry, the
    /// object is sized to cover every translation, and the probe guess is the
    /// back-propagated root of the mean pattern.
    pub fn from_dataset(dataset: &Ptycho2DDataset) -> Result<Self, ModelError> {
        let geometry = &dataset.detector_geometry;
        let distance = geometry.distance.ok_or(ModelError::MissingGeometry("distance"))?;
        let det_basis = geometry.basis.ok_or(ModelError::MissingGeometry("basis"))?;

        let center = centroid(&dataset.patterns().sum_axis(Axis(0)), dataset.mask.as_ref());
        let (probe_shape, det_slice) = exit_wave_geometry(dataset.pattern_shape(), center);
        let probe_basis = far_field_probe_basis(&det_basis, probe_shape, dataset.wavelength, distance)?;

        let pixel_translations = dataset
            .translations()
            .iter()
            .map(|t| translation_to_pixel(&probe_basis, t))
            .collect::<Result<Vec<_>, _>>()?;
        let (obj_shape, min_translation) = object_setup(probe_shape, &pixel_translations);

        let probe = sharp_probe(dataset, probe_shape, &det_slice)?;
        let obj = Array2::from_elem(obj_shape, Complex64::new(1.0, 0.0));
        debug!(
            "SimplePtycho from dataset: centroid {:?}, probe {:?}, detector slice {:?}, object {:?}, min translation {:?}",
            center, probe_shape, det_slice, obj_shape, min_translation
        );

        let mut model = Self::new(dataset.wavelength, geometry.clone(), probe_basis, probe, obj)
            .with_min_translation(min_translation)
            .with_measurement(MeasurementOptions::default().with_slice(det_slice));
        model.mask = dataset.mask.clone();
        Ok(model)
    }

    pub fn with_min_translation(mut self, min_translation: [f64; 2]) -> Self {
        self.min_translation = min_translation;
        self
    }

    pub fn with_measurement(mut self, options: MeasurementOptions) -> Self {
        self.measurement = options;
        self
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_mask(mut self, mask: Array2<bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Fit a quadratic background, starting from `initial` (the square root
    /// of the background level), with the detector shape.
    pub fn with_background(mut self, initial: Array2<f64>) -> Self {
        self.params.insert(BACKGROUND, Parameter::real(initial.into_dyn()));
        self
    }

    pub fn probe_norm(&self) -> f64 {
        self.probe_norm
    }

    pub fn measurement_options(&self) -> &MeasurementOptions {
        &self.measurement
    }

    /// The physical probe, `probe_norm * probe`.
    pub fn probe(&self) -> Result<Array2<Complex64>, ModelError> {
        self.params
            .complex(PROBE)?
            .mapv(|z| z * self.probe_norm)
            .into_dimensionality()
            .map_err(|e| ModelError::Shape(e.to_string()))
    }

    pub fn object(&self) -> Result<Array2<Complex64>, ModelError> {
        self.params
            .complex(OBJECT)?
            .clone()
            .into_dimensionality()
            .map_err(|e| ModelError::Shape(e.to_string()))
    }

    /// Top-left object pixel of the window each input illuminates.
    fn window_origins(&self, inputs: &[PtychoInput]) -> Result<Vec<(usize, usize)>, ModelError> {
        let probe = self.params.complex(PROBE)?;
        let obj = self.params.complex(OBJECT)?;
        if probe.ndim() != 2 || obj.ndim() != 2 {
            return Err(ModelError::Shape(format!(
                "probe {:?} and object {:?} must both be 2D",
                probe.shape(),
                obj.shape()
            )));
        }
        let (pm, pn) = (probe.shape()[0], probe.shape()[1]);
        let (om, on) = (obj.shape()[0], obj.shape()[1]);

        inputs
            .iter()
            .map(|input| {
                let pix = translation_to_pixel(&self.probe_basis, &input.translation)?;
                let r = (pix[0] - self.min_translation[0]).round();
                let c = (pix[1] - self.min_translation[1]).round();
                if r < 0.0 || c < 0.0 || r as usize + pm > om || c as usize + pn > on {
                    return Err(ModelError::Shape(format!(
                        "translation of pattern {} puts the probe at ({r}, {c}), outside the {om}x{on} object",
                        input.index
                    )));
                }
                Ok((r as usize, c as usize))
            })
            .collect()
    }

    /// Simulate patterns for `inputs` and package them as a dataset carrying
    /// this model's wavelength, geometry and mask.
    pub fn simulate_to_dataset(&self, inputs: &[PtychoInput]) -> Result<Ptycho2DDataset, ModelError> {
        let patterns = self
            .forward(inputs)?
            .into_dimensionality::<Ix3>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let translations = inputs.iter().map(|i| i.translation).collect();
        let dataset = Ptycho2DDataset::new(translations, patterns, self.wavelength, self.detector_geometry.clone())?;
        Ok(match &self.mask {
            Some(mask) => dataset.with_mask(mask.clone())?,
            None => dataset,
        })
    }

    /// Extended ptychographical iterative engine.
    ///
    /// Each epoch visits every pattern once in a shuffled order (epoch `e`
    /// shuffles with seed `e`). A visit replaces the far-field modulus of the
    /// exit wave with the measured one inside the detector slice, propagates
    /// back, and moves the probe and object toward the corrected wave with
    /// step `beta`. Frozen parameters are left alone. Returns the mean loss
    /// of each epoch, taken right after each pattern's update.
    pub fn epie(&mut self, dataset: &Ptycho2DDataset, iterations: usize, beta: f64) -> Result<Vec<f64>, ModelError> {
        if self.measurement.oversampling != 1 {
            return Err(ModelError::Shape(format!(
                "ePIE needs an oversampling of 1, got {}",
                self.measurement.oversampling
            )));
        }
        if dataset.is_empty() {
            return Err(DatasetError::Empty.into());
        }

        let mut history = Vec::with_capacity(iterations);
        for epoch in 0..iterations {
            let mut loader = DataLoader::new(dataset).batch_size(1).shuffle(true).seed(epoch as u64);
            let mut total = 0.0;
            for batch in loader.batches() {
                let batch = batch?;
                let observed = batch.patterns.into_dyn();
                self.epie_update(&batch.inputs, &observed, beta)?;
                let simulated = self.forward(&batch.inputs)?;
                total += self.loss_gradient(&observed, &simulated, self.mask.as_ref())?.0;
            }
            let mean = total / dataset.len() as f64;
            debug!("ePIE epoch {}: mean loss {:.6e}", epoch + 1, mean);
            history.push(mean);
        }
        Ok(history)
    }

    /// One ePIE probe and object update for a single pattern.
    fn epie_update(&mut self, inputs: &[PtychoInput], observed: &Pattern, beta: f64) -> Result<(), ModelError> {
        let (r, c) = self.window_origins(inputs)?[0];
        let exit = self.interaction(inputs)?;
        let mut far = to_ix3(self.forward_propagator(&exit)?)?;
        let (_, pm, pn) = far.dim();
        let (rows, cols) = match &self.measurement.detector_slice {
            Some(slice) => (slice.rows.clone(), slice.cols.clone()),
            None => (0..pm, 0..pn),
        };
        let region = far.slice(s![.., rows.clone(), cols.clone()]).to_owned().into_dyn();
        let corrected = to_ix3(modulus(&region, observed, self.mask.as_ref())?)?;
        far.slice_mut(s![.., rows, cols]).assign(&corrected);
        let delta = self.backward_propagator(&far.into_dyn())? - &exit;

        let probe = to_ix2(self.params.complex(PROBE)?.clone())?;
        let obj = to_ix2(self.params.complex(OBJECT)?.clone())?;
        let max_sqr = |a: &Array2<Complex64>| a.iter().fold(0.0_f64, |m, z| m.max(z.norm_sqr()));
        let (probe_peak, obj_peak) = (max_sqr(&probe), max_sqr(&obj));

        if self.is_trainable(PROBE) && obj_peak > 0.0 {
            let step = beta / (self.probe_norm * obj_peak);
            let updated = self.params.complex_mut(PROBE)?;
            for i in 0..pm {
                for j in 0..pn {
                    updated[[i, j]] += obj[[r + i, c + j]].conj() * delta[[0, i, j]] * step;
                }
            }
        }
        if self.is_trainable(OBJECT) && probe_peak > 0.0 {
            let step = beta / (self.probe_norm * probe_peak);
            let updated = self.params.complex_mut(OBJECT)?;
            for i in 0..pm {
                for j in 0..pn {
                    updated[[r + i, c + j]] += probe[[i, j]].conj() * delta[[0, i, j]] * step;
                }
            }
        }
        Ok(())
    }

    fn is_trainable(&self, name: &str) -> bool {
        self.params.get(name).map_or(false, |p| p.trainable)
    }
}

impl ForwardModel for SimplePtycho {
    type Input = PtychoInput;

    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn interaction(&self, inputs: &[PtychoInput]) -> Result<Wavefield, ModelError> {
        let origins = self.window_origins(inputs)?;
        let probe = self.params.complex(PROBE)?;
        let obj = self.params.complex(OBJECT)?;
        let (pm, pn) = (probe.shape()[0], probe.shape()[1]);

        let exit = Array3::from_shape_fn((inputs.len(), pm, pn), |(b, i, j)| {
            let (r, c) = origins[b];
            probe[[i, j]] * obj[[r + i, c + j]] * self.probe_norm
        });
        Ok(exit.into_dyn())
    }

    fn interaction_backward(
        &self,
        inputs: &[PtychoInput],
        grad_exit: &Wavefield,
        grads: &mut Gradients,
    ) -> Result<(), ModelError> {
        let origins = self.window_origins(inputs)?;
        let probe = self.params.complex(PROBE)?;
        let obj = self.params.complex(OBJECT)?;
        let (pm, pn) = (probe.shape()[0], probe.shape()[1]);
        if grad_exit.shape() != &[inputs.len(), pm, pn][..] {
            return Err(ModelError::Shape(format!(
                "exit-wave gradient has shape {:?}, expected {:?}",
                grad_exit.shape(),
                [inputs.len(), pm, pn]
            )));
        }

        if let Some(grad_probe) = grads.complex_mut(PROBE) {
            for (b, &(r, c)) in origins.iter().enumerate() {
                for i in 0..pm {
                    for j in 0..pn {
                        grad_probe[[i, j]] += obj[[r + i, c + j]].conj() * grad_exit[[b, i, j]] * self.probe_norm;
                    }
                }
            }
        }
        if let Some(grad_obj) = grads.complex_mut(OBJECT) {
            for (b, &(r, c)) in origins.iter().enumerate() {
                for i in 0..pm {
                    for j in 0..pn {
                        grad_obj[[r + i, c + j]] += probe[[i, j]].conj() * grad_exit[[b, i, j]] * self.probe_norm;
                    }
                }
            }
        }
        Ok(())
    }

    fn forward_propagator(&self, wavefield: &Wavefield) -> Result<Wavefield, ModelError> {
        Ok(far_field(wavefield)?)
    }

    fn forward_propagator_backward(&self, _wavefield: &Wavefield, grad: &Wavefield) -> Result<Wavefield, ModelError> {
        Ok(inverse_far_field(grad)?)
    }

    fn backward_propagator(&self, wavefield: &Wavefield) -> Result<Wavefield, ModelError> {
        Ok(inverse_far_field(wavefield)?)
    }

    fn measurement(&self, wavefield: &Wavefield) -> Result<Pattern, ModelError> {
        match self.params.get(BACKGROUND) {
            Some(_) => {
                let background = self.params.real(BACKGROUND)?;
                Ok(quadratic_background(wavefield, background, &self.measurement, MeasurementKind::Intensity)?)
            }
            None => Ok(intensity(wavefield, &self.measurement)?),
        }
    }

    fn measurement_backward(
        &self,
        wavefield: &Wavefield,
        grad: &Pattern,
        grads: &mut Gradients,
    ) -> Result<Wavefield, ModelError> {
        match self.params.get(BACKGROUND) {
            Some(_) => {
                let background = self.params.real(BACKGROUND)?;
                let (grad_wave, grad_background) = quadratic_background_backward(
                    wavefield,
                    background,
                    grad,
                    &self.measurement,
                    MeasurementKind::Intensity,
                )?;
                if let Some(acc) = grads.real_mut(BACKGROUND) {
                    *acc += &grad_background;
                }
                Ok(grad_wave)
            }
            None => Ok(intensity_backward(wavefield, grad, &self.measurement)?),
        }
    }

    fn loss_gradient(
        &self,
        observed: &Pattern,
        simulated: &Pattern,
        mask: Option<&Array2<bool>>,
    ) -> Result<(f64, Pattern), ModelError> {
        Ok(self.loss.gradient(observed, simulated, mask)?)
    }

    fn mask(&self) -> Option<&Array2<bool>> {
        self.mask.as_ref()
    }

    fn supports_regularizer(&self) -> bool {
        true
    }

    /// `factors[0] * sum |probe|^2 + factors[1] * sum |obj|^2`; a missing
    /// factor counts as zero.
    fn regularizer(&self, factors: &[f64], grads: &mut Gradients) -> Result<f64, ModelError> {
        let mut total = 0.0;
        for (name, factor) in [PROBE, OBJECT].into_iter().zip(factors.iter().copied()) {
            let value = self.params.complex(name)?;
            total += factor * value.iter().map(|z| z.norm_sqr()).sum::<f64>();
            if let Some(grad) = grads.complex_mut(name) {
                grad.zip_mut_with(value, |g, &z| *g += z * (2.0 * factor));
            }
        }
        Ok(total)
    }

    fn save_results(&self) -> BTreeMap<String, ArrayD<f64>> {
        let mut results = self.params.packed();
        if let Ok(probe) = self.params.complex(PROBE) {
            let scaled = ParamValue::Complex(probe.mapv(|z| z * self.probe_norm));
            results.insert(PROBE.to_string(), scaled.to_packed());
        }
        let basis = Array2::from_shape_fn((3, 2), |(r, c)| self.probe_basis[r][c]);
        results.insert("probe_basis".to_string(), basis.into_dyn());
        results.insert("min_translation".to_string(), arr1(&self.min_translation).into_dyn());
        results.insert("wavelength".to_string(), arr0(self.wavelength).into_dyn());
        results
    }

    fn detector_geometry(&self) -> DetectorGeometry {
        self.detector_geometry.clone()
    }
}

/// Probe-plane pixel basis for a far-field geometry: each detector basis
/// vector maps to a real-space step of length `wavelength * distance / (n * pitch)`
/// along the same direction.
pub fn far_field_probe_basis(
    det_basis: &[[f64; 2]; 3],
    shape: (usize, usize),
    wavelength: f64,
    distance: f64,
) -> Result<[[f64; 2]; 3], ModelError> {
    let counts = [shape.0 as f64, shape.1 as f64];
    let mut basis = [[0.0; 2]; 3];
    for col in 0..2 {
        let norm_sqr: f64 = (0..3).map(|row| det_basis[row][col].powi(2)).sum();
        if norm_sqr == 0.0 || counts[col] == 0.0 {
            return Err(ModelError::Shape(format!("detector basis column {col} is degenerate")));
        }
        let scale = wavelength * distance / (counts[col] * norm_sqr);
        for row in 0..3 {
            basis[row][col] = det_basis[row][col] * scale;
        }
    }
    Ok(basis)
}

/// Least-squares pixel coordinates of a real-space translation in `basis`.
pub fn translation_to_pixel(basis: &[[f64; 2]; 3], translation: &[f64; 3]) -> Result<[f64; 2], ModelError> {
    // normal equations of the 3x2 system
    let dot = |a: usize, b: usize| (0..3).map(|r| basis[r][a] * basis[r][b]).sum::<f64>();
    let proj = |a: usize| (0..3).map(|r| basis[r][a] * translation[r]).sum::<f64>();
    let (g00, g01, g11) = (dot(0, 0), dot(0, 1), dot(1, 1));
    let det = g00 * g11 - g01 * g01;
    if det.abs() <= f64::EPSILON * g00 * g11 {
        return Err(ModelError::Shape("probe basis is singular".into()));
    }
    let (p0, p1) = (proj(0), proj(1));
    Ok([(g11 * p0 - g01 * p1) / det, (g00 * p1 - g01 * p0) / det])
}

/// Object shape covering every rounded window, and the offset that puts the
/// smallest translation at pixel 0.
pub fn object_setup(probe_shape: (usize, usize), pixel_translations: &[[f64; 2]]) -> ((usize, usize), [f64; 2]) {
    let mut min = [f64::INFINITY; 2];
    let mut max = [f64::NEG_INFINITY; 2];
    for t in pixel_translations {
        for k in 0..2 {
            min[k] = min[k].min(t[k]);
            max[k] = max[k].max(t[k]);
        }
    }
    if pixel_translations.is_empty() {
        return (probe_shape, [0.0, 0.0]);
    }
    let extent = |k: usize| (max[k] - min[k]).ceil() as usize;
    ((probe_shape.0 + extent(0), probe_shape.1 + extent(1)), min)
}

/// Intensity-weighted centre of an image in pixels, skipping pixels the
/// mask rejects. Falls back to `(M / 2, N / 2)` when nothing is lit.
pub fn centroid(image: &Array2<f64>, mask: Option<&Array2<bool>>) -> [f64; 2] {
    let mut total = 0.0;
    let mut moment = [0.0; 2];
    for ((i, j), &value) in image.indexed_iter() {
        let valid = mask.and_then(|m| m.get((i, j)).copied()).unwrap_or(true);
        if !valid || !(value > 0.0) {
            continue;
        }
        total += value;
        moment[0] += value * i as f64;
        moment[1] += value * j as f64;
    }
    let (m, n) = image.dim();
    if total > 0.0 && total.is_finite() {
        [moment[0] / total, moment[1] / total]
    } else {
        [(m / 2) as f64, (n / 2) as f64]
    }
}

/// Exit-wave grid for a detector of `det_shape` pixels whose diffraction is
/// centred on `center`.
///
/// The grid is the smallest one that holds the whole detector while its
/// centered transform puts the zero frequency, grid pixel `S / 2`, on the
/// rounded centre. Returns the grid shape and the slice of it the detector
/// covers. A centred pattern gives back the detector shape and a full slice.
pub fn exit_wave_geometry(det_shape: (usize, usize), center: [f64; 2]) -> ((usize, usize), DetectorSlice) {
    let axis = |n: usize, c: f64| -> (usize, Range<usize>) {
        let c = if c.is_finite() {
            c.round().clamp(0.0, n.saturating_sub(1) as f64) as usize
        } else {
            n / 2
        };
        let (below, above) = (c, n - c);
        let even = 2 * below.max(above);
        let odd = 2 * below.max(above.saturating_sub(1)) + 1;
        let size = even.min(odd);
        let offset = size / 2 - c;
        (size, offset..offset + n)
    };
    let (m, rows) = axis(det_shape.0, center[0]);
    let (n, cols) = axis(det_shape.1, center[1]);
    ((m, n), DetectorSlice::new(rows, cols))
}

/// Probe guess from the mean diffraction pattern: its square root, placed in
/// the detector slice of a zero far field with a flat phase and propagated
/// back to the sample.
fn sharp_probe(
    dataset: &Ptycho2DDataset,
    probe_shape: (usize, usize),
    det_slice: &DetectorSlice,
) -> Result<Array2<Complex64>, ModelError> {
    if dataset.is_empty() {
        return Err(DatasetError::Empty.into());
    }
    let patterns = dataset.patterns();
    let mean = patterns.mean_axis(Axis(0)).ok_or(DatasetError::Empty)?;
    let mean = match &dataset.mask {
        Some(mask) => Array2::from_shape_fn(mean.dim(), |idx| if mask[idx] { mean[idx] } else { 0.0 }),
        None => mean,
    };
    if det_slice.shape() != mean.dim() || det_slice.rows.end > probe_shape.0 || det_slice.cols.end > probe_shape.1 {
        return Err(ModelError::Shape(format!(
            "detector slice {:?} does not place a {:?} pattern in a {:?} grid",
            det_slice,
            mean.dim(),
            probe_shape
        )));
    }

    let mut far = Array2::<Complex64>::zeros(probe_shape);
    far.slice_mut(s![det_slice.rows.clone(), det_slice.cols.clone()])
        .assign(&mean.mapv(|x| Complex64::new(x.max(0.0).sqrt(), 0.0)));
    to_ix2(inverse_far_field(&far.into_dyn())?)
}

fn to_ix2(a: ArrayD<Complex64>) -> Result<Array2<Complex64>, ModelError> {
    a.into_dimensionality::<Ix2>().map_err(|e| ModelError::Shape(e.to_string()))
}

fn to_ix3(a: ArrayD<Complex64>) -> Result<Array3<Complex64>, ModelError> {
    a.into_dimensionality::<Ix3>().map_err(|e| ModelError::Shape(e.to_string()))
}
