//! Constraint projections for iterative phase retrieval.
//!
//! Unlike the measurement models these are not differentiated: algorithms
//! such as ePIE alternate between propagating a wavefield and snapping it onto
//! the set of fields consistent with the data.

use ndarray::Array2;
use num_complex::Complex64;

use crate::measurement::MeasurementError;
use crate::types::{Pattern, Wavefield};

/// Modulus constraint: give every detector-plane pixel the amplitude
/// `sqrt(intensity)` while keeping its phase.
///
/// `wavefield` and `intensities` share the shape `(..., M, N)`. Where `mask`
/// is `false` the wavefield passes through unchanged. A pixel with zero
/// amplitude has no phase to keep and becomes real.
pub fn modulus(
    wavefield: &Wavefield,
    intensities: &Pattern,
    mask: Option<&Array2<bool>>,
) -> Result<Wavefield, MeasurementError> {
    let shape = wavefield.shape();
    if shape.len() < 2 {
        return Err(MeasurementError::Shape(format!(
            "wavefield {shape:?} needs at least two spatial axes"
        )));
    }
    if intensities.shape() != shape {
        return Err(MeasurementError::Shape(format!(
            "intensities {:?} do not match wavefield {:?}",
            intensities.shape(),
            shape
        )));
    }
    let nd = shape.len();
    if let Some(mask) = mask {
        if mask.dim() != (shape[nd - 2], shape[nd - 1]) {
            return Err(MeasurementError::Shape(format!(
                "mask {:?} does not match the {:?} detector",
                mask.dim(),
                &shape[nd - 2..]
            )));
        }
    }

    let mut projected = wavefield.clone();
    projected
        .indexed_iter_mut()
        .zip(intensities.iter())
        .for_each(|((idx, z), &measured)| {
            if let Some(mask) = mask {
                if !mask[[idx[nd - 2], idx[nd - 1]]] {
                    return;
                }
            }
            let amplitude = measured.max(0.0).sqrt();
            let norm = z.norm();
            *z = if norm > 0.0 {
                *z * (amplitude / norm)
            } else {
                Complex64::new(amplitude, 0.0)
            };
        });
    Ok(projected)
}
