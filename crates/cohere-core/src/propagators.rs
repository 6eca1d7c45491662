//! Free-space propagators between the sample and detector planes.
//!
//! The far-field propagator is a centered, orthonormal 2D DFT over the last
//! two axes: the zero frequency sits at `(M / 2, N / 2)` on both sides of the
//! transform. Being unitary, its adjoint is its inverse, which is what the
//! backward pass of a forward model uses.

use std::sync::Arc;

use ndarray::ArrayD;
use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftDirection, FftPlanner};
use thiserror::Error;

use crate::types::Wavefield;

/// Errors raised by the propagators.
#[derive(Debug, Error)]
pub enum PropagatorError {
    #[error("Expected at least two spatial axes, got shape {0:?}")]
    Rank(Vec<usize>),

    #[error("Shape mismatch: {0}")]
    Shape(String),
}

/// Propagate exit waves to the far field (Fraunhofer regime).
pub fn far_field(wavefield: &Wavefield) -> Result<Wavefield, PropagatorError> {
    centered_fft2(wavefield, FftDirection::Forward)
}

/// Inverse of [`far_field`], and also its adjoint.
pub fn inverse_far_field(wavefield: &Wavefield) -> Result<Wavefield, PropagatorError> {
    centered_fft2(wavefield, FftDirection::Inverse)
}

/// Row and column plans for one frame size.
struct Plan2d {
    rows: usize,
    cols: usize,
    row_fft: Arc<dyn Fft<f64>>,
    col_fft: Arc<dyn Fft<f64>>,
}

impl Plan2d {
    fn new(rows: usize, cols: usize, direction: FftDirection) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            rows,
            cols,
            row_fft: planner.plan_fft(cols, direction),
            col_fft: planner.plan_fft(rows, direction),
        }
    }

    /// Unnormalized 2D transform of one row-major frame, in place.
    fn process(&self, frame: &mut [Complex64]) {
        for row in frame.chunks_mut(self.cols) {
            self.row_fft.process(row);
        }
        let mut column = vec![Complex64::new(0.0, 0.0); self.rows];
        for j in 0..self.cols {
            for (i, c) in column.iter_mut().enumerate() {
                *c = frame[i * self.cols + j];
            }
            self.col_fft.process(&mut column);
            for (i, c) in column.iter().enumerate() {
                frame[i * self.cols + j] = *c;
            }
        }
    }
}

/// Cyclic shift of a row-major frame: element `(i, j)` moves to
/// `((i + dr) % rows, (j + dc) % cols)`.
fn roll(frame: &[Complex64], rows: usize, cols: usize, dr: usize, dc: usize) -> Vec<Complex64> {
    let mut out = vec![Complex64::new(0.0, 0.0); frame.len()];
    for i in 0..rows {
        let oi = (i + dr) % rows;
        for j in 0..cols {
            out[oi * cols + (j + dc) % cols] = frame[i * cols + j];
        }
    }
    out
}

fn centered_fft2(wavefield: &Wavefield, direction: FftDirection) -> Result<Wavefield, PropagatorError> {
    let shape = wavefield.shape().to_vec();
    let (rows, cols) = match shape.as_slice() {
        [.., m, n] => (*m, *n),
        _ => return Err(PropagatorError::Rank(shape)),
    };
    let frame_len = rows * cols;
    if frame_len == 0 {
        return Ok(wavefield.clone());
    }

    let plan = Plan2d::new(rows, cols, direction);
    let norm = 1.0 / (frame_len as f64).sqrt();
    // ifftshift moves by ceil(n / 2), fftshift by floor(n / 2)
    let (pre_r, pre_c) = (rows - rows / 2, cols - cols / 2);
    let (post_r, post_c) = (rows / 2, cols / 2);

    let mut data: Vec<Complex64> = wavefield.iter().copied().collect();
    data.par_chunks_mut(frame_len).for_each(|frame| {
        let mut shifted = roll(frame, rows, cols, pre_r, pre_c);
        plan.process(&mut shifted);
        let centered = roll(&shifted, rows, cols, post_r, post_c);
        for (dst, src) in frame.iter_mut().zip(centered) {
            *dst = src * norm;
        }
    });

    ArrayD::from_shape_vec(wavefield.raw_dim(), data).map_err(|e| PropagatorError::Shape(e.to_string()))
}
