//! Jones-calculus polarization optics.
//!
//! Vector wavefields carry their two polarization components on axis `-3`:
//!
//! | `multiple_modes` | field layout        |
//! |------------------|---------------------|
//! | `false`          | `[B] x 2 x M x N`   |
//! | `true`           | `[B] x P x 2 x M x N` |
//!
//! where `[B]` is an optional batch axis and `P` counts incoherent modes.
//! A Jones matrix is `2 x 2`, batched as `B x 2 x 2`, and may vary across
//! the field as `[B] x 2 x 2 x M x N`.
//!
//! Layout violations are reported as [`PolarizationError`]; nothing here
//! reshapes or truncates an input to make it fit.

use ndarray::{Array2, Array5, ArrayD, IxDyn};
use num_complex::Complex64;
use thiserror::Error;

use crate::types::Wavefield;

/// Errors raised by the polarization layer.
#[derive(Debug, Error)]
pub enum PolarizationError {
    #[error("Polarization axis must have length 2, got shape {0:?}")]
    PolarizationAxis(Vec<usize>),

    #[error("Jones matrix must be 2x2, got shape {0:?}")]
    JonesShape(Vec<usize>),

    #[error("Cannot broadcast: {0}")]
    Broadcast(String),

    #[error("Unexpected rank: {0}")]
    Rank(String),
}

const ZERO: Complex64 = Complex64::new(0.0, 0.0);
const ONE: Complex64 = Complex64::new(1.0, 0.0);
const I: Complex64 = Complex64::new(0.0, 1.0);

/// Field normalized to `(B, P, 2, M, N)` with the original batch length.
struct FieldLayout {
    data: Array5<Complex64>,
    batch: Option<usize>,
    modes: Option<usize>,
}

/// Jones matrices normalized to `(B, 2, 2, M, N)`; uniform matrices have
/// unit spatial axes.
struct JonesLayout {
    data: Array5<Complex64>,
    batch: Option<usize>,
}

fn field_layout(field: &Wavefield, multiple_modes: bool) -> Result<FieldLayout, PolarizationError> {
    let shape = field.shape();
    let (batch, modes, m, n) = match (multiple_modes, shape) {
        (false, [2, m, n]) => (None, None, *m, *n),
        (false, [b, 2, m, n]) => (Some(*b), None, *m, *n),
        (true, [p, 2, m, n]) => (None, Some(*p), *m, *n),
        (true, [b, p, 2, m, n]) => (Some(*b), Some(*p), *m, *n),
        (false, [.., _, _, _]) if shape.len() <= 4 => {
            return Err(PolarizationError::PolarizationAxis(shape.to_vec()))
        }
        (true, [.., _, _, _]) if shape.len() <= 5 && shape.len() >= 4 => {
            return Err(PolarizationError::PolarizationAxis(shape.to_vec()))
        }
        _ => {
            return Err(PolarizationError::Rank(format!(
                "field of shape {:?} with multiple_modes = {}",
                shape, multiple_modes
            )))
        }
    };
    let dims = (batch.unwrap_or(1), modes.unwrap_or(1), 2, m, n);
    let data = field
        .as_standard_layout()
        .into_owned()
        .into_shape(dims)
        .map_err(|e| PolarizationError::Rank(e.to_string()))?;
    Ok(FieldLayout { data, batch, modes })
}

fn jones_layout(jones: &ArrayD<Complex64>) -> Result<JonesLayout, PolarizationError> {
    let shape = jones.shape();
    let (batch, m, n) = match shape {
        [2, 2] => (None, 1, 1),
        [b, 2, 2] => (Some(*b), 1, 1),
        [2, 2, m, n] => (None, *m, *n),
        [b, 2, 2, m, n] => (Some(*b), *m, *n),
        [_, _] | [_, _, _] | [_, _, _, _] | [_, _, _, _, _] => {
            return Err(PolarizationError::JonesShape(shape.to_vec()))
        }
        _ => {
            return Err(PolarizationError::Rank(format!(
                "Jones matrix of shape {:?}",
                shape
            )))
        }
    };
    let data = jones
        .as_standard_layout()
        .into_owned()
        .into_shape((batch.unwrap_or(1), 2, 2, m, n))
        .map_err(|e| PolarizationError::Rank(e.to_string()))?;
    Ok(JonesLayout { data, batch })
}

/// Output batch length for a field and matrix batch, `None` if neither has one.
fn broadcast_batch(field: Option<usize>, jones: Option<usize>) -> Result<Option<usize>, PolarizationError> {
    match (field, jones) {
        (None, None) => Ok(None),
        (Some(b), None) | (None, Some(b)) => Ok(Some(b)),
        (Some(f), Some(j)) if f == j || j == 1 => Ok(Some(f)),
        (Some(1), Some(j)) => Ok(Some(j)),
        (Some(f), Some(j)) => Err(PolarizationError::Broadcast(format!(
            "{j} Jones matrices for a batch of {f} fields"
        ))),
    }
}

fn check_spatial(field: &FieldLayout, jones: &JonesLayout) -> Result<(), PolarizationError> {
    let (_, _, _, m, n) = field.data.dim();
    let (_, _, _, jm, jn) = jones.data.dim();
    if (jm, jn) != (1, 1) && (jm, jn) != (m, n) {
        return Err(PolarizationError::Broadcast(format!(
            "Jones matrix varies over ({jm}, {jn}) but the field is ({m}, {n})"
        )));
    }
    Ok(())
}

fn output_shape(batch: Option<usize>, modes: Option<usize>, m: usize, n: usize) -> Vec<usize> {
    batch.into_iter().chain(modes).chain([2, m, n]).collect()
}

/// Apply a Jones matrix to the polarization axis of a field.
///
/// Single and batched matrices broadcast against single and batched fields.
/// Two batch axes must have equal length unless one of them is 1.
pub fn apply_jones_matrix(
    field: &Wavefield,
    jones: &ArrayD<Complex64>,
    multiple_modes: bool,
) -> Result<Wavefield, PolarizationError> {
    let field = field_layout(field, multiple_modes)?;
    let jones = jones_layout(jones)?;
    check_spatial(&field, &jones)?;
    let batch = broadcast_batch(field.batch, jones.batch)?;

    let (fb, p, _, m, n) = field.data.dim();
    let (jb, _, _, jm, jn) = jones.data.dim();
    let b = batch.unwrap_or(1);
    let out = Array5::from_shape_fn((b, p, 2, m, n), |(bi, pi, c, i, j)| {
        let fi = if fb == 1 { 0 } else { bi };
        let ji = if jb == 1 { 0 } else { bi };
        let (si, sj) = if (jm, jn) == (1, 1) { (0, 0) } else { (i, j) };
        jones.data[[ji, c, 0, si, sj]] * field.data[[fi, pi, 0, i, j]]
            + jones.data[[ji, c, 1, si, sj]] * field.data[[fi, pi, 1, i, j]]
    });

    out.into_shape(IxDyn(&output_shape(batch, field.modes, m, n)))
        .map_err(|e| PolarizationError::Rank(e.to_string()))
}

/// Adjoint of [`apply_jones_matrix`] with respect to the field.
///
/// `grad` has the layout of the output; the result has `field_shape`, with
/// contributions summed over any batch the field was broadcast across.
pub fn apply_jones_matrix_adjoint(
    grad: &Wavefield,
    jones: &ArrayD<Complex64>,
    field_shape: &[usize],
    multiple_modes: bool,
) -> Result<Wavefield, PolarizationError> {
    let grad = field_layout(grad, multiple_modes)?;
    let jones = jones_layout(jones)?;
    check_spatial(&grad, &jones)?;

    let field_batch = match (multiple_modes, field_shape.len()) {
        (false, 4) | (true, 5) => Some(field_shape[0]),
        _ => None,
    };
    let (gb, p, _, m, n) = grad.data.dim();
    let (jb, _, _, jm, jn) = jones.data.dim();
    let fb = field_batch.unwrap_or(1);
    if fb != 1 && fb != gb {
        return Err(PolarizationError::Broadcast(format!(
            "gradient batch {gb} does not reduce to field batch {fb}"
        )));
    }

    let mut out = Array5::<Complex64>::zeros((fb, p, 2, m, n));
    for bi in 0..gb {
        let fi = if fb == 1 { 0 } else { bi };
        let ji = if jb == 1 { 0 } else { bi };
        for pi in 0..p {
            for i in 0..m {
                for j in 0..n {
                    let (si, sj) = if (jm, jn) == (1, 1) { (0, 0) } else { (i, j) };
                    let g0 = grad.data[[bi, pi, 0, i, j]];
                    let g1 = grad.data[[bi, pi, 1, i, j]];
                    for k in 0..2 {
                        out[[fi, pi, k, i, j]] += jones.data[[ji, 0, k, si, sj]].conj() * g0
                            + jones.data[[ji, 1, k, si, sj]].conj() * g1;
                    }
                }
            }
        }
    }

    let result = out
        .into_shape(IxDyn(field_shape))
        .map_err(|e| PolarizationError::Rank(e.to_string()))?;
    Ok(result)
}

/// Linear polarizer matrices for angles in degrees.
///
/// A 0-d array of angles gives a single `2 x 2` matrix, a 1-d array gives a
/// `B x 2 x 2` batch.
pub fn generate_linear_polarizer(angles: &ArrayD<f64>) -> Result<ArrayD<Complex64>, PolarizationError> {
    let polarizer = |theta: f64| {
        let (s, c) = theta.to_radians().sin_cos();
        [[c * c, s * c], [s * c, s * s]]
    };
    match angles.ndim() {
        0 => {
            let mat = polarizer(angles.iter().next().copied().unwrap_or(0.0));
            Ok(Array2::from_shape_fn((2, 2), |(r, c)| Complex64::from(mat[r][c])).into_dyn())
        }
        1 => {
            let mats: Vec<_> = angles.iter().map(|&a| polarizer(a)).collect();
            Ok(ArrayD::from_shape_fn(IxDyn(&[mats.len(), 2, 2]), |idx| {
                Complex64::from(mats[idx[0]][idx[1]][idx[2]])
            }))
        }
        _ => Err(PolarizationError::Rank(format!(
            "polarizer angles must be 0-d or 1-d, got shape {:?}",
            angles.shape()
        ))),
    }
}

/// Pass a field through linear polarizers at the given angles (degrees).
pub fn apply_linear_polarizer(
    field: &Wavefield,
    angles: &ArrayD<f64>,
    multiple_modes: bool,
) -> Result<Wavefield, PolarizationError> {
    let jones = generate_linear_polarizer(angles)?;
    apply_jones_matrix(field, &jones, multiple_modes)
}

/// Apply one fixed matrix to axis `-3`, whatever the leading axes hold.
fn apply_fixed(field: &Wavefield, mat: [[Complex64; 2]; 2]) -> Result<Wavefield, PolarizationError> {
    let shape = field.shape().to_vec();
    let nd = shape.len();
    if nd < 3 {
        return Err(PolarizationError::Rank(format!(
            "field needs a polarization axis and two spatial axes, got shape {:?}",
            shape
        )));
    }
    if shape[nd - 3] != 2 {
        return Err(PolarizationError::PolarizationAxis(shape));
    }
    let lead: usize = shape[..nd - 3].iter().product();
    let (m, n) = (shape[nd - 2], shape[nd - 1]);
    let data = field
        .as_standard_layout()
        .into_owned()
        .into_shape((lead, 1, 2, m, n))
        .map_err(|e| PolarizationError::Rank(e.to_string()))?;
    let out = Array5::from_shape_fn(data.raw_dim(), |(l, _, c, i, j)| {
        mat[c][0] * data[[l, 0, 0, i, j]] + mat[c][1] * data[[l, 0, 1, i, j]]
    });
    out.into_shape(IxDyn(&shape))
        .map_err(|e| PolarizationError::Rank(e.to_string()))
}

/// Delay the y component by `phase_shift` degrees: `[[1, 0], [0, e^{i phi}]]`.
pub fn apply_phase_retardance(field: &Wavefield, phase_shift: f64) -> Result<Wavefield, PolarizationError> {
    let retarded = Complex64::from_polar(1.0, phase_shift.to_radians());
    apply_fixed(field, [[ONE, ZERO], [ZERO, retarded]])
}

/// Quarter-wave plate with its fast axis at `angle` degrees from horizontal.
pub fn apply_quarter_wave_plate(field: &Wavefield, angle: f64) -> Result<Wavefield, PolarizationError> {
    let (s, c) = angle.to_radians().sin_cos();
    let phase = Complex64::from_polar(1.0, -std::f64::consts::FRAC_PI_4);
    let off = (ONE - I) * (s * c);
    let mat = [
        [phase * (c * c + I * (s * s)), phase * off],
        [phase * off, phase * (s * s + I * (c * c))],
    ];
    apply_fixed(field, mat)
}

/// Half-wave plate with its fast axis at `angle` degrees from horizontal.
pub fn apply_half_wave_plate(field: &Wavefield, angle: f64) -> Result<Wavefield, PolarizationError> {
    let (s, c) = angle.to_radians().sin_cos();
    let phase = Complex64::from_polar(1.0, -std::f64::consts::FRAC_PI_2);
    let mat = [
        [phase * (c * c - s * s), phase * (2.0 * s * c)],
        [phase * (2.0 * s * c), phase * (s * s - c * c)],
    ];
    apply_fixed(field, mat)
}

/// Circular polarizer, left- or right-handed.
pub fn apply_circular_polarizer(field: &Wavefield, left_handed: bool) -> Result<Wavefield, PolarizationError> {
    let half = Complex64::new(0.5, 0.0);
    let mat = if left_handed {
        [[half, -I * half], [I * half, half]]
    } else {
        [[half, I * half], [-I * half, half]]
    };
    apply_fixed(field, mat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr0, arr1, Array4, Dimension};

    fn field(shape: &[usize]) -> Wavefield {
        let mut k: f64 = 0.0;
        ArrayD::from_shape_fn(IxDyn(shape), |_| {
            k += 1.0;
            Complex64::new((0.37 * k).sin(), (0.11 * k).cos())
        })
    }

    fn identity() -> ArrayD<Complex64> {
        Array2::from_shape_fn((2, 2), |(r, c)| if r == c { ONE } else { ZERO }).into_dyn()
    }

    fn assert_fields_close(a: &Wavefield, b: &Wavefield) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!((x - y).norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_identity_leaves_field_unchanged() {
        for (shape, modes) in [
            (vec![2, 3, 4], false),
            (vec![5, 2, 3, 4], false),
            (vec![3, 2, 3, 4], true),
            (vec![5, 3, 2, 3, 4], true),
        ] {
            let f = field(&shape);
            let out = apply_jones_matrix(&f, &identity(), modes).unwrap();
            assert_fields_close(&out, &f);
        }
    }

    #[test]
    fn test_polarizer_at_zero_passes_x_blocks_y() {
        let f = ArrayD::from_elem(IxDyn(&[2, 2, 2]), ONE);
        let out = apply_linear_polarizer(&f, &arr0(0.0).into_dyn(), false).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(out[[0, i, j]].re, 1.0, epsilon = 1e-15);
                assert_abs_diff_eq!(out[[1, i, j]].norm(), 0.0, epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn test_crossed_polarizers_give_orthogonal_outputs() {
        let f = field(&[2, 4, 4]);
        let theta = 23.0;
        let a = apply_linear_polarizer(&f, &arr0(theta).into_dyn(), false).unwrap();
        let b = apply_linear_polarizer(&f, &arr0(theta + 90.0).into_dyn(), false).unwrap();
        let inner: Complex64 = a.iter().zip(b.iter()).map(|(x, y)| x.conj() * y).sum();
        assert_abs_diff_eq!(inner.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_batched_matrices_on_single_field() {
        let f = field(&[3, 2, 2, 2]);
        let angles = arr1(&[0.0, 90.0]).into_dyn();
        let out = apply_linear_polarizer(&f, &angles, true).unwrap();
        assert_eq!(out.shape(), &[2, 3, 2, 2, 2]);
        // 0 degrees keeps x, 90 degrees keeps y
        assert_abs_diff_eq!((out[[0, 1, 0, 1, 1]] - f[[1, 0, 1, 1]]).norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[0, 1, 1, 1, 1]].norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[1, 2, 0, 0, 1]].norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!((out[[1, 2, 1, 0, 1]] - f[[2, 1, 0, 1]]).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_batched_matrices_on_batched_field() {
        let f = field(&[2, 2, 3, 3]);
        let angles = arr1(&[0.0, 90.0]).into_dyn();
        let out = apply_linear_polarizer(&f, &angles, false).unwrap();
        assert_eq!(out.shape(), &[2, 2, 3, 3]);
        assert_abs_diff_eq!(out[[0, 1, 2, 2]].norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[1, 0, 2, 2]].norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mismatched_batches_are_rejected() {
        let f = field(&[3, 2, 3, 3]);
        let angles = arr1(&[0.0, 45.0]).into_dyn();
        assert!(matches!(
            apply_linear_polarizer(&f, &angles, false),
            Err(PolarizationError::Broadcast(_))
        ));
    }

    #[test]
    fn test_bad_polarization_axis_is_rejected() {
        let f = field(&[3, 4, 4]);
        assert!(matches!(
            apply_jones_matrix(&f, &identity(), false),
            Err(PolarizationError::PolarizationAxis(_))
        ));
        assert!(matches!(
            apply_half_wave_plate(&f, 10.0),
            Err(PolarizationError::PolarizationAxis(_))
        ));
    }

    #[test]
    fn test_bad_jones_shape_is_rejected() {
        let f = field(&[2, 4, 4]);
        let jones = ArrayD::from_elem(IxDyn(&[3, 3]), ONE);
        assert!(matches!(
            apply_jones_matrix(&f, &jones, false),
            Err(PolarizationError::JonesShape(_))
        ));
    }

    #[test]
    fn test_spatially_varying_matrix() {
        let f = field(&[2, 2, 3]);
        let jones = Array4::from_shape_fn((2, 2, 2, 3), |(r, c, i, _)| {
            if r == c {
                Complex64::from(i as f64)
            } else {
                ZERO
            }
        })
        .into_dyn();
        let out = apply_jones_matrix(&f, &jones, false).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 2]].norm(), 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!((out[[1, 1, 2]] - f[[1, 1, 2]]).norm(), 0.0, epsilon = 1e-15);

        let wrong = ArrayD::from_elem(IxDyn(&[2, 2, 4, 4]), ONE);
        assert!(apply_jones_matrix(&f, &wrong, false).is_err());
    }

    #[test]
    fn test_half_wave_plate_at_45_swaps_components() {
        let f = field(&[2, 2, 2]);
        let out = apply_half_wave_plate(&f, 45.0).unwrap();
        let phase = Complex64::from_polar(1.0, -std::f64::consts::FRAC_PI_2);
        assert_abs_diff_eq!((out[[0, 1, 0]] - phase * f[[1, 1, 0]]).norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!((out[[1, 1, 0]] - phase * f[[0, 1, 0]]).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_quarter_wave_plate_twice_is_half_wave_plate() {
        let f = field(&[4, 2, 2, 2]);
        let twice = apply_quarter_wave_plate(&apply_quarter_wave_plate(&f, 30.0).unwrap(), 30.0).unwrap();
        let half = apply_half_wave_plate(&f, 30.0).unwrap();
        assert_fields_close(&twice, &half);
    }

    #[test]
    fn test_phase_retardance_and_circular_polarizer() {
        let f = field(&[2, 1, 1]);
        let out = apply_phase_retardance(&f, 90.0).unwrap();
        assert_abs_diff_eq!((out[[1, 0, 0]] - I * f[[1, 0, 0]]).norm(), 0.0, epsilon = 1e-12);

        // left then right circular polarizers are orthogonal projectors
        let left = apply_circular_polarizer(&f, true).unwrap();
        let blocked = apply_circular_polarizer(&left, false).unwrap();
        assert!(blocked.iter().all(|z| z.norm() < 1e-12));
        let again = apply_circular_polarizer(&left, true).unwrap();
        assert_fields_close(&again, &left);
    }

    #[test]
    fn test_adjoint_identity() {
        let f = field(&[3, 2, 2, 3]);
        let jones = ArrayD::from_shape_fn(IxDyn(&[2, 2, 2, 2, 3]), |idx| {
            let s: usize = idx.slice().iter().sum();
            Complex64::new((s as f64).cos(), 0.3 * s as f64)
        });
        let y = field(&[2, 3, 2, 2, 3]).mapv(|z| z * Complex64::new(0.5, -1.0));
        let ax = apply_jones_matrix(&f, &jones, true).unwrap();
        let aty = apply_jones_matrix_adjoint(&y, &jones, f.shape(), true).unwrap();
        assert_eq!(aty.shape(), f.shape());

        let lhs: Complex64 = ax.iter().zip(y.iter()).map(|(a, b)| a.conj() * b).sum();
        let rhs: Complex64 = f.iter().zip(aty.iter()).map(|(a, b)| a.conj() * b).sum();
        assert_abs_diff_eq!((lhs - rhs).norm(), 0.0, epsilon = 1e-10);
    }
}
