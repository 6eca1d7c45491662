//! Random-access datasets of diffraction patterns.
//!
//! A [`Dataset`] maps a pattern index to the experiment-specific inputs a
//! forward model needs (for ptychography: the index and the stage
//! translation) together with the measured pattern. The optimization driver
//! never looks inside the inputs; it only hands them back to the model.

use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::DetectorGeometry;

/// Errors raised by dataset collaborators.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Pattern index {index} is out of range for a dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Dataset is empty")]
    Empty,

    #[error("Shape mismatch: {0}")]
    Shape(String),
}

/// Random-access collection of `(inputs, observed pattern)` pairs.
pub trait Dataset: Sync {
    /// Per-pattern inputs consumed by a model's interaction stage.
    type Input: Clone + Send + Sync;

    /// Number of patterns.
    fn len(&self) -> usize;

    /// Returns `true` when the dataset holds no patterns.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inputs and observed pattern for one index.
    fn get(&self, index: usize) -> Result<(Self::Input, Array2<f64>), DatasetError>;

    /// Total observed signal, summed over every pattern.
    fn total_intensity(&self) -> Result<f64, DatasetError> {
        let mut total = 0.0;
        for i in 0..self.len() {
            total += self.get(i)?.1.sum();
        }
        Ok(total)
    }
}

impl<D: Dataset + ?Sized> Dataset for &D {
    type Input = D::Input;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<(Self::Input, Array2<f64>), DatasetError> {
        (**self).get(index)
    }

    fn total_intensity(&self) -> Result<f64, DatasetError> {
        (**self).total_intensity()
    }
}

/// Inputs for one pattern of a 2D ptychography scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PtychoInput {
    /// Index of the pattern in the full (unsubsetted) scan.
    pub index: usize,
    /// Sample stage translation (m).
    pub translation: [f64; 3],
}

/// In-memory 2D ptychography dataset.
#[derive(Debug, Clone)]
pub struct Ptycho2DDataset {
    translations: Vec<[f64; 3]>,
    patterns: Array3<f64>,
    /// Illumination wavelength (m).
    pub wavelength: f64,
    pub detector_geometry: DetectorGeometry,
    /// Valid-pixel mask, `true` where the detector can be trusted.
    pub mask: Option<Array2<bool>>,
}

impl Ptycho2DDataset {
    /// Build a dataset from one translation per pattern and a `(B, M, N)`
    /// stack of patterns.
    pub fn new(
        translations: Vec<[f64; 3]>,
        patterns: Array3<f64>,
        wavelength: f64,
        detector_geometry: DetectorGeometry,
    ) -> Result<Self, DatasetError> {
        if translations.len() != patterns.dim().0 {
            return Err(DatasetError::Shape(format!(
                "{} translations for {} patterns",
                translations.len(),
                patterns.dim().0
            )));
        }
        Ok(Self {
            translations,
            patterns,
            wavelength,
            detector_geometry,
            mask: None,
        })
    }

    /// Attach a valid-pixel mask. Its shape must equal the pattern shape.
    pub fn with_mask(mut self, mask: Array2<bool>) -> Result<Self, DatasetError> {
        let (_, m, n) = self.patterns.dim();
        if mask.dim() != (m, n) {
            return Err(DatasetError::Shape(format!(
                "mask shape {:?} does not match pattern shape {:?}",
                mask.dim(),
                (m, n)
            )));
        }
        self.mask = Some(mask);
        Ok(self)
    }

    pub fn translations(&self) -> &[[f64; 3]] {
        &self.translations
    }

    pub fn patterns(&self) -> &Array3<f64> {
        &self.patterns
    }

    /// Shape of a single detector pattern.
    pub fn pattern_shape(&self) -> (usize, usize) {
        let (_, m, n) = self.patterns.dim();
        (m, n)
    }

    /// All inputs, in pattern order.
    pub fn inputs(&self) -> Vec<PtychoInput> {
        self.translations
            .iter()
            .enumerate()
            .map(|(index, &translation)| PtychoInput { index, translation })
            .collect()
    }
}

impl Dataset for Ptycho2DDataset {
    type Input = PtychoInput;

    fn len(&self) -> usize {
        self.translations.len()
    }

    fn get(&self, index: usize) -> Result<(PtychoInput, Array2<f64>), DatasetError> {
        let len = self.len();
        let translation = *self
            .translations
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange { index, len })?;
        let pattern = self.patterns.slice(s![index, .., ..]).to_owned();
        Ok((PtychoInput { index, translation }, pattern))
    }

    fn total_intensity(&self) -> Result<f64, DatasetError> {
        Ok(self.patterns.sum())
    }
}

/// Index selection used to build a [`Subset`].
///
/// Deserializes from either a bare index or a list of indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    Single(usize),
    Many(Vec<usize>),
}

impl From<usize> for Selection {
    fn from(index: usize) -> Self {
        Selection::Single(index)
    }
}

impl From<Vec<usize>> for Selection {
    fn from(indices: Vec<usize>) -> Self {
        Selection::Many(indices)
    }
}

impl From<&[usize]> for Selection {
    fn from(indices: &[usize]) -> Self {
        Selection::Many(indices.to_vec())
    }
}

impl Selection {
    pub fn into_indices(self) -> Vec<usize> {
        match self {
            Selection::Single(index) => vec![index],
            Selection::Many(indices) => indices,
        }
    }
}

/// A view of a dataset restricted to a list of indices.
///
/// Inputs are returned unchanged, so a pattern keeps its original index
/// inside the model.
#[derive(Debug, Clone)]
pub struct Subset<'a, D: ?Sized> {
    dataset: &'a D,
    indices: Vec<usize>,
}

impl<'a, D: Dataset + ?Sized> Subset<'a, D> {
    pub fn new(dataset: &'a D, selection: impl Into<Selection>) -> Result<Self, DatasetError> {
        let indices = selection.into().into_indices();
        let len = dataset.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(DatasetError::IndexOutOfRange { index, len });
        }
        Ok(Self { dataset, indices })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D: Dataset + ?Sized> Dataset for Subset<'_, D> {
    type Input = D::Input;

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Result<(Self::Input, Array2<f64>), DatasetError> {
        let len = self.len();
        let inner = *self
            .indices
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange { index, len })?;
        self.dataset.get(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn toy_dataset(n: usize) -> Ptycho2DDataset {
        let patterns = Array3::from_shape_fn((n, 4, 4), |(i, _, _)| i as f64 + 1.0);
        let translations = (0..n).map(|i| [i as f64 * 1e-6, 0.0, 0.0]).collect();
        Ptycho2DDataset::new(translations, patterns, 1e-9, DetectorGeometry::default()).unwrap()
    }

    #[test]
    fn test_get_returns_matching_pattern() {
        let data = toy_dataset(3);
        let (input, pattern) = data.get(2).unwrap();
        assert_eq!(input.index, 2);
        assert_abs_diff_eq!(pattern[[1, 1]], 3.0);
        assert!(matches!(
            data.get(3),
            Err(DatasetError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_total_intensity() {
        let data = toy_dataset(3);
        // 16 pixels each of 1, 2 and 3
        assert_abs_diff_eq!(data.total_intensity().unwrap(), 96.0);
    }

    #[test]
    fn test_subset_keeps_original_indices() {
        let data = toy_dataset(5);
        let subset = Subset::new(&data, vec![4, 1]).unwrap();
        assert_eq!(subset.len(), 2);
        let (input, pattern) = subset.get(0).unwrap();
        assert_eq!(input.index, 4);
        assert_abs_diff_eq!(pattern[[0, 0]], 5.0);
        assert_abs_diff_eq!(subset.total_intensity().unwrap(), 16.0 * 7.0);

        let single = Subset::new(&data, 3).unwrap();
        assert_eq!(single.indices(), &[3]);
    }

    #[test]
    fn test_subset_rejects_out_of_range() {
        let data = toy_dataset(2);
        assert!(Subset::new(&data, vec![0, 2]).is_err());
    }

    #[test]
    fn test_mask_shape_is_checked() {
        let data = toy_dataset(2);
        assert!(data.clone().with_mask(Array2::from_elem((4, 4), true)).is_ok());
        assert!(data.with_mask(Array2::from_elem((3, 4), true)).is_err());
    }

    #[test]
    fn test_translation_count_must_match() {
        let patterns = Array3::zeros((2, 4, 4));
        let result = Ptycho2DDataset::new(vec![[0.0; 3]], patterns, 1e-9, DetectorGeometry::default());
        assert!(matches!(result, Err(DatasetError::Shape(_))));
    }
}
