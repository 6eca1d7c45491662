//! Minibatch iteration with optional per-epoch shuffling.
//!
//! A [`DataLoader`] hands out [`Batch`]es of stacked patterns. Each batch can
//! be split further into sub-chunks with [`Batch::chunks`], which is how the
//! driver bounds memory while accumulating gradients over a large batch.

use ndarray::{s, stack, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::{Dataset, DatasetError};

/// A group of patterns processed together.
#[derive(Debug, Clone)]
pub struct Batch<I> {
    /// Per-pattern inputs, in the same order as `patterns`.
    pub inputs: Vec<I>,
    /// Observed patterns, shape `(B, M, N)`.
    pub patterns: Array3<f64>,
}

impl<I: Clone> Batch<I> {
    /// Stack `(input, pattern)` pairs into a batch.
    pub fn from_samples(samples: Vec<(I, Array2<f64>)>) -> Result<Self, DatasetError> {
        if samples.is_empty() {
            return Err(DatasetError::Empty);
        }
        let views: Vec<ArrayView2<f64>> = samples.iter().map(|(_, p)| p.view()).collect();
        let patterns = stack(Axis(0), &views[..])
            .map_err(|e| DatasetError::Shape(format!("cannot stack patterns: {e}")))?;
        let inputs = samples.into_iter().map(|(input, _)| input).collect();
        Ok(Self { inputs, patterns })
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Total observed signal in this batch.
    pub fn total_intensity(&self) -> f64 {
        self.patterns.sum()
    }

    /// Split into consecutive sub-chunks of at most `width` patterns.
    pub fn chunks(&self, width: usize) -> impl Iterator<Item = Batch<I>> + '_ {
        let width = width.max(1);
        (0..self.len()).step_by(width).map(move |start| {
            let end = (start + width).min(self.len());
            Batch {
                inputs: self.inputs[start..end].to_vec(),
                patterns: self.patterns.slice(s![start..end, .., ..]).to_owned(),
            }
        })
    }
}

/// Builder-style loader over a borrowed dataset.
pub struct DataLoader<'a, D: ?Sized> {
    dataset: &'a D,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl<'a, D: Dataset + ?Sized> DataLoader<'a, D> {
    /// Loader yielding one pattern per batch, in order.
    pub fn new(dataset: &'a D) -> Self {
        Self {
            dataset,
            batch_size: 1,
            shuffle: false,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Use the whole dataset as a single batch.
    pub fn full_batch(mut self) -> Self {
        self.batch_size = self.dataset.len().max(1);
        self
    }

    /// Reshuffle the pattern order every time [`batches`](Self::batches) is called.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Fix the shuffling seed for reproducible epochs.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn dataset(&self) -> &'a D {
        self.dataset
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of batches in one epoch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// One epoch worth of batches.
    pub fn batches(&mut self) -> Batches<'_, D> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        Batches {
            dataset: self.dataset,
            order,
            batch_size: self.batch_size,
            position: 0,
        }
    }
}

/// Iterator over the batches of one epoch.
pub struct Batches<'a, D: ?Sized> {
    dataset: &'a D,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl<D: Dataset + ?Sized> Iterator for Batches<'_, D> {
    type Item = Result<Batch<D::Input>, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (start + self.batch_size).min(self.order.len());
        self.position = end;

        let samples: Result<Vec<_>, _> = self.order[start..end]
            .iter()
            .map(|&idx| self.dataset.get(idx))
            .collect();
        Some(samples.and_then(Batch::from_samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Ptycho2DDataset;
    use crate::geometry::DetectorGeometry;

    fn toy_dataset(n: usize) -> Ptycho2DDataset {
        let patterns = Array3::from_shape_fn((n, 2, 2), |(i, _, _)| i as f64);
        let translations = vec![[0.0; 3]; n];
        Ptycho2DDataset::new(translations, patterns, 1e-9, DetectorGeometry::default()).unwrap()
    }

    #[test]
    fn test_batches_cover_dataset_once() {
        let data = toy_dataset(5);
        let mut loader = DataLoader::new(&data).batch_size(2);
        assert_eq!(loader.num_batches(), 3);

        let sizes: Vec<usize> = loader.batches().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_shuffle_is_a_permutation_and_seeded() {
        let data = toy_dataset(8);
        let collect = |seed| {
            let mut loader = DataLoader::new(&data).batch_size(3).shuffle(true).seed(seed);
            let mut seen: Vec<usize> = loader
                .batches()
                .flat_map(|b| b.unwrap().inputs.into_iter().map(|i| i.index))
                .collect();
            let order = seen.clone();
            seen.sort_unstable();
            assert_eq!(seen, (0..8).collect::<Vec<_>>());
            order
        };
        assert_eq!(collect(7), collect(7));
    }

    #[test]
    fn test_chunks_split_batch() {
        let data = toy_dataset(5);
        let mut loader = DataLoader::new(&data).full_batch();
        let batch = loader.batches().next().unwrap().unwrap();
        let chunks: Vec<_> = batch.chunks(2).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].inputs[0].index, 4);
        assert_eq!(chunks[2].patterns.dim(), (1, 2, 2));
        let total: f64 = chunks.iter().map(|c| c.total_intensity()).sum();
        assert!((total - batch.total_intensity()).abs() < 1e-12);
    }
}
