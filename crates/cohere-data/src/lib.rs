//! # Cohere Data
//!
//! Dataset collaborators for the cohere reconstruction engine. The driver in
//! `cohere-optim` only needs random access to `(input, pattern)` pairs, a
//! length, and batched iteration; this crate supplies those pieces.
//!
//! ## Modules
//!
//! - [`dataset`]: The [`Dataset`](dataset::Dataset) trait, the in-memory
//!   [`Ptycho2DDataset`](dataset::Ptycho2DDataset) and index [`Subset`](dataset::Subset)s.
//! - [`loader`]: Shuffled minibatches and sub-chunks for gradient accumulation.
//! - [`geometry`]: Optional detector geometry descriptor.

pub mod dataset;
pub mod geometry;
pub mod loader;

pub use dataset::{Dataset, DatasetError, Ptycho2DDataset, PtychoInput, Selection, Subset};
pub use geometry::DetectorGeometry;
pub use loader::{Batch, Batches, DataLoader};
