// Semi-supervised NMF deconvolution (ssNMF)

#![doc = include_str!("../README.md")]

use std::error::Error;

pub mod atlas;
pub mod deconv;
pub mod nnls;
pub mod selection;

pub use atlas::{ColumnPartition, ColumnSelection, ColumnStatus, FeatureTable};
pub use deconv::{
    estimate_proportions, reconstruction_error, run_deconvolution, DeconvolutionConfig,
    DeconvolutionOutput,
};
pub use nnls::{nnls, NnlsSolution};
pub use selection::parse_column_ranges;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
///
/// The per-sample and per-feature NNLS sub-problems run on rayon workers,
/// which require their error values to cross thread boundaries.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;
