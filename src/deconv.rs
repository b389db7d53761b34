// Deconvolution engine: alternating constrained least squares (ssNMF)

use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::nnls::nnls;
use crate::ThreadSafeStdError;

/// Parameters of one deconvolution run.
///
/// `beta` and `eta` enter the optimization as augmented rows of the NNLS
/// systems: a `sqrt(beta)` row appended to the reference matrix pulls each
/// sample's proportions toward sparsity, and a `sqrt(eta)` identity block
/// appended to the transposed proportions pulls re-estimated reference
/// columns toward zero unless the data supports them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeconvolutionConfig {
    /// Sparsity regularization on the proportions. Must be non-negative.
    pub beta: f64,
    /// Ridge regularization on re-estimated reference columns. Must be
    /// non-negative when set; `None` resolves to `max(X)^2` once per run.
    pub eta: Option<f64>,
    /// Number of alternating iterations. Must be positive. Ignored when every
    /// reference column is fixed (single NNLS pass).
    pub n_iter: usize,
    /// Renormalize each sample's proportions to sum to one.
    pub normalize_proportions: bool,
}

impl Default for DeconvolutionConfig {
    fn default() -> Self {
        Self {
            beta: 0.0,
            eta: None,
            n_iter: 100,
            normalize_proportions: true,
        }
    }
}

impl DeconvolutionConfig {
    fn validate(&self) -> Result<(), ThreadSafeStdError> {
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(format!("beta must be non-negative, got {}.", self.beta).into());
        }
        if let Some(eta) = self.eta {
            if !eta.is_finite() || eta < 0.0 {
                return Err(format!("eta must be non-negative, got {}.", eta).into());
            }
        }
        if self.n_iter == 0 {
            return Err("n_iter must be positive.".into());
        }
        Ok(())
    }

    /// Data-dependent default: `eta = max(X)^2` when the caller left it unset.
    pub(crate) fn resolve_eta(&self, samples: ArrayView2<f64>) -> f64 {
        self.eta.unwrap_or_else(|| {
            let max_value = samples.iter().fold(0.0f64, |acc, &v| acc.max(v));
            max_value * max_value
        })
    }
}

/// Result of a deconvolution run.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeconvolutionOutput {
    /// Final reference matrix, shape (features, reference columns). Fixed
    /// columns are unchanged from the input; free columns hold the learned
    /// profiles.
    pub reference: Array2<f64>,
    /// Final proportions matrix, shape (reference columns, samples).
    pub proportions: Array2<f64>,
    /// Reconstruction error after each completed iteration; exactly one entry
    /// when every column was fixed.
    pub error_history: Vec<f64>,
}

impl DeconvolutionOutput {
    /// Saves this result to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if file creation or serialization fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let file = File::create(path.as_ref())
            .map_err(|e| format!("Failed to create file at {:?}: {}", path.as_ref(), e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| format!("Failed to serialize deconvolution output: {}", e))?;
        Ok(())
    }

    /// Loads a result previously written with `save`.
    ///
    /// # Errors
    /// Returns an error if file I/O or deserialization fails, or if the
    /// loaded matrices have inconsistent shapes.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ThreadSafeStdError> {
        let file = File::open(path.as_ref())
            .map_err(|e| format!("Failed to open file at {:?}: {}", path.as_ref(), e))?;
        let mut reader = BufReader::new(file);
        let output: DeconvolutionOutput =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| format!("Failed to deserialize deconvolution output: {}", e))?;

        if output.reference.ncols() != output.proportions.nrows() {
            return Err(format!(
                "Loaded output is inconsistent: reference has {} columns but proportions has {} rows.",
                output.reference.ncols(),
                output.proportions.nrows()
            )
            .into());
        }
        if output.error_history.is_empty() {
            return Err("Loaded output has an empty error history.".into());
        }
        Ok(output)
    }
}

/// Root-sum-of-squares reconstruction error `sqrt(sum((A . Y - X)^2))`.
pub fn reconstruction_error(
    reference: &Array2<f64>,
    proportions: &Array2<f64>,
    samples: &Array2<f64>,
) -> f64 {
    let residual = reference.dot(proportions) - samples;
    residual.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Estimates the proportions matrix for fixed reference profiles.
///
/// Appends a `sqrt(beta)` row to the reference matrix and a zero row to the
/// sample matrix, then solves one NNLS problem per sample column. The
/// per-sample solves are independent and run in parallel; results are
/// gathered into the output matrix only after every solve has finished. With
/// `normalize` set, each sample's proportions are divided by their sum; a
/// zero sum leaves that column as NaN (the non-negative optimum can
/// legitimately be the origin for a degenerate sample) and is logged.
///
/// * `reference` - reference matrix, shape (features, reference columns).
/// * `samples` - sample matrix, shape (features, samples).
/// * `beta` - non-negative sparsity regularizer; `0.0` makes the augmented
///   row a no-op.
/// * `normalize` - renormalize each output column to sum to one.
///
/// # Errors
/// Returns an error if the matrices disagree on the feature count or if any
/// sample's NNLS solve fails; the error names the failing sample column.
pub fn estimate_proportions(
    reference: ArrayView2<f64>,
    samples: ArrayView2<f64>,
    beta: f64,
    normalize: bool,
) -> Result<Array2<f64>, ThreadSafeStdError> {
    let n_features = reference.nrows();
    let n_refs = reference.ncols();
    let n_samples = samples.ncols();

    if samples.nrows() != n_features {
        return Err(format!(
            "Reference matrix has {} feature rows but sample matrix has {}.",
            n_features,
            samples.nrows()
        )
        .into());
    }

    // Augmented system: design picks up a sqrt(beta) row, targets a zero row.
    let mut augmented_design = Array2::<f64>::zeros((n_features + 1, n_refs));
    augmented_design
        .slice_mut(s![..n_features, ..])
        .assign(&reference);
    augmented_design.row_mut(n_features).fill(beta.sqrt());

    let mut augmented_targets = Array2::<f64>::zeros((n_features + 1, n_samples));
    augmented_targets
        .slice_mut(s![..n_features, ..])
        .assign(&samples);

    let solutions: Vec<Array1<f64>> = (0..n_samples)
        .into_par_iter()
        .map(|sample_idx| {
            nnls(
                augmented_design.view(),
                augmented_targets.column(sample_idx),
                None,
            )
            .map(|solution| solution.coefficients)
            .map_err(|e| -> ThreadSafeStdError {
                format!("Proportion estimation failed for sample column {}: {}", sample_idx, e)
                    .into()
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut proportions = Array2::<f64>::zeros((n_refs, n_samples));
    for (sample_idx, coefficients) in solutions.iter().enumerate() {
        proportions.column_mut(sample_idx).assign(coefficients);
    }

    if normalize {
        for (sample_idx, mut column) in proportions.axis_iter_mut(Axis(1)).enumerate() {
            let sum = column.sum();
            if sum == 0.0 {
                warn!(
                    "Sample column {} has all-zero proportions; normalization yields NaN.",
                    sample_idx
                );
            }
            column.mapv_inplace(|v| v / sum);
        }
    }

    Ok(proportions)
}

/// Re-estimates the free reference columns from the current proportions.
///
/// The portion of the samples already explained by fixed columns is removed,
/// and each feature row of the remainder is regressed onto the free rows of
/// the proportions matrix under a `sqrt(eta)` ridge block with zero targets.
/// The per-feature solves are independent and run in parallel; free columns
/// of `reference` are overwritten only after every solve has finished. Fixed
/// columns are never touched.
fn update_reference(
    reference: &mut Array2<f64>,
    samples: ArrayView2<f64>,
    proportions: &Array2<f64>,
    fixed_indices: &[usize],
    free_indices: &[usize],
    eta: f64,
) -> Result<(), ThreadSafeStdError> {
    let n_features = reference.nrows();
    let n_refs = reference.ncols();
    let n_samples = samples.ncols();

    let residual = if fixed_indices.is_empty() {
        samples.to_owned()
    } else {
        let fixed_reference = reference.select(Axis(1), fixed_indices);
        let fixed_proportions = proportions.select(Axis(0), fixed_indices);
        &samples - &fixed_reference.dot(&fixed_proportions)
    };

    // Design: transposed free proportions over a sqrt(eta) identity block.
    // Rows of the block belonging to fixed columns stay zero and are inert.
    let sqrt_eta = eta.sqrt();
    let mut design = Array2::<f64>::zeros((n_samples + n_refs, free_indices.len()));
    for (slot, &column) in free_indices.iter().enumerate() {
        design
            .slice_mut(s![..n_samples, slot])
            .assign(&proportions.row(column));
        design[[n_samples + column, slot]] = sqrt_eta;
    }

    // Targets: transposed residual over a zero block matching the ridge rows.
    let mut targets = Array2::<f64>::zeros((n_samples + n_refs, n_features));
    targets.slice_mut(s![..n_samples, ..]).assign(&residual.t());

    let solutions: Vec<Array1<f64>> = (0..n_features)
        .into_par_iter()
        .map(|feature_idx| {
            nnls(design.view(), targets.column(feature_idx), None)
                .map(|solution| solution.coefficients)
                .map_err(|e| -> ThreadSafeStdError {
                    format!("Reference update failed for feature row {}: {}", feature_idx, e)
                        .into()
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (feature_idx, coefficients) in solutions.iter().enumerate() {
        for (slot, &column) in free_indices.iter().enumerate() {
            reference[[feature_idx, column]] = coefficients[slot];
        }
    }

    Ok(())
}

/// Runs the full deconvolution: alternating proportion estimation and
/// reference updates over a fixed iteration budget.
///
/// With every column of `fixed` set, the run reduces to a single proportion
/// estimation (NNLS-only mode): the returned reference matrix is the input,
/// untouched, and the error history has exactly one entry. Otherwise the loop
/// runs for exactly `config.n_iter` iterations with no early stopping, and
/// the history has one entry per iteration. Ridge terms can transiently
/// increase the raw reconstruction error, so the history is not guaranteed to
/// be monotone.
///
/// * `reference` - reference matrix, shape (features, reference columns);
///   consumed, free columns are re-estimated in place.
/// * `samples` - sample matrix, shape (features, samples); rows must align
///   with the reference's feature rows.
/// * `fixed` - one flag per reference column; `true` holds that column
///   constant for the whole run.
/// * `config` - regularization and iteration parameters.
///
/// # Errors
/// Returns an error before any numeric work if the feature counts disagree,
/// the mask length does not match the reference column count, either matrix
/// is empty, or the configuration is invalid; and during the run if any
/// per-sample or per-feature solve fails.
pub fn run_deconvolution(
    mut reference: Array2<f64>,
    samples: &Array2<f64>,
    fixed: &[bool],
    config: &DeconvolutionConfig,
) -> Result<DeconvolutionOutput, ThreadSafeStdError> {
    config.validate()?;

    let n_features = reference.nrows();
    let n_refs = reference.ncols();
    let n_samples = samples.ncols();

    if samples.nrows() != n_features {
        return Err(format!(
            "Reference matrix has {} feature rows but sample matrix has {}; \
             the two tables must share an identical, identically-ordered feature set.",
            n_features,
            samples.nrows()
        )
        .into());
    }
    if fixed.len() != n_refs {
        return Err(format!(
            "Fixed mask has length {} but the reference matrix has {} columns.",
            fixed.len(),
            n_refs
        )
        .into());
    }
    if n_features == 0 || n_refs == 0 || n_samples == 0 {
        return Err("Reference and sample matrices must be non-empty.".into());
    }

    let mut history = Vec::new();

    if fixed.iter().all(|&f| f) {
        // All columns fixed: no factorization, a single NNLS pass.
        info!(
            "Deconvolving {} samples against {} fixed reference columns ({} features, NNLS-only).",
            n_samples, n_refs, n_features
        );
        let proportions = estimate_proportions(
            reference.view(),
            samples.view(),
            config.beta,
            config.normalize_proportions,
        )?;
        history.push(reconstruction_error(&reference, &proportions, samples));
        return Ok(DeconvolutionOutput {
            reference,
            proportions,
            error_history: history,
        });
    }

    let fixed_indices: Vec<usize> = (0..n_refs).filter(|&i| fixed[i]).collect();
    let free_indices: Vec<usize> = (0..n_refs).filter(|&i| !fixed[i]).collect();
    let eta = config.resolve_eta(samples.view());

    info!(
        "Deconvolving {} samples against {} reference columns ({} fixed, {} free, \
         {} features, beta = {}, eta = {}, {} iterations).",
        n_samples,
        n_refs,
        fixed_indices.len(),
        free_indices.len(),
        n_features,
        config.beta,
        eta,
        config.n_iter
    );

    let mut proportions = Array2::<f64>::zeros((n_refs, n_samples));
    for iteration in 1..=config.n_iter {
        proportions = estimate_proportions(
            reference.view(),
            samples.view(),
            config.beta,
            config.normalize_proportions,
        )?;
        update_reference(
            &mut reference,
            samples.view(),
            &proportions,
            &fixed_indices,
            &free_indices,
            eta,
        )?;
        let error = reconstruction_error(&reference, &proportions, samples);
        debug!(
            "Iteration {}/{}: reconstruction error {:.6}.",
            iteration, config.n_iter, error
        );
        history.push(error);
    }

    Ok(DeconvolutionOutput {
        reference,
        proportions,
        error_history: history,
    })
}
