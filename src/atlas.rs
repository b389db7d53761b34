// Labeled feature tables and atlas column partitioning

use log::{info, warn};
use ndarray::{concatenate, Array1, Array2, Axis};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::Normal;
use std::fmt;

use crate::selection::parse_column_ranges;
use crate::ThreadSafeStdError;

/// Status assigned to each atlas column when a selection is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnStatus {
    /// Held constant for the whole run.
    Fixed,
    /// Re-estimated every iteration.
    Optimized,
    /// Dropped from the working atlas before optimization.
    Excluded,
    /// Newly appended unknown column; always re-estimated.
    Added,
}

impl fmt::Display for ColumnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnStatus::Fixed => "fixed",
            ColumnStatus::Optimized => "optimized",
            ColumnStatus::Excluded => "excluded",
            ColumnStatus::Added => "added",
        };
        f.write_str(name)
    }
}

/// User column selections over the reference atlas, in the cut-like range
/// syntax of [`parse_column_ranges`](crate::selection::parse_column_ranges).
///
/// `fix` and `optimize` are mutually exclusive; columns mentioned in neither
/// default to the complement of whichever selection was given (all fixed when
/// neither is given). `exclude` drops columns from the working atlas before
/// any other logic. `add` counts unknown columns appended beyond the original
/// atlas; those are always re-estimated.
#[derive(Clone, Debug, Default)]
pub struct ColumnSelection {
    pub fix: Option<String>,
    pub optimize: Option<String>,
    pub exclude: Option<String>,
    pub add: usize,
}

/// Resolved column partition: which original columns survive, and which of
/// the survivors are fixed.
#[derive(Clone, Debug)]
pub struct ColumnPartition {
    /// Per-column status over the full atlas width (added columns included).
    pub statuses: Vec<ColumnStatus>,
    /// Indices of the retained columns, in original order.
    pub kept_indices: Vec<usize>,
    /// One flag per retained column; `true` marks a fixed column.
    pub fixed_mask: Vec<bool>,
}

impl ColumnSelection {
    /// Resolves this selection against an atlas of `atlas_columns` columns
    /// (the original width plus the `add` appended unknowns).
    ///
    /// # Errors
    ///
    /// Returns an error if both `fix` and `optimize` are given, if `add`
    /// exceeds the atlas width, if any selection string is malformed, or if
    /// an index appears in both the fix/optimize selection and the exclude
    /// selection.
    pub fn resolve(&self, atlas_columns: usize) -> Result<ColumnPartition, ThreadSafeStdError> {
        if self.fix.is_some() && self.optimize.is_some() {
            return Err("Column selections fix and optimize are mutually exclusive.".into());
        }
        let original_columns = atlas_columns.checked_sub(self.add).ok_or_else(|| {
            format!(
                "Selection adds {} columns but the atlas only has {}.",
                self.add, atlas_columns
            )
        })?;

        // Unlisted columns take the complement of whichever list was given.
        let default_status = if self.fix.is_some() {
            ColumnStatus::Optimized
        } else {
            ColumnStatus::Fixed
        };
        let mut statuses = vec![default_status; original_columns];

        let chosen = match (&self.fix, &self.optimize) {
            (Some(selection), None) => Some((selection, ColumnStatus::Fixed)),
            (None, Some(selection)) => Some((selection, ColumnStatus::Optimized)),
            _ => None,
        };
        let mut listed = Vec::new();
        if let Some((selection, status)) = chosen {
            listed = parse_column_ranges(selection, original_columns)?;
            for &index in &listed {
                statuses[index] = status;
            }
        }

        if let Some(selection) = &self.exclude {
            let excluded = parse_column_ranges(selection, original_columns)?;
            if let Some(&clash) = excluded.iter().find(|i| listed.contains(i)) {
                return Err(format!(
                    "Column {} appears in both the exclude selection and the fix/optimize selection.",
                    clash + 1
                )
                .into());
            }
            for index in excluded {
                statuses[index] = ColumnStatus::Excluded;
            }
        }

        statuses.extend(std::iter::repeat(ColumnStatus::Added).take(self.add));

        let kept_indices: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != ColumnStatus::Excluded)
            .map(|(i, _)| i)
            .collect();
        let fixed_mask: Vec<bool> = kept_indices
            .iter()
            .map(|&i| statuses[i] == ColumnStatus::Fixed)
            .collect();

        Ok(ColumnPartition {
            statuses,
            kept_indices,
            fixed_mask,
        })
    }
}

/// A dense table of non-negative values with named feature rows and named
/// columns. Used for both the sample table and the reference atlas; the
/// numeric core only ever sees the underlying matrix and a fixed-column mask.
#[derive(Clone, Debug)]
pub struct FeatureTable {
    feature_names: Vec<String>,
    column_names: Vec<String>,
    values: Array2<f64>,
}

impl FeatureTable {
    /// Builds a table, validating that the name vectors match the matrix
    /// dimensions.
    pub fn new(
        feature_names: Vec<String>,
        column_names: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, ThreadSafeStdError> {
        if feature_names.len() != values.nrows() {
            return Err(format!(
                "Table has {} feature names but {} value rows.",
                feature_names.len(),
                values.nrows()
            )
            .into());
        }
        if column_names.len() != values.ncols() {
            return Err(format!(
                "Table has {} column names but {} value columns.",
                column_names.len(),
                values.ncols()
            )
            .into());
        }
        Ok(Self {
            feature_names,
            column_names,
            values,
        })
    }

    /// Generates a full-NMF atlas of `n_columns` unknown columns over the
    /// given features. At least two columns are required for a meaningful
    /// factorization.
    pub fn nmf_atlas<R: Rng + ?Sized>(
        feature_names: Vec<String>,
        n_columns: usize,
        rng: &mut R,
    ) -> Result<Self, ThreadSafeStdError> {
        if n_columns < 2 {
            return Err(format!(
                "A full-NMF atlas needs at least 2 columns, got {}.",
                n_columns
            )
            .into());
        }
        let n_features = feature_names.len();
        let mut atlas = Self {
            feature_names,
            column_names: Vec::new(),
            values: Array2::zeros((n_features, 0)),
        };
        atlas.append_unknown_columns(n_columns, rng)?;
        info!("Full NMF mode: initialized atlas with {} unknown columns.", n_columns);
        Ok(atlas)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Consumes the table, handing the bare matrix to the numeric core.
    pub fn into_values(self) -> Array2<f64> {
        self.values
    }

    pub fn n_features(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    /// Normalizes each column to sum to one (sample tables where every sample
    /// is a distribution over features). A zero-sum column becomes NaN and is
    /// logged.
    pub fn normalize_columns(&mut self) {
        for (column_idx, mut column) in self.values.axis_iter_mut(Axis(1)).enumerate() {
            let sum = column.sum();
            if sum == 0.0 {
                warn!(
                    "Column {:?} sums to zero; normalization yields NaN.",
                    self.column_names[column_idx]
                );
            }
            column.mapv_inplace(|v| v / sum);
        }
    }

    /// Appends `count` randomly initialized unknown columns named
    /// `Unknown.1`, `Unknown.2`, ... Values are drawn per feature from
    /// Normal(0.75, 0.5) and clamped into [0, 1].
    ///
    /// # Errors
    ///
    /// Returns an error if a generated name collides with an existing column.
    pub fn append_unknown_columns<R: Rng + ?Sized>(
        &mut self,
        count: usize,
        rng: &mut R,
    ) -> Result<(), ThreadSafeStdError> {
        let distribution =
            Normal::new(0.75, 0.5).expect("Normal(0.75, 0.5) is a valid distribution");
        for i in 0..count {
            let name = format!("Unknown.{}", i + 1);
            if self.column_names.contains(&name) {
                return Err(format!(
                    "Atlas already contains a column named {:?}; cannot append unknowns.",
                    name
                )
                .into());
            }
            let column: Array1<f64> =
                Array1::random_using(self.n_features(), distribution, rng)
                    .mapv(|v: f64| v.clamp(0.0, 1.0));
            self.values = concatenate![Axis(1), self.values, column.insert_axis(Axis(1))];
            self.column_names.push(name);
        }
        Ok(())
    }

    /// Applies a resolved partition: drops excluded columns, keeping names
    /// and values aligned. Logs the per-column statuses the way the original
    /// tooling reported them.
    pub fn apply_partition(
        &self,
        partition: &ColumnPartition,
    ) -> Result<FeatureTable, ThreadSafeStdError> {
        if partition.statuses.len() != self.n_columns() {
            return Err(format!(
                "Partition covers {} columns but the atlas has {}.",
                partition.statuses.len(),
                self.n_columns()
            )
            .into());
        }

        for status in [
            ColumnStatus::Fixed,
            ColumnStatus::Optimized,
            ColumnStatus::Excluded,
            ColumnStatus::Added,
        ] {
            let members: Vec<&str> = partition
                .statuses
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == status)
                .map(|(i, _)| self.column_names[i].as_str())
                .collect();
            info!("{} columns are {}: {:?}", members.len(), status, members);
        }

        let values = self.values.select(Axis(1), &partition.kept_indices);
        let column_names = partition
            .kept_indices
            .iter()
            .map(|&i| self.column_names[i].clone())
            .collect();
        FeatureTable::new(self.feature_names.clone(), column_names, values)
    }

    /// Fatal precondition of the optimization: the atlas and the sample table
    /// must carry identical feature names in identical order.
    pub fn check_feature_alignment(&self, other: &FeatureTable) -> Result<(), ThreadSafeStdError> {
        if self.feature_names.len() != other.feature_names.len() {
            return Err(format!(
                "Feature sets differ in length: {} vs {}.",
                self.feature_names.len(),
                other.feature_names.len()
            )
            .into());
        }
        for (row, (a, b)) in self
            .feature_names
            .iter()
            .zip(other.feature_names.iter())
            .enumerate()
        {
            if a != b {
                return Err(format!(
                    "Feature mismatch at row {}: {:?} vs {:?}; the two tables must share \
                     an identical, identically-ordered feature set.",
                    row, a, b
                )
                .into());
            }
        }
        Ok(())
    }
}
