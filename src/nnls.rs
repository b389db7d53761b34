// Non-negative least squares (Lawson-Hanson active-set method)

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::LeastSquaresSvd;

use crate::ThreadSafeStdError;

/// Result of one non-negative least-squares solve.
#[derive(Clone, Debug)]
pub struct NnlsSolution {
    /// Non-negative coefficient vector, length = number of design columns.
    pub coefficients: Array1<f64>,
    /// Euclidean norm of `target - design . coefficients` at the solution.
    pub residual_norm: f64,
    /// Number of least-squares sub-solves performed.
    pub iterations: usize,
}

/// Entries of the working iterate at or below this value are pushed back to
/// the active set during the inner correction loop. The blocking coordinate
/// lands on zero only up to rounding, so an exact `<= 0.0` test can cycle.
const ZERO_THRESHOLD: f64 = 1e-12;

/// Solves `argmin_y ||design . y - target||_2` subject to `y >= 0` elementwise
/// with the Lawson-Hanson active-set method.
///
/// The unconstrained sub-problems on the passive set are solved through
/// LAPACK's SVD-based least squares, so rank-deficient passive sets do not
/// break the iteration. At the returned solution the KKT conditions hold up
/// to a scale-relative tolerance: coefficients are non-negative, and the dual
/// vector `design^T (target - design . y)` is non-positive (within tolerance)
/// on the zero coordinates.
///
/// * `design` - design matrix, shape (m, k).
/// * `target` - target vector, length m.
/// * `max_iterations` - cap on least-squares sub-solves. `None` uses `3 * k`,
///   the conventional Lawson-Hanson budget.
///
/// # Errors
///
/// Returns an error if `target` length does not match the design row count,
/// if an inner least-squares solve fails, or if the iteration cap is reached
/// without convergence.
pub fn nnls(
    design: ArrayView2<f64>,
    target: ArrayView1<f64>,
    max_iterations: Option<usize>,
) -> Result<NnlsSolution, ThreadSafeStdError> {
    let m = design.nrows();
    let k = design.ncols();

    if target.len() != m {
        return Err(format!(
            "NNLS dimension mismatch: design has {} rows but target has length {}.",
            m,
            target.len()
        )
        .into());
    }

    if k == 0 {
        let residual_norm = target.dot(&target).sqrt();
        return Ok(NnlsSolution {
            coefficients: Array1::zeros(0),
            residual_norm,
            iterations: 0,
        });
    }

    let max_iterations = max_iterations.unwrap_or(3 * k);
    let target_owned = target.to_owned();

    // Dual-feasibility tolerance, relative to the magnitude of the design.
    let design_scale = design.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let tolerance = 10.0 * f64::EPSILON * design_scale * (m.max(k) as f64);

    let mut coefficients = Array1::<f64>::zeros(k);
    let mut passive = vec![false; k];
    let mut dual = design.t().dot(&target_owned);
    let mut iterations = 0usize;

    loop {
        // Most violated stationarity condition among the active coordinates.
        let candidate = dual
            .iter()
            .enumerate()
            .filter(|(i, _)| !passive[*i])
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let entering = match candidate {
            Some((i, &w)) if w > tolerance => i,
            _ => break,
        };
        passive[entering] = true;

        // Inner correction loop: solve on the passive set, walk back along the
        // segment toward the previous iterate until the sub-solution is
        // feasible, dropping coordinates that hit zero.
        loop {
            iterations += 1;
            if iterations > max_iterations {
                return Err(format!(
                    "NNLS failed to converge within {} iterations.",
                    max_iterations
                )
                .into());
            }

            let passive_indices: Vec<usize> =
                (0..k).filter(|&i| passive[i]).collect();
            if passive_indices.is_empty() {
                coefficients.fill(0.0);
                break;
            }
            let sub_design = design.select(Axis(1), &passive_indices);
            let sub_solution = sub_design
                .least_squares(&target_owned)
                .map_err(|e| format!("NNLS passive-set least-squares solve failed: {}", e))?
                .solution;

            if sub_solution.iter().all(|&z| z > 0.0) {
                coefficients.fill(0.0);
                for (slot, &i) in passive_indices.iter().enumerate() {
                    coefficients[i] = sub_solution[slot];
                }
                break;
            }

            // Step length to the first coordinate that would cross zero.
            let mut alpha = f64::INFINITY;
            for (slot, &i) in passive_indices.iter().enumerate() {
                let z = sub_solution[slot];
                if z <= 0.0 {
                    let x = coefficients[i];
                    let step = x / (x - z);
                    if step.is_finite() && step < alpha {
                        alpha = step;
                    }
                }
            }
            if !alpha.is_finite() {
                alpha = 0.0;
            }

            for (slot, &i) in passive_indices.iter().enumerate() {
                coefficients[i] += alpha * (sub_solution[slot] - coefficients[i]);
            }
            for &i in &passive_indices {
                if coefficients[i] <= ZERO_THRESHOLD {
                    coefficients[i] = 0.0;
                    passive[i] = false;
                }
            }
        }

        let residual = &target_owned - &design.dot(&coefficients);
        dual = design.t().dot(&residual);
    }

    let residual = &target_owned - &design.dot(&coefficients);
    let residual_norm = residual.dot(&residual).sqrt();

    Ok(NnlsSolution {
        coefficients,
        residual_norm,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn identity_design_clamps_negative_targets() {
        let design = Array2::eye(3);
        let target = array![1.0, -1.0, 2.0];
        let solution = nnls(design.view(), target.view(), None).unwrap();
        assert_abs_diff_eq!(solution.coefficients[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(solution.coefficients[1], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(solution.coefficients[2], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(solution.residual_norm, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn exactly_representable_target_has_zero_residual() {
        let design = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let target = array![1.0, 1.0, 2.0];
        let solution = nnls(design.view(), target.view(), None).unwrap();
        assert_abs_diff_eq!(solution.coefficients[0], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(solution.coefficients[1], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(solution.residual_norm, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn matches_reference_overdetermined_solution() {
        // Reference values from the SciPy nnls documentation example.
        let design = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let target = array![2.0, 1.0, 1.0];
        let solution = nnls(design.view(), target.view(), None).unwrap();
        assert_abs_diff_eq!(solution.coefficients[0], 1.5, epsilon = 1e-10);
        assert_abs_diff_eq!(solution.coefficients[1], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(solution.residual_norm, 0.5f64.sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn all_negative_target_yields_origin() {
        let design = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let target = array![-1.0, -1.0, -1.0];
        let solution = nnls(design.view(), target.view(), None).unwrap();
        assert!(solution.coefficients.iter().all(|&v| v == 0.0));
        assert_abs_diff_eq!(solution.residual_norm, 3.0f64.sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn empty_design_returns_empty_solution() {
        let design = Array2::<f64>::zeros((3, 0));
        let target = array![1.0, 2.0, 2.0];
        let solution = nnls(design.view(), target.view(), None).unwrap();
        assert_eq!(solution.coefficients.len(), 0);
        assert_abs_diff_eq!(solution.residual_norm, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_target_length_is_rejected() {
        let design = Array2::<f64>::eye(3);
        let target = array![1.0, 2.0];
        assert!(nnls(design.view(), target.view(), None).is_err());
    }

    #[test]
    fn kkt_conditions_hold_on_random_problems() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for trial in 0..20 {
            let m = 8;
            let k = 5;
            let design =
                Array2::from_shape_fn((m, k), |_| rng.gen_range(-1.0..1.0f64));
            let target = Array1::from_shape_fn(m, |_| rng.gen_range(-2.0..2.0f64));
            let solution = nnls(design.view(), target.view(), None)
                .unwrap_or_else(|e| panic!("trial {} failed: {}", trial, e));

            assert!(
                solution.coefficients.iter().all(|&v| v >= 0.0),
                "trial {}: negative coefficient",
                trial
            );

            let dual = design.t().dot(&(&target - &design.dot(&solution.coefficients)));
            for i in 0..k {
                if solution.coefficients[i] > 0.0 {
                    assert!(
                        dual[i].abs() < 1e-7,
                        "trial {}: stationarity violated at {} ({})",
                        trial,
                        i,
                        dual[i]
                    );
                } else {
                    assert!(
                        dual[i] < 1e-7,
                        "trial {}: dual feasibility violated at {} ({})",
                        trial,
                        i,
                        dual[i]
                    );
                }
            }
        }
    }
}
