//! (Weighted) linear least squares via the normal equations.

use nalgebra::{DMatrix, DVector};

/// Squared Cholesky pivots below this fraction of the column's own squared
/// norm mean the column is (numerically) inside the span of the others.
const RANK_TOLERANCE: f64 = 1e-8;

/// Least-squares solution of `design * coefs ≈ target`.
#[derive(Debug, Clone)]
pub(crate) struct LstsqFit {
    pub coefs: DVector<f64>,
    /// `design * coefs`, always in the unweighted space.
    pub fitted: DVector<f64>,
}

/// Solve `min_c Σ_i w_i (target_i - (design c)_i)²`.
///
/// Returns `None` when the design does not have full column rank under the
/// given weights.
pub(crate) fn solve(
    design: &DMatrix<f64>,
    target: &DVector<f64>,
    weights: Option<&DVector<f64>>,
) -> Option<LstsqFit> {
    let k = design.ncols();
    if k == 0 {
        return Some(LstsqFit {
            coefs: DVector::zeros(0),
            fitted: DVector::zeros(design.nrows()),
        });
    }
    if k > design.nrows() {
        return None;
    }

    let (a, b) = match weights {
        Some(w) => {
            let sqrt_w = w.map(f64::sqrt);
            let mut a = design.clone();
            for (mut row, &s) in a.row_iter_mut().zip(sqrt_w.iter()) {
                row *= s;
            }
            (a, target.component_mul(&sqrt_w))
        }
        None => (design.clone(), target.clone()),
    };

    let gram = a.transpose() * &a;
    let diag = gram.diagonal();
    let chol = gram.cholesky()?;
    let l = chol.l();
    for j in 0..k {
        let pivot = l[(j, j)];
        if !(pivot.is_finite() && pivot * pivot > RANK_TOLERANCE * diag[j].max(f64::MIN_POSITIVE)) {
            return None;
        }
    }

    let coefs = chol.solve(&(a.transpose() * b));
    let fitted = design * &coefs;
    Some(LstsqFit { coefs, fitted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exact_system_is_recovered() {
        let design = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let truth = DVector::from_vec(vec![2.0, -1.0]);
        let target = &design * &truth;
        let fit = solve(&design, &target, None).unwrap();
        assert_relative_eq!(fit.coefs[0], 2.0, epsilon = 1e-10);
        assert_relative_eq!(fit.coefs[1], -1.0, epsilon = 1e-10);
    }

    #[test]
    fn dependent_columns_are_rejected() {
        let design = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 1.0, 2.0, 0.0, 0.0]);
        let target = DVector::from_vec(vec![1.0, 1.0, 0.0]);
        assert!(solve(&design, &target, None).is_none());
    }

    #[test]
    fn weights_pull_fit_towards_heavy_entries() {
        // One parameter, two contradicting observations.
        let design = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let target = DVector::from_vec(vec![0.0, 1.0]);
        let even = solve(&design, &target, None).unwrap();
        assert_relative_eq!(even.coefs[0], 0.5, epsilon = 1e-12);
        let w = DVector::from_vec(vec![1.0, 3.0]);
        let weighted = solve(&design, &target, Some(&w)).unwrap();
        assert_relative_eq!(weighted.coefs[0], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn empty_design_fits_zero() {
        let design = DMatrix::<f64>::zeros(4, 0);
        let target = DVector::from_element(4, 1.0);
        let fit = solve(&design, &target, None).unwrap();
        assert_eq!(fit.coefs.len(), 0);
        assert!(fit.fitted.iter().all(|&v| v == 0.0));
    }
}
