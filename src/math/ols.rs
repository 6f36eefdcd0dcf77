//! Weighted linear least squares.
//!
//! For fixed kinematics the model is linear in the template weights and
//! additive polynomial coefficients:
//!
//! ```text
//! minimize Σ ((y_i - x_i^T β) / e_i)^2
//! ```
//!
//! Rows are scaled by `1 / e_i` before the solve. We use SVD because the design
//! matrix is tall and templates can be nearly collinear (blended lines).

use nalgebra::{DMatrix, DVector};

/// Singular values below `tol * max(singular value)` are treated as zero.
const RCOND: f64 = 1e-12;

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Diagonal of `(X^T X)^+`, i.e. the variance of each coefficient for unit errors.
///
/// Columns that do not contribute (all-zero templates) get a variance of zero.
pub fn coefficient_variances(x: &DMatrix<f64>) -> Option<Vec<f64>> {
    let svd = x.clone().svd(false, true);
    let v_t = svd.v_t.as_ref()?;
    let s_max = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    if !(s_max.is_finite() && s_max > 0.0) {
        return None;
    }

    let ncols = x.ncols();
    let mut var = vec![0.0; ncols];
    for (k, s) in svd.singular_values.iter().enumerate() {
        if *s <= RCOND * s_max {
            continue;
        }
        let inv = 1.0 / (s * s);
        for (j, v) in var.iter_mut().enumerate() {
            let vkj = v_t[(k, j)];
            *v += vkj * vkj * inv;
        }
    }
    Some(var)
}
