//! Search grids for the kinematic parameters.
//!
//! Velocities are searched on a linear grid, dispersions on a log grid (the
//! chi-square surface in sigma is much flatter at large dispersions).

use crate::error::OptimizerError;

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, OptimizerError> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max >= min) {
        return Err(OptimizerError::Other(format!(
            "invalid log grid range: min={min}, max={max} (must be finite, >0, and max>=min)"
        )));
    }
    let ln = linear_space(min.ln(), max.ln(), steps)?;
    Ok(ln.into_iter().map(f64::exp).collect())
}

/// Generate `steps` evenly spaced points between `min` and `max` (inclusive).
pub fn linear_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, OptimizerError> {
    if !(min.is_finite() && max.is_finite() && max >= min) {
        return Err(OptimizerError::Other(format!(
            "invalid grid range: min={min}, max={max}"
        )));
    }
    if steps < 2 {
        return Err(OptimizerError::Other("grid steps must be >= 2".to_string()));
    }
    let step = (max - min) / (steps as f64 - 1.0);
    Ok((0..steps).map(|i| min + step * i as f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_space_includes_endpoints() {
        let v = log_space(0.1, 10.0, 5).unwrap();
        assert!((v[0] - 0.1).abs() < 1e-12);
        assert!((v[v.len() - 1] - 10.0).abs() < 1e-12);
        assert!((v[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_degenerate_grids() {
        assert!(log_space(0.0, 10.0, 5).is_err());
        assert!(linear_space(0.0, 1.0, 1).is_err());
    }
}
