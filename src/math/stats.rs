//! Robust statistics on fit residuals.

use std::cmp::Ordering;

/// Scale factor turning a median absolute deviation into a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.482_602_218_505_602;

/// Median of `values`; sorts in place.
pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Median and MAD-based sigma of the finite values.
pub fn robust_location_scale(values: &[f64]) -> Option<(f64, f64)> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    let med = median_mut(&mut v)?;
    let mut dev: Vec<f64> = v.iter().map(|x| (x - med).abs()).collect();
    let mad = median_mut(&mut dev)?;
    Some((med, MAD_TO_SIGMA * mad))
}

/// Linearly interpolated percentile (`q` in `[0, 1]`) of sorted data.
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let t = pos - lo as f64;
    sorted[lo] + t * (sorted[hi] - sorted[lo])
}

/// Growth statistics of `|values|`: `[min, 68%, 95%, 99%, max]`.
///
/// Returns `None` when no finite value is available.
pub fn growth_stats(values: &[f64]) -> Option<[f64; 5]> {
    let mut abs: Vec<f64> = values.iter().filter(|v| v.is_finite()).map(|v| v.abs()).collect();
    if abs.is_empty() {
        return None;
    }
    abs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Some([
        abs[0],
        percentile_sorted(&abs, 0.68),
        percentile_sorted(&abs, 0.95),
        percentile_sorted(&abs, 0.99),
        abs[abs.len() - 1],
    ])
}

/// Root mean square of the finite values.
pub fn rms(values: &[f64]) -> Option<f64> {
    let (sum, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v * v, n + 1));
    (n > 0).then(|| (sum / n as f64).sqrt())
}

/// Flag pixels whose residual deviates from the local median by more than
/// `nsigma` local robust sigmas.
///
/// The local statistics use the good pixels inside a `boxcar`-wide window
/// centred on each pixel. Only good pixels can be flagged.
pub fn reject_outliers(residuals: &[f64], good: &[bool], boxcar: usize, nsigma: f64) -> Vec<bool> {
    let n = residuals.len();
    let half = boxcar.max(1) / 2;
    let mut rejected = vec![false; n];

    let good_idx: Vec<usize> = (0..n)
        .filter(|&i| good.get(i).copied().unwrap_or(false) && residuals[i].is_finite())
        .collect();

    for &i in &good_idx {
        let lo = i.saturating_sub(half);
        let hi = (i + half).min(n - 1);
        let first = good_idx.partition_point(|&k| k < lo);
        let last = good_idx.partition_point(|&k| k <= hi);
        let window: Vec<f64> = good_idx[first..last].iter().map(|&k| residuals[k]).collect();
        if window.len() < 3 {
            continue;
        }
        let Some((med, sigma)) = robust_location_scale(&window) else {
            continue;
        };
        if sigma > 0.0 && (residuals[i] - med).abs() > nsigma * sigma {
            rejected[i] = true;
        }
    }
    rejected
}
