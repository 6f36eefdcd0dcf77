//! Model-outlier rejection between the two fit passes.

use tracing::info;

use crate::domain::RunContext;
use crate::math::reject_outliers;

/// Good-pixel mask of one spectrum window after rejecting model outliers.
///
/// Pixels deviating from the first-pass model by more than `nsigma` local
/// robust sigmas (within a `boxcar`-wide window) are removed; pixels already
/// excluded stay excluded.
pub fn rejection_mask(
    flux: &[f64],
    model: &[f64],
    good: &[bool],
    boxcar: usize,
    nsigma: f64,
) -> Vec<bool> {
    let residuals: Vec<f64> = flux.iter().zip(model).map(|(f, m)| f - m).collect();
    let rejected = reject_outliers(&residuals, good, boxcar, nsigma);
    good.iter()
        .zip(&rejected)
        .map(|(g, r)| *g && !r)
        .collect()
}

/// Log how many pixels the rejection removed in total.
pub fn report_rejections(before: &[Vec<bool>], after: &[Vec<bool>], ctx: &RunContext) {
    if ctx.quiet {
        return;
    }
    let count = |masks: &[Vec<bool>]| masks.iter().flatten().filter(|g| **g).count();
    let removed = count(before).saturating_sub(count(after));
    info!(
        "Rejected {removed} pixels as model outliers in {} spectra.",
        after.len()
    );
}
