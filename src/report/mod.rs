//! Reporting utilities: per-line summaries across a batch of fits.

pub mod format;

pub use format::*;

use crate::domain::Flag;
use crate::fit::{EmissionLineFitOutput, SpectrumStatus};
use crate::math::median_mut;

/// Batch statistics of one database line over the successful fits.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSummary {
    pub index: i64,
    pub name: String,
    pub component: Option<usize>,
    /// Successful fits contributing to the medians.
    pub n_fit: usize,
    /// Fits in which the line carries any quality flag other than `UNDERSAMPLED`.
    pub n_flagged: usize,
    pub median_flux: f64,
    pub median_cz: f64,
    pub median_sigma: f64,
}

/// Summarize every database line across the successful fits.
pub fn summarize_lines(output: &EmissionLineFitOutput) -> Vec<LineSummary> {
    let Some(first) = output.lines.first() else {
        return Vec::new();
    };

    first
        .iter()
        .enumerate()
        .map(|(pos, line)| {
            let fitted: Vec<_> = output
                .fits
                .iter()
                .zip(&output.lines)
                .filter(|(fit, _)| fit.status == SpectrumStatus::Succeeded)
                .map(|(_, lines)| &lines[pos])
                .filter(|l| l.template.is_some())
                .collect();

            let n_flagged = fitted
                .iter()
                .filter(|l| l.mask.flags().any(|f| f != Flag::Undersampled))
                .count();

            LineSummary {
                index: line.index,
                name: line.name.clone(),
                component: line.component,
                n_fit: fitted.len(),
                n_flagged,
                median_flux: median_of(fitted.iter().map(|l| l.flux)),
                median_cz: median_of(fitted.iter().filter_map(|l| l.kinematics.first().copied())),
                median_sigma: median_of(fitted.iter().filter_map(|l| l.kinematics.get(1).copied())),
            }
        })
        .collect()
}

fn median_of(values: impl Iterator<Item = f64>) -> f64 {
    let mut v: Vec<f64> = values.collect();
    median_mut(&mut v).unwrap_or(f64::NAN)
}
