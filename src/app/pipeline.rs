//! Shared fit pipeline used by the `fit` and `demo` commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! orchestrated fit -> per-line summaries.
//!
//! The commands can then focus on where their inputs come from.

use std::sync::Arc;

use tracing::warn;

use crate::domain::{FitConfig, RunContext};
use crate::error::AppError;
use crate::fit::{EmissionLineFitOutput, FitOrchestrator, GridSearchOptimizer, Spectra, SpectrumStatus};
use crate::lines::LineDatabase;
use crate::report::{LineSummary, summarize_lines};

/// All computed outputs of a single fit run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub output: EmissionLineFitOutput,
    pub summaries: Vec<LineSummary>,
}

/// Fit every spectrum with the grid-search optimizer and summarize the lines.
pub fn run_fit(
    db: &LineDatabase,
    spectra: &Spectra,
    config: &FitConfig,
    ctx: RunContext,
) -> Result<RunOutput, AppError> {
    let orchestrator = FitOrchestrator::new(config.clone(), Arc::new(GridSearchOptimizer::default()))
        .with_context(ctx);
    let output = orchestrator.fit(db, spectra, None)?;

    if output.count(SpectrumStatus::Succeeded) == 0 {
        warn!("No spectrum was fit successfully.");
    }

    let summaries = summarize_lines(&output);
    Ok(RunOutput { output, summaries })
}
