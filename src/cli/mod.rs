//! Command-line parsing for the emission-line fitter.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! resolution and fitting code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "elfit", version, about = "Emission-line tie resolution and spectral fitting")]
pub struct Cli {
    /// Only print warnings and results (no informational summaries).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a line database and print the resolved tie grouping.
    Resolve(ResolveArgs),
    /// Fit the emission lines of a set of spectra.
    Fit(FitArgs),
    /// Generate synthetic spectra and fit them.
    Demo(DemoArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct ResolveArgs {
    /// Line database JSON.
    #[arg(long, value_name = "JSON")]
    pub lines: PathBuf,

    /// Fit configuration JSON; its `kinematics_tie` applies.
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Spectra JSON; lines outside their wavelength coverage are excluded.
    #[arg(long, value_name = "JSON")]
    pub spectra: Option<PathBuf>,
}

/// Fit settings shared by `fit` and `demo`; unset flags keep the config file value.
#[derive(Debug, Parser, Clone, Default)]
pub struct FitOverrides {
    /// Fit configuration JSON (missing fields take their defaults).
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Boxcar width (pixels) of the outlier-rejection pass; enables rejection.
    #[arg(long)]
    pub reject_boxcar: Option<usize>,

    /// Additive Legendre polynomial degree (-1 disables).
    #[arg(long, allow_negative_numbers = true)]
    pub degree: Option<i32>,

    /// Worker threads (default: ELFIT_THREADS, then the number of cores).
    #[arg(long)]
    pub threads: Option<usize>,

    /// Per-spectrum optimizer timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Export the complete fit output to JSON.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,

    /// Export per-line measurements to CSV.
    #[arg(long = "export-lines", value_name = "CSV")]
    pub export_lines: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// Line database JSON.
    #[arg(long, value_name = "JSON")]
    pub lines: PathBuf,

    /// Spectra JSON.
    #[arg(long, value_name = "JSON")]
    pub spectra: PathBuf,

    #[command(flatten)]
    pub overrides: FitOverrides,
}

#[derive(Debug, Parser, Clone)]
pub struct DemoArgs {
    /// Line database JSON (default: a built-in set of strong optical lines).
    #[arg(long, value_name = "JSON")]
    pub lines: Option<PathBuf>,

    /// Number of synthetic spectra.
    #[arg(short = 'n', long, default_value_t = 8)]
    pub n_spectra: usize,

    /// Random seed for the synthetic spectra.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Per-pixel noise level.
    #[arg(long, default_value_t = 0.05)]
    pub noise: f64,

    #[command(flatten)]
    pub overrides: FitOverrides,
}
