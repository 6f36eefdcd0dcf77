//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - loads the line database, spectra, and fit configuration
//! - runs tie resolution or the full fit
//! - prints reports and writes optional exports

use clap::Parser;

use crate::cli::{Command, DemoArgs, FitArgs, FitOverrides, ResolveArgs};
use crate::domain::{FitConfig, RunContext};
use crate::error::AppError;
use crate::lines::{LineDatabase, TieResolution, TieResolver};

pub mod pipeline;

/// Environment variable supplying the default worker count.
pub const THREADS_ENV: &str = "ELFIT_THREADS";

/// Entry point for the `elfit` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();
    let ctx = RunContext { quiet: cli.quiet };

    match cli.command {
        Command::Resolve(args) => handle_resolve(args, ctx),
        Command::Fit(args) => handle_fit(args, ctx),
        Command::Demo(args) => handle_demo(args, ctx),
    }
}

fn handle_resolve(args: ResolveArgs, ctx: RunContext) -> Result<(), AppError> {
    let (db, res) = resolve_lines(&args, ctx)?;
    println!("{}", crate::report::format_resolution(&db, &res));
    Ok(())
}

/// Resolve the line database with the same settings `fit` would use.
pub fn resolve_lines(args: &ResolveArgs, ctx: RunContext) -> Result<(LineDatabase, TieResolution), AppError> {
    let config = match &args.config {
        Some(path) => crate::io::read_fit_config(path)?,
        None => FitConfig::default(),
    };
    let db = crate::io::read_line_database(&args.lines)?;

    let mut resolver = TieResolver::new().with_kinematics_tie(config.kinematics_tie);
    if let Some(path) = &args.spectra {
        let spectra = crate::io::read_spectra(path)?;
        if let (Some(first), Some(last)) = (spectra.wave.first(), spectra.wave.last()) {
            resolver = resolver.with_wavelength_range([*first, *last]);
        }
    }
    let res = resolver.resolve(&db, &ctx)?;
    Ok((db, res))
}

fn handle_fit(args: FitArgs, ctx: RunContext) -> Result<(), AppError> {
    let config = fit_config_from_args(&args.overrides)?;
    let db = crate::io::read_line_database(&args.lines)?;
    let spectra = crate::io::read_spectra(&args.spectra)?;

    let run = pipeline::run_fit(&db, &spectra, &config, ctx)?;
    println!(
        "{}",
        crate::report::format_fit_summary(&run.output, &run.summaries, &config)
    );
    write_exports(&args.overrides, &run, &config)
}

fn handle_demo(args: DemoArgs, ctx: RunContext) -> Result<(), AppError> {
    let config = fit_config_from_args(&args.overrides)?;
    let db = match &args.lines {
        Some(path) => crate::io::read_line_database(path)?,
        None => crate::data::builtin_line_database()?,
    };
    let sample_config = crate::data::SampleConfig {
        n_spectra: args.n_spectra,
        seed: args.seed,
        noise: args.noise,
        ..crate::data::SampleConfig::default()
    };
    let sample = crate::data::generate_sample(&db, &sample_config)?;

    let run = pipeline::run_fit(&db, &sample.spectra, &config, ctx)?;
    println!(
        "{}",
        crate::report::format_fit_summary(&run.output, &run.summaries, &config)
    );
    println!("{}", crate::report::format_truth_comparison(&sample.truth, &run.output));
    write_exports(&args.overrides, &run, &config)
}

fn write_exports(overrides: &FitOverrides, run: &pipeline::RunOutput, config: &FitConfig) -> Result<(), AppError> {
    if let Some(path) = &overrides.export {
        crate::io::write_fit_json(path, &run.output, config)?;
    }
    if let Some(path) = &overrides.export_lines {
        crate::io::write_lines_csv(path, &run.output)?;
    }
    Ok(())
}

/// Fit configuration: config file (or defaults), then environment, then flags.
pub fn fit_config_from_args(args: &FitOverrides) -> Result<FitConfig, AppError> {
    dotenvy::dotenv().ok();

    let mut config = match &args.config {
        Some(path) => crate::io::read_fit_config(path)?,
        None => FitConfig::default(),
    };

    if let Ok(value) = std::env::var(THREADS_ENV) {
        let threads = value
            .trim()
            .parse::<usize>()
            .map_err(|_| AppError::new(2, format!("{THREADS_ENV} must be a positive integer (got '{value}').")))?;
        config.threads = Some(threads);
    }

    if let Some(boxcar) = args.reject_boxcar {
        config.reject_boxcar = Some(boxcar);
    }
    if let Some(degree) = args.degree {
        config.degree = degree;
    }
    if let Some(threads) = args.threads {
        config.threads = Some(threads);
    }
    if let Some(timeout) = args.timeout {
        config.optimizer_timeout_secs = Some(timeout);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("elfit-app-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn resolve_honours_the_config_kinematics_tie() {
        let lines = temp_file(
            "lines.json",
            r#"[
                {"index": 0, "name": "Ha", "restwave": 6564.61, "action": "f", "mode": "f"},
                {"index": 1, "name": "NII-6585", "restwave": 6585.27, "action": "f", "mode": "k0"}
            ]"#,
        );
        let config = temp_file("config.json", r#"{"kinematics_tie": "tied_component"}"#);

        let mut args = ResolveArgs {
            lines: lines.clone(),
            config: None,
            spectra: None,
        };
        let (_, shared) = resolve_lines(&args, RunContext::quiet()).unwrap();
        args.config = Some(config.clone());
        let (_, tied) = resolve_lines(&args, RunContext::quiet()).unwrap();
        std::fs::remove_file(&lines).ok();
        std::fs::remove_file(&config).ok();

        assert_eq!(shared.template_component, vec![0, 0]);
        assert_eq!(tied.template_component, vec![0, 1]);
        assert_eq!(tied.template_velocity_group, vec![0, 0]);
    }

    #[test]
    fn flags_override_defaults() {
        let overrides = FitOverrides {
            reject_boxcar: Some(51),
            degree: Some(3),
            timeout: Some(1.5),
            ..FitOverrides::default()
        };
        let config = fit_config_from_args(&overrides).unwrap();
        assert_eq!(config.reject_boxcar, Some(51));
        assert_eq!(config.degree, 3);
        assert_eq!(config.optimizer_timeout_secs, Some(1.5));
        assert_eq!(config.moments, 2);
    }
}
