//! Error types.
//!
//! Library layers report typed errors (`thiserror`); the binary collapses them
//! into [`AppError`], which carries the process exit code:
//!
//! - `2`: configuration / input problems
//! - `3`: emission-line database validation
//! - `4`: fitting / runtime failures

use thiserror::Error;

use crate::domain::TieMode;

/// Fatal problems with the emission-line database.
///
/// Any of these aborts the whole batch before a single spectrum is fit: there
/// is no way to parameterize the optimizer without a consistent tie graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Line database is empty.")]
    Empty,

    #[error("Duplicate line index {index} ({name}).")]
    DuplicateIndex { index: i64, name: String },

    #[error("Line {index} ({name}) has an invalid rest wavelength: {restwave}.")]
    InvalidWavelength { index: i64, name: String, restwave: f64 },

    #[error("Line {index} ({name}) has a non-finite flux ratio: {flux}.")]
    InvalidFluxRatio { index: i64, name: String, flux: f64 },

    #[error("Cannot parse tie mode '{0}'.")]
    MalformedMode(String),

    #[error("Unknown line profile '{0}'.")]
    UnknownProfile(String),

    #[error("Line {index} ({name}) uses mode {mode}: tying only the flux is not supported.")]
    UnsupportedMode { index: i64, name: String, mode: TieMode },

    #[error("Line {index} ({name}) with mode {mode} targets unknown line index {target}.")]
    UnknownTarget {
        index: i64,
        name: String,
        mode: TieMode,
        target: i64,
    },

    #[error("Line {index} ({name}) with mode {mode} is tied through ignored line {target}.")]
    TargetIgnored {
        index: i64,
        name: String,
        mode: TieMode,
        target: i64,
    },

    #[error("Line {index} ({name}) with mode {mode} is part of a tie cycle: {path:?}.")]
    Cycle {
        index: i64,
        name: String,
        mode: TieMode,
        path: Vec<i64>,
    },

    #[error("Line {index} ({name}) with mode {mode} does not reach a primary line within {max_hops} hops.")]
    ChainTooLong {
        index: i64,
        name: String,
        mode: TieMode,
        max_hops: usize,
    },

    #[error("No primary lines to fit; every fitted line must trace back to mode 'f' or 'w'.")]
    NoPrimaryLines,

    #[error("Tie resolution left template {template} without a {what}.")]
    Internal { template: usize, what: &'static str },
}

/// Fatal problems with the inputs to a fit invocation (shapes, grids).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitSetupError {
    #[error("Wavelength grid must have at least 2 strictly increasing, positive values.")]
    InvalidWavelengths,

    #[error("{what} has length {got}; expected {expected}.")]
    LengthMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("Instrumental dispersion must be positive and finite (got {0}).")]
    InvalidDispersion(f64),

    #[error("Only two kinematic moments are supported for emission lines (got {0}).")]
    UnsupportedMoments(i32),

    #[error("No spectra to fit.")]
    NoSpectra,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Stellar continuum: {0}")]
    StellarContinuum(String),
}

/// Errors raised by an [`crate::fit::Optimizer`] implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("Optimizer does not support {0}.")]
    Unsupported(String),

    #[error("Linear solve failed: {0}")]
    Singular(String),

    #[error("Optimizer failed: {0}")]
    Other(String),
}

/// Why a single spectrum ended up without a usable fit.
///
/// These never escape the orchestrator; they are recorded in that spectrum's
/// status and masks while the rest of the batch continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectrumFailure {
    #[error("Insufficient data: {good_pixels} good pixels for {required} model parameters.")]
    InsufficientData { good_pixels: usize, required: usize },

    #[error("Optimizer did not converge.")]
    NotConverged,

    #[error("{0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Optimizer panicked: {0}")]
    Panicked(String),

    #[error("Optimizer exceeded the {0:.1}s timeout.")]
    Timeout(f64),
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::new(3, format!("Invalid emission-line database: {err}"))
    }
}

impl From<FitSetupError> for AppError {
    fn from(err: FitSetupError) -> Self {
        AppError::new(2, err.to_string())
    }
}

/// Fatal error of a whole fit invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Setup(#[from] FitSetupError),
}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        match err {
            FitError::Validation(e) => e.into(),
            FitError::Setup(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_exit_code_3() {
        let err: AppError = ValidationError::NoPrimaryLines.into();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("No primary lines"));
    }

    #[test]
    fn validation_message_names_line_and_mode() {
        let err = ValidationError::UnsupportedMode {
            index: 7,
            name: "OIII-5008".to_string(),
            mode: TieMode::TieFluxOnly(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("Line 7"));
        assert!(msg.contains("OIII-5008"));
        assert!(msg.contains("x3"));
    }
}
