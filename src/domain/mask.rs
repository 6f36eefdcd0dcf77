//! Quality flags attached to pixels, spectra, and lines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single quality flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Pixel was masked on input and not used.
    DidNotUse,
    /// No fit was performed.
    NoFit,
    /// Too few good pixels for the number of parameters.
    InsufficientData,
    /// The optimizer failed, errored, or timed out.
    FitFailed,
    /// The optimizer hit its iteration limit.
    MaxIter,
    /// A kinematic parameter sits near its bound.
    NearBound,
    /// The dispersion sits near its lower bound.
    MinSigma,
    /// Corrected dispersion outside the valid range.
    BadSigma,
    /// The instrumental dispersion correction was imaginary and clamped to zero.
    NegativeSigmaCorr,
    /// The line profile is undersampled by the pixel grid.
    Undersampled,
    /// Pixel rejected as a model outlier.
    Rejected,
}

impl Flag {
    pub const ALL: [Flag; 11] = [
        Flag::DidNotUse,
        Flag::NoFit,
        Flag::InsufficientData,
        Flag::FitFailed,
        Flag::MaxIter,
        Flag::NearBound,
        Flag::MinSigma,
        Flag::BadSigma,
        Flag::NegativeSigmaCorr,
        Flag::Undersampled,
        Flag::Rejected,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Flag::DidNotUse => "DIDNOTUSE",
            Flag::NoFit => "NO_FIT",
            Flag::InsufficientData => "INSUFFICIENT_DATA",
            Flag::FitFailed => "FIT_FAILED",
            Flag::MaxIter => "MAXITER",
            Flag::NearBound => "NEAR_BOUND",
            Flag::MinSigma => "MIN_SIGMA",
            Flag::BadSigma => "BAD_SIGMA",
            Flag::NegativeSigmaCorr => "NEGATIVE_SIGMA_CORR",
            Flag::Undersampled => "UNDERSAMPLED",
            Flag::Rejected => "REJECTED",
        }
    }
}

/// Bitmask of [`Flag`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mask(u32);

impl Mask {
    pub fn turn_on(&mut self, flag: Flag) {
        self.0 |= flag.bit();
    }

    pub fn with(mut self, flag: Flag) -> Self {
        self.turn_on(flag);
        self
    }

    pub fn flagged(self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn is_clear(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn flags(self) -> impl Iterator<Item = Flag> {
        Flag::ALL.into_iter().filter(move |f| self.flagged(*f))
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.flags().map(Flag::name).collect();
        if names.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}
