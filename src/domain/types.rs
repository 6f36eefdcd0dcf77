//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - read from JSON line databases / configuration files
//! - used in-memory during resolution and fitting
//! - exported alongside the fit results

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Speed of light in km/s.
pub const C_KMS: f64 = 299_792.458;

/// Conversion from Gaussian sigma to FWHM: `2 * sqrt(2 ln 2)`.
pub const SIG2FWHM: f64 = 2.354_820_045_030_949_3;

/// How a line's flux and kinematics relate to another line.
///
/// The target is the *database index* of the line tied to (not its position).
/// Textual form is `"<code><target>"`, e.g. `"a12"`; `f` and `w` carry no target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TieMode {
    /// Independent line with its own template and kinematics (`f`).
    Primary,
    /// Same template as the target: flux ratio, velocity and dispersion tied (`a`).
    TieAll(i64),
    /// Separate template (free flux) with the target's kinematics (`k`).
    TieKinematics(i64),
    /// Separate template, velocity tied to the target, free dispersion (`v`).
    TieVelocity(i64),
    /// Separate template, dispersion tied to the target, free velocity (`s`).
    TieSigma(i64),
    /// Flux tied only (`x`); rejected by the tie resolver.
    TieFluxOnly(i64),
    /// Weakly independent line (`w`); treated like [`TieMode::Primary`].
    WeakIndependent,
}

impl TieMode {
    /// The tie target, if any.
    pub fn target(self) -> Option<i64> {
        match self {
            TieMode::Primary | TieMode::WeakIndependent => None,
            TieMode::TieAll(t)
            | TieMode::TieKinematics(t)
            | TieMode::TieVelocity(t)
            | TieMode::TieSigma(t)
            | TieMode::TieFluxOnly(t) => Some(t),
        }
    }

    /// True for modes that root their own template and component.
    pub fn is_independent(self) -> bool {
        matches!(self, TieMode::Primary | TieMode::WeakIndependent)
    }

    pub fn code(self) -> char {
        match self {
            TieMode::Primary => 'f',
            TieMode::TieAll(_) => 'a',
            TieMode::TieKinematics(_) => 'k',
            TieMode::TieVelocity(_) => 'v',
            TieMode::TieSigma(_) => 's',
            TieMode::TieFluxOnly(_) => 'x',
            TieMode::WeakIndependent => 'w',
        }
    }
}

impl fmt::Display for TieMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(t) => write!(f, "{}{}", self.code(), t),
            None => write!(f, "{}", self.code()),
        }
    }
}

impl FromStr for TieMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let Some(code) = chars.next() else {
            return Err(ValidationError::MalformedMode(s.to_string()));
        };
        let rest = chars.as_str();

        let target = || -> Result<i64, ValidationError> {
            rest.parse::<i64>()
                .map_err(|_| ValidationError::MalformedMode(s.to_string()))
        };

        match code {
            'f' | 'w' if !rest.is_empty() => Err(ValidationError::MalformedMode(s.to_string())),
            'f' => Ok(TieMode::Primary),
            'w' => Ok(TieMode::WeakIndependent),
            'a' => Ok(TieMode::TieAll(target()?)),
            'k' => Ok(TieMode::TieKinematics(target()?)),
            'v' => Ok(TieMode::TieVelocity(target()?)),
            's' => Ok(TieMode::TieSigma(target()?)),
            'x' => Ok(TieMode::TieFluxOnly(target()?)),
            _ => Err(ValidationError::MalformedMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for TieMode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TieMode> for String {
    fn from(value: TieMode) -> Self {
        value.to_string()
    }
}

/// Whether a line takes part in the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineAction {
    #[serde(rename = "f", alias = "fit")]
    Fit,
    #[serde(rename = "i", alias = "ignore")]
    Ignore,
}

/// Closed set of line profile shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    #[default]
    #[serde(alias = "GaussianLineProfile")]
    Gaussian,
    #[serde(alias = "LorentzianLineProfile")]
    Lorentzian,
}

impl FromStr for ProfileKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gaussian" | "gaussianlineprofile" => Ok(ProfileKind::Gaussian),
            "lorentzian" | "lorentzianlineprofile" => Ok(ProfileKind::Lorentzian),
            _ => Err(ValidationError::UnknownProfile(s.to_string())),
        }
    }
}

/// A single emission line as declared in the line database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    /// Unique identifier used as the target of tie modes.
    pub index: i64,
    pub name: String,
    /// Vacuum rest wavelength (Å).
    #[serde(rename = "restwave")]
    pub rest_wavelength: f64,
    pub action: LineAction,
    pub mode: TieMode,
    /// Relative flux of this line within its template.
    #[serde(rename = "flux", default = "default_flux_ratio")]
    pub flux_ratio: f64,
    #[serde(default)]
    pub profile: ProfileKind,
}

fn default_flux_ratio() -> f64 {
    1.0
}

impl LineRecord {
    pub fn new(index: i64, name: impl Into<String>, rest_wavelength: f64, mode: TieMode) -> Self {
        Self {
            index,
            name: name.into(),
            rest_wavelength,
            action: LineAction::Fit,
            mode,
            flux_ratio: 1.0,
            profile: ProfileKind::Gaussian,
        }
    }

    pub fn with_flux_ratio(mut self, flux_ratio: f64) -> Self {
        self.flux_ratio = flux_ratio;
        self
    }

    pub fn with_action(mut self, action: LineAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_profile(mut self, profile: ProfileKind) -> Self {
        self.profile = profile;
        self
    }

    pub fn is_fit(&self) -> bool {
        self.action == LineAction::Fit
    }
}

/// How a `k` (tie kinematics) line is mapped onto kinematic components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KinematicsTie {
    /// The line's template joins the target's component.
    #[default]
    SharedComponent,
    /// The line's template gets a new component whose velocity and sigma
    /// groups are the target's.
    TiedComponent,
}

/// Explicit logging context threaded through resolution and fitting.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunContext {
    /// Suppress informational summaries (warnings are always emitted).
    pub quiet: bool,
}

impl RunContext {
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

/// Fit configuration as understood by the orchestrator.
///
/// Deserializable from JSON; any missing field takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Additive Legendre polynomial degree (`< 0` disables).
    pub degree: i32,
    /// Multiplicative Legendre polynomial degree (`<= 0` disables).
    pub mdegree: i32,
    /// Kinematic moments fitted per emission-line component.
    pub moments: i32,
    /// Penalty bias passed through to the optimizer.
    pub bias: Option<f64>,
    /// Boxcar width (pixels) for the outlier-rejection pass; `None` disables it.
    pub reject_boxcar: Option<usize>,
    /// Rejection threshold in units of the local robust sigma.
    pub reject_sigma: f64,
    /// Allowed velocity offset (km/s) relative to the initial guess.
    pub velocity_range: [f64; 2],
    /// Dispersion limits (km/s); defaults to `[0.01 * velscale, 1000]`.
    pub sigma_limits: Option<[f64; 2]>,
    /// Limits for higher-order Gauss-Hermite moments.
    pub gh_limits: [f64; 2],
    /// A parameter closer than this fraction of its range to a bound is flagged.
    pub near_bound_fraction: f64,
    /// Valid range (km/s) of the resolution-corrected dispersion.
    pub sigma_valid_range: [f64; 2],
    /// Lines with `sigma_inst / dv` below this are flagged as undersampled.
    pub undersample_threshold: f64,
    /// Restrict the fitted wavelength range.
    pub waverange: Option<[f64; 2]>,
    /// Dispersion guess (km/s) when none is supplied per spectrum.
    pub guess_dispersion: f64,
    pub kinematics_tie: KinematicsTie,
    /// Per-spectrum optimizer timeout (seconds).
    pub optimizer_timeout_secs: Option<f64>,
    /// Worker threads for the per-spectrum pool (rayon default when `None`).
    pub threads: Option<usize>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            degree: -1,
            mdegree: 0,
            moments: 2,
            bias: None,
            reject_boxcar: None,
            reject_sigma: 3.0,
            velocity_range: [-2000.0, 2000.0],
            sigma_limits: None,
            gh_limits: [-0.3, 0.3],
            near_bound_fraction: 1e-2,
            sigma_valid_range: [0.0, 400.0],
            undersample_threshold: 0.9,
            waverange: None,
            guess_dispersion: 100.0,
            kinematics_tie: KinematicsTie::SharedComponent,
            optimizer_timeout_secs: None,
            threads: None,
        }
    }
}

impl FitConfig {
    /// Dispersion limits for a given pixel scale.
    pub fn sigma_limits_for(&self, velscale: f64) -> [f64; 2] {
        self.sigma_limits.unwrap_or([0.01 * velscale, 1000.0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_mode_parses_all_codes() {
        assert_eq!("f".parse::<TieMode>().unwrap(), TieMode::Primary);
        assert_eq!("w".parse::<TieMode>().unwrap(), TieMode::WeakIndependent);
        assert_eq!("a12".parse::<TieMode>().unwrap(), TieMode::TieAll(12));
        assert_eq!("k3".parse::<TieMode>().unwrap(), TieMode::TieKinematics(3));
        assert_eq!("v0".parse::<TieMode>().unwrap(), TieMode::TieVelocity(0));
        assert_eq!("s44".parse::<TieMode>().unwrap(), TieMode::TieSigma(44));
        assert_eq!("x1".parse::<TieMode>().unwrap(), TieMode::TieFluxOnly(1));
    }

    #[test]
    fn tie_mode_rejects_malformed() {
        for bad in ["", "a", "q3", "f2", "kx", "v-"] {
            assert!(bad.parse::<TieMode>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn tie_mode_display_matches_code() {
        assert_eq!(TieMode::TieSigma(9).to_string(), "s9");
        assert_eq!(TieMode::Primary.to_string(), "f");
    }

    #[test]
    fn line_record_deserializes_from_json() {
        let json = r#"{"index": 2, "name": "Ha", "restwave": 6564.6, "action": "f", "mode": "k1"}"#;
        let line: LineRecord = serde_json::from_str(json).unwrap();
        assert_eq!(line.mode, TieMode::TieKinematics(1));
        assert_eq!(line.flux_ratio, 1.0);
        assert_eq!(line.profile, ProfileKind::Gaussian);
        assert!(line.is_fit());
    }

    #[test]
    fn fit_config_fills_defaults() {
        let cfg: FitConfig = serde_json::from_str(r#"{"degree": 4, "reject_boxcar": 101}"#).unwrap();
        assert_eq!(cfg.degree, 4);
        assert_eq!(cfg.reject_boxcar, Some(101));
        assert_eq!(cfg.moments, 2);
        assert_eq!(cfg.sigma_limits_for(70.0), [0.7, 1000.0]);
    }
}
