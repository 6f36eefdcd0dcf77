//! Line profile shapes.
//!
//! Profiles are evaluated in velocity space (km/s) relative to the line centre.
//! Each [`ProfileKind`] maps to a static [`LineProfile`] implementation; there
//! is no construction by name.

use std::f64::consts::PI;

use crate::domain::{ProfileKind, SIG2FWHM};

/// Shape parameters of an evaluated profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileParams {
    pub amplitude: f64,
    pub center: f64,
    pub width: f64,
}

pub trait LineProfile: Sync {
    /// Convert integrated flux, mean velocity, and dispersion into shape parameters.
    fn parameters_from_moments(&self, flux: f64, mean: f64, sigma: f64) -> ProfileParams;

    /// Evaluate the profile at velocity `v`.
    fn evaluate(&self, v: f64, p: &ProfileParams) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct Gaussian;

impl LineProfile for Gaussian {
    fn parameters_from_moments(&self, flux: f64, mean: f64, sigma: f64) -> ProfileParams {
        ProfileParams {
            amplitude: flux / ((2.0 * PI).sqrt() * sigma),
            center: mean,
            width: sigma,
        }
    }

    fn evaluate(&self, v: f64, p: &ProfileParams) -> f64 {
        let z = (v - p.center) / p.width;
        p.amplitude * (-0.5 * z * z).exp()
    }
}

/// Lorentzian with the same FWHM as a Gaussian of the given dispersion.
#[derive(Debug, Clone, Copy)]
pub struct Lorentzian;

impl LineProfile for Lorentzian {
    fn parameters_from_moments(&self, flux: f64, mean: f64, sigma: f64) -> ProfileParams {
        let gamma = 0.5 * SIG2FWHM * sigma;
        ProfileParams {
            amplitude: flux / (PI * gamma),
            center: mean,
            width: gamma,
        }
    }

    fn evaluate(&self, v: f64, p: &ProfileParams) -> f64 {
        let g2 = p.width * p.width;
        let dv = v - p.center;
        p.amplitude * g2 / (dv * dv + g2)
    }
}

static GAUSSIAN: Gaussian = Gaussian;
static LORENTZIAN: Lorentzian = Lorentzian;

impl ProfileKind {
    pub fn profile(self) -> &'static dyn LineProfile {
        match self {
            ProfileKind::Gaussian => &GAUSSIAN,
            ProfileKind::Lorentzian => &LORENTZIAN,
        }
    }
}
