//! Object spectra and the optional pre-fit stellar continuum.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::FitSetupError;
use crate::math::velocity_scale;

/// Relative tolerance on the constancy of the log-wavelength step.
const LOG_STEP_TOL: f64 = 1e-3;

/// A set of spectra sharing one geometrically sampled wavelength grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectra {
    /// Observed wavelengths (Å).
    pub wave: Vec<f64>,
    /// One row per spectrum.
    pub flux: Vec<Vec<f64>>,
    pub error: Vec<Vec<f64>>,
    /// `true` marks a pixel that must not be fit.
    #[serde(default)]
    pub mask: Option<Vec<Vec<bool>>>,
    /// Spectral resolution `R = λ/Δλ` per pixel.
    #[serde(default)]
    pub resolution: Option<Vec<Vec<f64>>>,
    /// Initial redshift velocity (km/s) per spectrum.
    pub guess_cz: Vec<f64>,
    /// Initial dispersion (km/s) per spectrum.
    #[serde(default)]
    pub guess_sigma: Option<Vec<f64>>,
}

impl Spectra {
    pub fn n_spectra(&self) -> usize {
        self.flux.len()
    }

    pub fn n_pixels(&self) -> usize {
        self.wave.len()
    }

    /// Check shapes and the wavelength sampling.
    pub fn validate(&self) -> Result<(), FitSetupError> {
        check_log_sampled(&self.wave)?;
        let nspec = self.n_spectra();
        if nspec == 0 {
            return Err(FitSetupError::NoSpectra);
        }
        let npix = self.n_pixels();

        check_rows("flux", &self.flux, nspec, npix)?;
        check_rows("error", &self.error, nspec, npix)?;
        if let Some(mask) = &self.mask {
            check_rows("mask", mask, nspec, npix)?;
        }
        if let Some(res) = &self.resolution {
            check_rows("resolution", res, nspec, npix)?;
            if res.iter().flatten().any(|r| !(r.is_finite() && *r > 0.0)) {
                return Err(FitSetupError::InvalidConfig(
                    "spectral resolution must be positive and finite".to_string(),
                ));
            }
        }
        check_len("guess_cz", self.guess_cz.len(), nspec)?;
        if let Some(sigma) = &self.guess_sigma {
            check_len("guess_sigma", sigma.len(), nspec)?;
        }
        Ok(())
    }

    /// Whether pixel `j` of spectrum `i` can enter a fit.
    pub fn is_usable(&self, i: usize, j: usize) -> bool {
        let masked = self
            .mask
            .as_ref()
            .is_some_and(|m| m[i][j]);
        let e = self.error[i][j];
        !masked && self.flux[i][j].is_finite() && e.is_finite() && e > 0.0
    }
}

/// Stellar templates and kinematics held fixed while the gas is fit.
///
/// The templates become kinematic component 0; the emission-line components
/// follow.
#[derive(Debug, Clone, PartialEq)]
pub struct StellarContinuum {
    /// Template wavelength grid; same velocity step as the spectra.
    pub wave: Vec<f64>,
    /// `n_templates x n_pixels`.
    pub templates: DMatrix<f64>,
    /// Per spectrum: `[cz, sigma, h3, h4, ...]` (km/s for the first two).
    pub kinematics: Vec<Vec<f64>>,
    /// Per spectrum and template: whether the template is used.
    pub usage: Option<Vec<Vec<bool>>>,
}

impl StellarContinuum {
    pub fn n_templates(&self) -> usize {
        self.templates.nrows()
    }

    /// Number of (fixed) kinematic moments.
    pub fn moments(&self) -> usize {
        self.kinematics.first().map_or(0, Vec::len)
    }

    pub fn uses(&self, spectrum: usize, template: usize) -> bool {
        self.usage.as_ref().is_none_or(|u| u[spectrum][template])
    }

    pub fn validate(&self, spectra: &Spectra) -> Result<(), FitSetupError> {
        let bad = |msg: String| Err(FitSetupError::StellarContinuum(msg));

        if check_log_sampled(&self.wave).is_err() {
            return bad("template wavelengths must be geometrically sampled".to_string());
        }
        if self.templates.ncols() != self.wave.len() {
            return bad(format!(
                "templates have {} pixels; wavelength grid has {}",
                self.templates.ncols(),
                self.wave.len()
            ));
        }
        if self.n_templates() == 0 {
            return bad("no templates".to_string());
        }
        let (vs_tpl, vs_obj) = (velocity_scale(&self.wave), velocity_scale(&spectra.wave));
        if ((vs_tpl - vs_obj) / vs_obj).abs() > LOG_STEP_TOL {
            return bad(format!(
                "template velocity scale {vs_tpl:.3} km/s does not match the spectra ({vs_obj:.3} km/s)"
            ));
        }
        let nspec = spectra.n_spectra();
        if self.kinematics.len() != nspec {
            return bad(format!("{} kinematics rows for {nspec} spectra", self.kinematics.len()));
        }
        let moments = self.moments();
        if !(2..=4).contains(&moments) || self.kinematics.iter().any(|k| k.len() != moments) {
            return bad("kinematics need 2 to 4 moments, the same for every spectrum".to_string());
        }
        if let Some(usage) = &self.usage {
            if usage.len() != nspec || usage.iter().any(|u| u.len() != self.n_templates()) {
                return bad("usage flags must be n_spectra x n_templates".to_string());
            }
        }
        Ok(())
    }
}

fn check_len(what: &'static str, got: usize, expected: usize) -> Result<(), FitSetupError> {
    if got == expected {
        Ok(())
    } else {
        Err(FitSetupError::LengthMismatch { what, got, expected })
    }
}

fn check_rows<T>(
    what: &'static str,
    rows: &[Vec<T>],
    nspec: usize,
    npix: usize,
) -> Result<(), FitSetupError> {
    check_len(what, rows.len(), nspec)?;
    for row in rows {
        check_len(what, row.len(), npix)?;
    }
    Ok(())
}

/// Require strictly increasing, positive wavelengths with a constant log step.
pub fn check_log_sampled(wave: &[f64]) -> Result<(), FitSetupError> {
    if wave.len() < 2 || wave.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
        return Err(FitSetupError::InvalidWavelengths);
    }
    let steps: Vec<f64> = wave.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    if steps.iter().any(|s| *s <= 0.0) {
        return Err(FitSetupError::InvalidWavelengths);
    }
    let mean = steps.iter().sum::<f64>() / steps.len() as f64;
    if steps.iter().any(|s| ((s - mean) / mean).abs() > LOG_STEP_TOL) {
        return Err(FitSetupError::InvalidWavelengths);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectra(npix: usize, nspec: usize) -> Spectra {
        Spectra {
            wave: (0..npix).map(|i| 4000.0 * (1e-4 * i as f64).exp()).collect(),
            flux: vec![vec![0.0; npix]; nspec],
            error: vec![vec![1.0; npix]; nspec],
            mask: None,
            resolution: None,
            guess_cz: vec![0.0; nspec],
            guess_sigma: None,
        }
    }

    #[test]
    fn linear_grid_is_rejected() {
        let mut s = spectra(100, 1);
        s.wave = (0..100).map(|i| 4000.0 + 10.0 * i as f64).collect();
        assert_eq!(s.validate().unwrap_err(), FitSetupError::InvalidWavelengths);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut s = spectra(100, 2);
        s.error[1].pop();
        assert!(matches!(
            s.validate(),
            Err(FitSetupError::LengthMismatch { what: "error", got: 99, expected: 100 })
        ));
    }

    #[test]
    fn masked_and_bad_error_pixels_are_unusable() {
        let mut s = spectra(10, 1);
        s.mask = Some(vec![vec![false; 10]]);
        if let Some(m) = s.mask.as_mut() {
            m[0][3] = true;
        }
        s.error[0][5] = 0.0;
        assert!(s.validate().is_ok());
        assert!(!s.is_usable(0, 3));
        assert!(!s.is_usable(0, 5));
        assert!(s.is_usable(0, 4));
    }

    #[test]
    fn stellar_velocity_scale_must_match() {
        let s = spectra(100, 1);
        let wave: Vec<f64> = (0..100).map(|i| 3900.0 * (2e-4 * i as f64).exp()).collect();
        let stellar = StellarContinuum {
            templates: DMatrix::zeros(1, wave.len()),
            wave,
            kinematics: vec![vec![0.0, 100.0]],
            usage: None,
        };
        assert!(matches!(
            stellar.validate(&s),
            Err(FitSetupError::StellarContinuum(_))
        ));
    }
}
