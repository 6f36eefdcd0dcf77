//! Fit results.

use serde::Serialize;

use crate::domain::Mask;
use crate::fit::TiedParameters;

/// What happened to one spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectrumStatus {
    /// No usable pixel; never attempted.
    NotFit,
    /// Too few good pixels for the number of parameters.
    Skipped,
    Failed,
    Succeeded,
}

/// Per-spectrum fit parameters and figures of merit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitParameters {
    pub status: SpectrumStatus,
    /// Why the fit failed, if it did.
    pub failure: Option<String>,
    pub mask: Mask,
    /// Fitting window `[begin_pixel, end_pixel)`.
    pub begin_pixel: usize,
    pub end_pixel: usize,
    pub npix_total: usize,
    pub npix_fit: usize,
    /// Velocity of the window start relative to the templates (km/s).
    pub base_velocity: f64,
    pub used_templates: Vec<bool>,
    pub template_weights: Vec<f64>,
    pub template_weight_errors: Vec<f64>,
    pub additive: Vec<f64>,
    pub multiplicative: Vec<f64>,
    /// Flattened kinematics; velocities are redshift velocities (km/s).
    pub input_kinematics: Vec<f64>,
    pub kinematics: Vec<f64>,
    pub kinematic_errors: Vec<f64>,
    pub chi2: f64,
    pub rchi2: f64,
    pub robust_rchi2: f64,
    pub rms: f64,
    pub frms: f64,
    /// `[min, 68%, 95%, 99%, max]` of the absolute residuals.
    pub abs_residual: [f64; 5],
    pub frac_abs_residual: [f64; 5],
}

impl FitParameters {
    pub(crate) fn empty(status: SpectrumStatus, n_templates: usize, n_params: usize) -> Self {
        Self {
            status,
            failure: None,
            mask: Mask::default(),
            begin_pixel: 0,
            end_pixel: 0,
            npix_total: 0,
            npix_fit: 0,
            base_velocity: 0.0,
            used_templates: vec![false; n_templates],
            template_weights: vec![0.0; n_templates],
            template_weight_errors: vec![0.0; n_templates],
            additive: Vec::new(),
            multiplicative: Vec::new(),
            input_kinematics: vec![0.0; n_params],
            kinematics: vec![0.0; n_params],
            kinematic_errors: vec![0.0; n_params],
            chi2: 0.0,
            rchi2: 0.0,
            robust_rchi2: 0.0,
            rms: 0.0,
            frms: 0.0,
            abs_residual: [0.0; 5],
            frac_abs_residual: [0.0; 5],
        }
    }
}

/// Per-line measurements for one spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineParameters {
    pub index: i64,
    pub name: String,
    /// Row in the combined template set; `None` when the line is not fit.
    pub template: Option<usize>,
    /// Kinematic component ("fit index").
    pub component: Option<usize>,
    pub flux: f64,
    pub flux_error: f64,
    /// `[cz, sigma]` (km/s).
    pub kinematics: Vec<f64>,
    pub kinematic_errors: Vec<f64>,
    /// Quadrature correction for the resolution difference (km/s).
    pub sigma_corr: f64,
    pub mask: Mask,
}

/// Everything produced by one fit invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmissionLineFitOutput {
    pub wave: Vec<f64>,
    pub velscale: f64,
    /// Combined model (continuum + emission lines), one row per spectrum.
    pub model: Vec<Vec<f64>>,
    pub emission_model: Vec<Vec<f64>>,
    pub model_mask: Vec<Vec<Mask>>,
    /// Component, velocity group, and sigma group of every template.
    pub template_component: Vec<usize>,
    pub template_velocity_group: Vec<usize>,
    pub template_sigma_group: Vec<usize>,
    pub tied: TiedParameters,
    pub fits: Vec<FitParameters>,
    /// One row per spectrum, one entry per database line.
    pub lines: Vec<Vec<LineParameters>>,
}

impl EmissionLineFitOutput {
    pub fn n_spectra(&self) -> usize {
        self.fits.len()
    }

    pub fn count(&self, status: SpectrumStatus) -> usize {
        self.fits.iter().filter(|f| f.status == status).count()
    }
}
