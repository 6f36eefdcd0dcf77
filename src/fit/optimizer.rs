//! Optimizer boundary.
//!
//! The orchestrator hands each spectrum to an [`Optimizer`] as a self-contained
//! [`OptimizerRequest`]. Requests own their data (the template matrix is shared
//! through an `Arc`) so a call can run on its own thread under a timeout.

use std::sync::Arc;

use nalgebra::DMatrix;

use crate::error::OptimizerError;
use crate::fit::ParamTie;

/// Everything needed to fit one spectrum.
#[derive(Debug, Clone)]
pub struct OptimizerRequest {
    /// All templates, one per row, on the template wavelength grid.
    pub templates: Arc<DMatrix<f64>>,
    /// Rows of `templates` used for this spectrum.
    pub active_templates: Vec<usize>,
    /// Kinematic component of each active template.
    pub template_component: Vec<usize>,
    /// Flux inside the fitting window.
    pub flux: Vec<f64>,
    pub error: Vec<f64>,
    /// Pixels of the window included in the fit.
    pub good_pixels: Vec<bool>,
    /// km/s per pixel.
    pub velscale: f64,
    /// Velocity of the first window pixel relative to the first template pixel (km/s).
    pub velocity_offset: f64,
    /// Signed moments per component; negative components are held fixed.
    pub moments: Vec<i32>,
    /// Initial kinematics per component.
    pub start: Vec<Vec<f64>>,
    pub ties: Vec<ParamTie>,
    /// Bounds per flat kinematic slot.
    pub bounds: Vec<[f64; 2]>,
    pub degree: i32,
    pub mdegree: i32,
    pub bias: Option<f64>,
}

impl OptimizerRequest {
    pub fn n_pixels(&self) -> usize {
        self.flux.len()
    }

    pub fn n_good(&self) -> usize {
        self.good_pixels.iter().filter(|g| **g).count()
    }
}

/// Result of one optimizer call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerSolution {
    /// Weight of each active template.
    pub weights: Vec<f64>,
    pub weight_errors: Vec<f64>,
    pub additive: Vec<f64>,
    pub multiplicative: Vec<f64>,
    /// Fitted kinematics per component (pixel velocities).
    pub kinematics: Vec<Vec<f64>>,
    pub kinematic_errors: Vec<Vec<f64>>,
    /// Model contributed by each component over the window.
    pub component_models: Vec<Vec<f64>>,
    /// Full model over the window.
    pub model: Vec<f64>,
    pub chi2: f64,
    pub robust_rchi2: f64,
    pub converged: bool,
    pub reached_max_iterations: bool,
}

pub trait Optimizer: Send + Sync {
    fn fit(&self, request: &OptimizerRequest) -> Result<OptimizerSolution, OptimizerError>;
}
