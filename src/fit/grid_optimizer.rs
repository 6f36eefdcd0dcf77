//! Reference optimizer: deterministic grid search over the kinematics.
//!
//! For a fixed set of kinematics the model is linear in the template weights
//! and additive polynomial coefficients, so each evaluation is:
//!
//! - broaden every active template with its component's LOSVD
//! - solve the error-weighted linear least squares problem (SVD)
//! - return the chi-square over the good pixels
//!
//! The free kinematic slots are then searched one coordinate at a time:
//! velocities and Gauss-Hermite moments on a linear grid, dispersions on a
//! log grid. After every sweep each search window is shrunk around the current
//! best value, until the windows are below tolerance or the iteration limit is
//! hit.
//!
//! `bias` is accepted but has no effect: there is no Gauss-Hermite penalty.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::debug;

use crate::error::OptimizerError;
use crate::fit::{OptimizerRequest, OptimizerSolution, Optimizer, ParamTie};
use crate::math::{
    broaden, coefficient_variances, legendre_basis, linear_space, log_space,
    robust_location_scale, solve_least_squares,
};

/// Highest number of kinematic moments per component (v, sigma, h3, h4).
const MAX_MOMENTS: usize = 4;

/// Search settings for [`GridSearchOptimizer`].
#[derive(Debug, Clone)]
pub struct GridSearchOptions {
    /// Grid points per coordinate and sweep.
    pub steps: usize,
    /// Factor applied to every search window after a sweep.
    pub shrink: f64,
    pub max_iterations: usize,
    /// Converged once the velocity window half-width is below this (km/s).
    pub velocity_tol: f64,
    /// Converged once the log10 sigma window half-width is below this.
    pub log_sigma_tol: f64,
    pub hermite_tol: f64,
}

impl Default for GridSearchOptions {
    fn default() -> Self {
        Self {
            steps: 15,
            shrink: 0.35,
            max_iterations: 25,
            velocity_tol: 1e-2,
            log_sigma_tol: 1e-4,
            hermite_tol: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GridSearchOptimizer {
    options: GridSearchOptions,
}

impl GridSearchOptimizer {
    pub fn new(options: GridSearchOptions) -> Self {
        Self { options }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Velocity,
    Sigma,
    Hermite,
}

impl SlotKind {
    fn of(moment: usize) -> Self {
        match moment {
            0 => SlotKind::Velocity,
            1 => SlotKind::Sigma,
            _ => SlotKind::Hermite,
        }
    }
}

/// Free slot under search, with its window in search coordinates.
#[derive(Debug, Clone)]
struct SearchSlot {
    slot: usize,
    kind: SlotKind,
    lo: f64,
    hi: f64,
    half_width: f64,
}

impl SearchSlot {
    fn to_search(&self, value: f64) -> f64 {
        match self.kind {
            SlotKind::Sigma => value.log10(),
            _ => value,
        }
    }

    fn grid(&self, current: f64, steps: usize) -> Result<Vec<f64>, OptimizerError> {
        let center = self.to_search(current);
        let lo = (center - self.half_width).max(self.lo);
        let hi = (center + self.half_width).min(self.hi);
        if hi <= lo {
            return Ok(vec![current]);
        }
        let grid = match self.kind {
            SlotKind::Sigma => log_space(10f64.powf(lo), 10f64.powf(hi), steps)?,
            _ => linear_space(lo, hi, steps)?,
        };
        Ok(grid)
    }

    fn converged(&self, opts: &GridSearchOptions) -> bool {
        let tol = match self.kind {
            SlotKind::Velocity => opts.velocity_tol,
            SlotKind::Sigma => opts.log_sigma_tol,
            SlotKind::Hermite => opts.hermite_tol,
        };
        self.half_width < tol
    }
}

/// Precomputed, read-only view of one request.
struct Problem<'a> {
    req: &'a OptimizerRequest,
    component_start: Vec<usize>,
    /// Pixels entering the chi-square.
    good: Vec<usize>,
    polynomials: Vec<Vec<f64>>,
}

struct LinearFit {
    coefficients: DVector<f64>,
    variances: Vec<f64>,
    /// Unweighted design columns over the whole window.
    columns: Vec<Vec<f64>>,
    chi2: f64,
}

impl<'a> Problem<'a> {
    fn new(req: &'a OptimizerRequest) -> Result<Self, OptimizerError> {
        validate(req)?;
        let mut component_start = Vec::with_capacity(req.moments.len());
        let mut n = 0;
        for m in &req.moments {
            component_start.push(n);
            n += m.unsigned_abs() as usize;
        }
        let good: Vec<usize> = (0..req.n_pixels())
            .filter(|&j| req.good_pixels[j] && req.error[j].is_finite() && req.error[j] > 0.0)
            .filter(|&j| req.flux[j].is_finite())
            .collect();
        if good.is_empty() {
            return Err(OptimizerError::Other("no good pixels to fit".to_string()));
        }
        Ok(Self {
            req,
            component_start,
            good,
            polynomials: legendre_basis(req.n_pixels(), req.degree),
        })
    }

    fn component_kinematics<'p>(&self, params: &'p [f64], component: usize) -> &'p [f64] {
        let start = self.component_start[component];
        &params[start..start + self.req.moments[component].unsigned_abs() as usize]
    }

    fn columns(&self, params: &[f64]) -> Vec<Vec<f64>> {
        let req = self.req;
        let npix = req.n_pixels();
        let mut columns = Vec::with_capacity(req.active_templates.len() + self.polynomials.len());
        for (k, &row) in req.active_templates.iter().enumerate() {
            let kin = self.component_kinematics(params, req.template_component[k]);
            let template: Vec<f64> = req.templates.row(row).iter().copied().collect();
            let offset = (req.velocity_offset - kin[0]) / req.velscale;
            let sigma = kin.get(1).copied().unwrap_or(req.velscale) / req.velscale;
            let hermite = kin.get(2..).unwrap_or(&[]);
            columns.push(broaden(&template, npix, offset, sigma, hermite));
        }
        columns.extend(self.polynomials.iter().cloned());
        columns
    }

    fn solve(&self, params: &[f64], with_variances: bool) -> Option<LinearFit> {
        let req = self.req;
        let columns = self.columns(params);
        let n = self.good.len();
        let mut x = DMatrix::<f64>::zeros(n, columns.len());
        let mut y = DVector::<f64>::zeros(n);
        for (i, &j) in self.good.iter().enumerate() {
            let w = 1.0 / req.error[j];
            for (c, col) in columns.iter().enumerate() {
                x[(i, c)] = col[j] * w;
            }
            y[i] = req.flux[j] * w;
        }

        let coefficients = solve_least_squares(&x, &y)?;
        let resid = &y - &x * &coefficients;
        let chi2 = resid.norm_squared();
        if !chi2.is_finite() {
            return None;
        }
        let variances = if with_variances {
            coefficient_variances(&x)?
        } else {
            Vec::new()
        };
        Some(LinearFit {
            coefficients,
            variances,
            columns,
            chi2,
        })
    }

    fn chi2(&self, params: &[f64]) -> Option<f64> {
        self.solve(params, false).map(|f| f.chi2)
    }
}

fn validate(req: &OptimizerRequest) -> Result<(), OptimizerError> {
    if req.mdegree > 0 {
        return Err(OptimizerError::Unsupported("multiplicative polynomials".to_string()));
    }
    if let Some(m) = req.moments.iter().find(|m| m.unsigned_abs() as usize > MAX_MOMENTS) {
        return Err(OptimizerError::Unsupported(format!("{} kinematic moments", m.abs())));
    }
    if req.moments.iter().any(|m| m.unsigned_abs() == 0) {
        return Err(OptimizerError::Other("components need at least one moment".to_string()));
    }
    let npix = req.n_pixels();
    if req.error.len() != npix || req.good_pixels.len() != npix {
        return Err(OptimizerError::Other("flux, error, and mask lengths differ".to_string()));
    }
    if req.template_component.len() != req.active_templates.len() {
        return Err(OptimizerError::Other("one component per active template is required".to_string()));
    }
    if req.active_templates.iter().any(|r| *r >= req.templates.nrows())
        || req.template_component.iter().any(|c| *c >= req.moments.len())
    {
        return Err(OptimizerError::Other("template or component index out of range".to_string()));
    }
    let n_params: usize = req.moments.iter().map(|m| m.unsigned_abs() as usize).sum();
    if req.ties.len() != n_params || req.bounds.len() != n_params {
        return Err(OptimizerError::Other("ties and bounds must cover every kinematic slot".to_string()));
    }
    if req.start.len() != req.moments.len()
        || req
            .start
            .iter()
            .zip(&req.moments)
            .any(|(s, m)| s.len() < m.unsigned_abs() as usize)
    {
        return Err(OptimizerError::Other("missing starting kinematics".to_string()));
    }
    if !(req.velscale.is_finite() && req.velscale > 0.0) {
        return Err(OptimizerError::Other(format!("invalid velocity scale {}", req.velscale)));
    }
    Ok(())
}

/// Copy the value of every defining slot into the slots tied to it.
fn apply_ties(params: &mut [f64], ties: &[ParamTie]) {
    for s in 0..params.len() {
        if let ParamTie::Tied(to) = ties[s] {
            params[s] = params[to];
        }
    }
}

impl Optimizer for GridSearchOptimizer {
    fn fit(&self, req: &OptimizerRequest) -> Result<OptimizerSolution, OptimizerError> {
        let problem = Problem::new(req)?;
        let opts = &self.options;

        // Flat starting vector, clamped into the bounds for refit components.
        let mut params: Vec<f64> = Vec::with_capacity(req.ties.len());
        for (c, m) in req.moments.iter().enumerate() {
            for k in 0..m.unsigned_abs() as usize {
                let v = req.start[c][k];
                let [lo, hi] = req.bounds[problem.component_start[c] + k];
                params.push(if *m > 0 { v.clamp(lo.min(hi), hi.max(lo)) } else { v });
            }
        }
        apply_ties(&mut params, &req.ties);

        let mut slots: Vec<SearchSlot> = Vec::new();
        for (c, m) in req.moments.iter().enumerate() {
            if *m < 0 {
                continue;
            }
            for k in 0..*m as usize {
                let slot = problem.component_start[c] + k;
                if req.ties[slot] != ParamTie::Free {
                    continue;
                }
                let [lo, hi] = req.bounds[slot];
                let mut s = SearchSlot {
                    slot,
                    kind: SlotKind::of(k),
                    lo: 0.0,
                    hi: 0.0,
                    half_width: 0.0,
                };
                if s.kind == SlotKind::Sigma && lo <= 0.0 {
                    return Err(OptimizerError::Other("dispersion bounds must be positive".to_string()));
                }
                s.lo = s.to_search(lo);
                s.hi = s.to_search(hi);
                s.half_width = s.hi - s.lo;
                slots.push(s);
            }
        }

        let mut best = problem
            .chi2(&params)
            .ok_or_else(|| OptimizerError::Singular("initial linear solve failed".to_string()))?;

        let mut settled = slots.is_empty();
        let mut iterations = 0;
        while !settled && iterations < opts.max_iterations {
            iterations += 1;
            for s in &mut slots {
                let grid = s.grid(params[s.slot], opts.steps)?;
                let candidates: Vec<(usize, f64, f64)> = grid
                    .par_iter()
                    .enumerate()
                    .filter_map(|(idx, value)| {
                        let mut trial = params.clone();
                        trial[s.slot] = *value;
                        apply_ties(&mut trial, &req.ties);
                        problem.chi2(&trial).map(|chi2| (idx, *value, chi2))
                    })
                    .collect();

                // Deterministic selection: minimum chi-square, ties broken by grid index.
                if let Some(&(_, value, chi2)) = candidates
                    .iter()
                    .min_by(|a, b| a.2.total_cmp(&b.2).then(a.0.cmp(&b.0)))
                {
                    if chi2 <= best {
                        best = chi2;
                        params[s.slot] = value;
                        apply_ties(&mut params, &req.ties);
                    }
                }
                s.half_width *= opts.shrink;
            }
            settled = slots.iter().all(|s| s.converged(opts));
        }
        debug!("Grid search finished after {iterations} sweeps (chi2 = {best:.4e}).");

        let fit = problem
            .solve(&params, true)
            .ok_or_else(|| OptimizerError::Singular("final linear solve failed".to_string()))?;

        // Curvature of chi2 along each free slot gives its error (delta chi2 = 1).
        let mut errors = vec![0.0; params.len()];
        for s in &slots {
            let p = params[s.slot];
            let h = match s.kind {
                SlotKind::Velocity => 0.1 * req.velscale,
                SlotKind::Sigma => 0.05 * p,
                SlotKind::Hermite => 1e-2,
            };
            let chi2_at = |v: f64| {
                let mut trial = params.clone();
                trial[s.slot] = v;
                apply_ties(&mut trial, &req.ties);
                problem.chi2(&trial)
            };
            if let (Some(up), Some(down)) = (chi2_at(p + h), chi2_at(p - h)) {
                let d2 = (up - 2.0 * fit.chi2 + down) / (h * h);
                if d2 > 0.0 && d2.is_finite() {
                    errors[s.slot] = (2.0 / d2).sqrt();
                }
            }
        }
        let errors: Vec<f64> = (0..params.len())
            .map(|s| match req.ties[s] {
                ParamTie::Free => errors[s],
                ParamTie::Tied(to) => errors[to],
            })
            .collect();

        Ok(assemble_solution(&problem, &params, &errors, fit, settled))
    }
}

fn assemble_solution(
    problem: &Problem<'_>,
    params: &[f64],
    errors: &[f64],
    fit: LinearFit,
    settled: bool,
) -> OptimizerSolution {
    let req = problem.req;
    let npix = req.n_pixels();
    let n_tpl = req.active_templates.len();
    let n_comp = req.moments.len();

    let coef: Vec<f64> = fit.coefficients.iter().copied().collect();
    let weights = coef[..n_tpl].to_vec();
    let additive = coef[n_tpl..].to_vec();
    let weight_errors = fit.variances[..n_tpl].iter().map(|v| v.max(0.0).sqrt()).collect();

    let mut component_models = vec![vec![0.0; npix]; n_comp];
    for (k, w) in weights.iter().enumerate() {
        let c = req.template_component[k];
        for (m, v) in component_models[c].iter_mut().zip(&fit.columns[k]) {
            *m += w * v;
        }
    }
    let mut model = vec![0.0; npix];
    for (col, a) in fit.columns[n_tpl..].iter().zip(&additive) {
        for (m, v) in model.iter_mut().zip(col) {
            *m += a * v;
        }
    }
    for cm in &component_models {
        for (m, v) in model.iter_mut().zip(cm) {
            *m += v;
        }
    }

    let normalized: Vec<f64> = problem
        .good
        .iter()
        .map(|&j| (req.flux[j] - model[j]) / req.error[j])
        .collect();
    let robust_rchi2 = robust_location_scale(&normalized).map_or(f64::NAN, |(_, s)| s * s);

    let kinematics = (0..n_comp)
        .map(|c| problem.component_kinematics(params, c).to_vec())
        .collect();
    let kinematic_errors = (0..n_comp)
        .map(|c| problem.component_kinematics(errors, c).to_vec())
        .collect();

    OptimizerSolution {
        weights,
        weight_errors,
        additive,
        multiplicative: Vec::new(),
        kinematics,
        kinematic_errors,
        component_models,
        model,
        chi2: fit.chi2,
        robust_rchi2,
        // Every evaluated grid point is a valid model, so the search always
        // yields a solution; an unsettled search is reported as hitting the limit.
        converged: true,
        reached_max_iterations: !settled,
    }
}
