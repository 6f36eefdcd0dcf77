//! Turn per-spectrum optimizer outcomes into reported results.
//!
//! For a successful fit this:
//!
//! - places the window model back on the full spectrum grid
//! - computes residual statistics over the final good pixels
//! - flags parameters sitting near their bounds
//! - converts pixel velocities to redshift velocities
//! - derives per-line fluxes, kinematics, and the resolution correction

use tracing::warn;

use crate::domain::{C_KMS, Flag, Mask};
use crate::fit::orchestrator::{Attempt, FitPlan, SpectrumSetup};
use crate::fit::{FitParameters, LineParameters, OptimizerSolution, Spectra, SpectrumStatus};
use crate::lines::LineDatabase;
use crate::math::{convert_velocity, growth_stats, interpolate, rms, sigma_from_resolution};

/// Everything reported for one spectrum.
#[derive(Debug, Clone)]
pub(crate) struct SpectrumProducts {
    pub fit: FitParameters,
    pub lines: Vec<LineParameters>,
    pub model: Vec<f64>,
    pub emission_model: Vec<f64>,
    pub mask: Vec<Mask>,
}

/// Which side of its allowed range a parameter is crowding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundSide {
    Lower,
    Upper,
}

pub(crate) fn finalize(
    plan: &FitPlan,
    db: &LineDatabase,
    spectra: &Spectra,
    i: usize,
    setup: Option<&SpectrumSetup>,
    attempt: &Attempt,
    good: Option<&[bool]>,
) -> SpectrumProducts {
    let npix = spectra.n_pixels();
    let status = match attempt {
        Attempt::NotFit => SpectrumStatus::NotFit,
        Attempt::Skipped { .. } => SpectrumStatus::Skipped,
        Attempt::Failed(_) => SpectrumStatus::Failed,
        Attempt::Succeeded(_) => SpectrumStatus::Succeeded,
    };
    let mut fit = FitParameters::empty(status, plan.n_templates(), plan.tied.n_params());
    let mut lines = line_records(plan, db);
    let mut model = vec![0.0; npix];
    let mut emission_model = vec![0.0; npix];

    let window = setup.map_or(0..0, |s| s.start..s.end);
    let mut mask: Vec<Mask> = (0..npix)
        .map(|j| {
            if window.contains(&j) && spectra.is_usable(i, j) {
                Mask::default()
            } else {
                Mask::default().with(Flag::DidNotUse)
            }
        })
        .collect();

    if let Some(setup) = setup {
        fit.begin_pixel = setup.start;
        fit.end_pixel = setup.end;
        fit.npix_total = setup.end - setup.start;
        fit.base_velocity = setup.base_velocity;
        for k in &setup.active {
            fit.used_templates[*k] = true;
        }
        fit.input_kinematics = flatten_kinematics(&setup.start_kinematics);
    }

    match (attempt, setup) {
        (Attempt::Succeeded(sol), Some(setup)) => {
            let good = good.unwrap_or(&setup.good);
            let ctx = SolutionContext {
                plan,
                db,
                spectra,
                i,
                setup,
                sol,
                good,
            };
            ctx.apply(
                &mut fit,
                &mut lines,
                &mut model,
                &mut emission_model,
                &mut mask,
            );
        }
        (Attempt::Skipped { good_pixels, required }, _) => {
            fit.mask.turn_on(Flag::InsufficientData);
            fit.failure = Some(format!(
                "Insufficient data: {good_pixels} good pixels for {required} model parameters."
            ));
            mask.iter_mut().for_each(|m| m.turn_on(Flag::NoFit));
            for line in lines.iter_mut().filter(|l| l.template.is_some()) {
                line.mask.turn_on(Flag::InsufficientData);
            }
        }
        (Attempt::Failed(failure), _) => {
            fit.mask.turn_on(Flag::FitFailed);
            fit.failure = Some(failure.to_string());
            mask.iter_mut().for_each(|m| m.turn_on(Flag::FitFailed));
            for line in lines.iter_mut().filter(|l| l.template.is_some()) {
                line.mask.turn_on(Flag::FitFailed);
            }
        }
        _ => {
            fit.status = SpectrumStatus::NotFit;
            fit.mask.turn_on(Flag::NoFit);
            mask.iter_mut().for_each(|m| m.turn_on(Flag::NoFit));
            for line in lines.iter_mut() {
                line.mask.turn_on(Flag::NoFit);
            }
        }
    }

    SpectrumProducts {
        fit,
        lines,
        model,
        emission_model,
        mask,
    }
}

/// Line records before any fit: identification, grouping, and static flags.
fn line_records(plan: &FitPlan, db: &LineDatabase) -> Vec<LineParameters> {
    let res = &plan.emission.resolution;
    db.iter()
        .enumerate()
        .map(|(pos, line)| {
            let template = res.line_template[pos].map(|t| plan.n_stellar + t);
            let mut mask = Mask::default();
            if template.is_none() {
                mask.turn_on(Flag::NoFit);
            }
            if plan.emission.line_undersampled[pos] {
                mask.turn_on(Flag::Undersampled);
            }
            LineParameters {
                index: line.index,
                name: line.name.clone(),
                template,
                component: template.map(|t| plan.template_component[t]),
                flux: 0.0,
                flux_error: 0.0,
                kinematics: vec![0.0; 2],
                kinematic_errors: vec![0.0; 2],
                sigma_corr: 0.0,
                mask,
            }
        })
        .collect()
}

/// Flatten per-component kinematics, reporting velocities as `cz`.
fn flatten_kinematics(kinematics: &[Vec<f64>]) -> Vec<f64> {
    kinematics
        .iter()
        .flat_map(|k| {
            k.iter()
                .enumerate()
                .map(|(m, v)| if m == 0 { convert_velocity(*v, 0.0).0 } else { *v })
        })
        .collect()
}

/// Inputs needed to post-process one successful fit.
struct SolutionContext<'a> {
    plan: &'a FitPlan,
    db: &'a LineDatabase,
    spectra: &'a Spectra,
    i: usize,
    setup: &'a SpectrumSetup,
    sol: &'a OptimizerSolution,
    good: &'a [bool],
}

impl SolutionContext<'_> {
    fn apply(
        &self,
        fit: &mut FitParameters,
        lines: &mut [LineParameters],
        model: &mut [f64],
        emission_model: &mut [f64],
        mask: &mut [Mask],
    ) {
        let (plan, setup, sol) = (self.plan, self.setup, self.sol);
        let start = setup.start;

        for (j, m) in sol.model.iter().enumerate() {
            model[start + j] = *m;
        }
        for (c, component) in sol.component_models.iter().enumerate() {
            if !plan.is_gas_component(c) {
                continue;
            }
            for (j, m) in component.iter().enumerate() {
                emission_model[start + j] += m;
            }
        }

        for (k, t) in setup.active.iter().enumerate() {
            fit.template_weights[*t] = sol.weights[k];
            fit.template_weight_errors[*t] = sol.weight_errors[k];
        }
        fit.additive = sol.additive.clone();
        fit.multiplicative = sol.multiplicative.clone();
        fit.robust_rchi2 = sol.robust_rchi2;

        if sol.reached_max_iterations {
            fit.mask.turn_on(Flag::MaxIter);
            for line in lines.iter_mut().filter(|l| l.template.is_some()) {
                line.mask.turn_on(Flag::MaxIter);
            }
        }
        for (j, (before, after)) in setup.good.iter().zip(self.good).enumerate() {
            if *before && !*after {
                mask[start + j].turn_on(Flag::Rejected);
            }
        }

        self.statistics(fit);

        let bound_flags = self.bound_flags();
        if bound_flags.iter().flatten().any(|f| *f == Flag::NearBound) {
            fit.mask.turn_on(Flag::NearBound);
            mask.iter_mut().for_each(|m| m.turn_on(Flag::NearBound));
        }
        if bound_flags.iter().flatten().any(|f| *f == Flag::MinSigma) {
            fit.mask.turn_on(Flag::MinSigma);
        }

        let mut slot = 0;
        for (kin, err) in sol.kinematics.iter().zip(&sol.kinematic_errors) {
            for (m, (v, e)) in kin.iter().zip(err).enumerate() {
                let (v, e) = if m == 0 { convert_velocity(*v, *e) } else { (*v, *e) };
                fit.kinematics[slot] = v;
                fit.kinematic_errors[slot] = e;
                slot += 1;
            }
        }

        self.lines(fit, lines, &bound_flags);
    }

    /// Residual statistics over the final good pixels.
    fn statistics(&self, fit: &mut FitParameters) {
        let start = self.setup.start;
        let flux = &self.spectra.flux[self.i];
        let error = &self.spectra.error[self.i];

        let mut chi2 = 0.0;
        let mut resid = Vec::new();
        let mut frac = Vec::new();
        for (j, g) in self.good.iter().enumerate() {
            if !*g {
                continue;
            }
            let r = flux[start + j] - self.sol.model[j];
            chi2 += (r / error[start + j]).powi(2);
            resid.push(r);
            if self.sol.model[j] != 0.0 {
                frac.push(r / self.sol.model[j]);
            }
        }

        let positive = self.sol.weights.iter().filter(|w| **w > 0.0).count();
        let dof = resid.len() as f64 - self.plan.tied.dof as f64 - positive as f64;
        fit.npix_fit = resid.len();
        fit.chi2 = chi2;
        fit.rchi2 = if dof > 0.0 { chi2 / dof } else { 0.0 };
        fit.rms = rms(&resid).unwrap_or(0.0);
        fit.frms = rms(&frac).unwrap_or(0.0);
        fit.abs_residual = growth_stats(&resid).unwrap_or([0.0; 5]);
        fit.frac_abs_residual = growth_stats(&frac).unwrap_or([0.0; 5]);
    }

    /// Bound flag of every flat slot that is free in a refit component.
    fn bound_flags(&self) -> Vec<Option<Flag>> {
        let tied = &self.plan.tied;
        let mut flags = vec![None; tied.n_params()];
        for slot in tied.free_slots() {
            let c = tied.component_of_slot(slot);
            let m = slot - tied.component_start[c];
            let value = self.sol.kinematics[c][m];
            let is_sigma = tied.is_sigma_slot(slot);
            let Some(side) = near_bound(
                value,
                self.setup.bounds[slot],
                self.plan.near_bound_fraction,
                is_sigma,
            ) else {
                continue;
            };
            let flag = if is_sigma && side == BoundSide::Lower {
                Flag::MinSigma
            } else {
                Flag::NearBound
            };
            warn!(
                "Spectrum {}: component {c} moment {m} = {value:.3} is near its {} bound ({}).",
                self.i + 1,
                if side == BoundSide::Lower { "lower" } else { "upper" },
                flag.name()
            );
            flags[slot] = Some(flag);
        }
        flags
    }

    fn lines(&self, fit: &FitParameters, lines: &mut [LineParameters], bound_flags: &[Option<Flag>]) {
        let tied = &self.plan.tied;
        let emission = &self.plan.emission;
        let [lo, hi] = self.plan.sigma_valid_range;

        for (pos, line) in lines.iter_mut().enumerate() {
            let (Some(t), Some(c)) = (line.template, line.component) else {
                continue;
            };
            let Some(record) = self.db.get(pos) else {
                continue;
            };
            let ratio = record.flux_ratio;
            line.flux = fit.template_weights[t] * ratio;
            line.flux_error = fit.template_weight_errors[t] * ratio.abs();

            let slots = tied.component_slots(c);
            line.kinematics = slots.iter().map(|s| fit.kinematics[*s]).collect();
            line.kinematic_errors = slots.iter().map(|s| fit.kinematic_errors[*s]).collect();
            for s in &slots {
                if let Some(flag) = bound_flags[*s] {
                    line.mask.turn_on(flag);
                }
            }

            let (Some(cz), Some(sigma)) = (line.kinematics.first(), line.kinematics.get(1)) else {
                continue;
            };
            let Some(sigma_tpl) = emission.line_sigma(pos) else {
                continue;
            };
            let sigma_obs = observed_dispersion(
                self.spectra,
                self.i,
                record.rest_wavelength * (1.0 + cz / C_KMS),
                self.plan.velscale,
            );
            match sigma_correction(sigma_obs, sigma_tpl) {
                Some(corr) => line.sigma_corr = corr,
                None => {
                    warn!(
                        "Spectrum {}: line {} ({}) has an imaginary dispersion correction; set to 0.",
                        self.i + 1,
                        line.index,
                        line.name
                    );
                    line.mask.turn_on(Flag::NegativeSigmaCorr);
                    line.sigma_corr = 0.0;
                }
            }

            let intrinsic = sigma * sigma - line.sigma_corr * line.sigma_corr;
            if intrinsic < lo * lo || intrinsic > hi * hi {
                line.mask.turn_on(Flag::BadSigma);
            }
        }
    }
}

/// Which bound, if any, `value` is within `fraction` of the allowed range.
///
/// Dispersions are compared in log10 space.
fn near_bound(value: f64, bounds: [f64; 2], fraction: f64, log: bool) -> Option<BoundSide> {
    let [mut lo, mut hi] = bounds;
    let mut v = value;
    if log {
        if !(lo > 0.0 && v > 0.0) {
            return Some(BoundSide::Lower);
        }
        (lo, hi, v) = (lo.log10(), hi.log10(), v.log10());
    }
    let tol = fraction * (hi - lo);
    if v - lo < tol {
        Some(BoundSide::Lower)
    } else if hi - v < tol {
        Some(BoundSide::Upper)
    } else {
        None
    }
}

/// Quadrature difference between observed and template dispersions.
///
/// `None` when the template is broader than the observation.
fn sigma_correction(sigma_obs: f64, sigma_tpl: f64) -> Option<f64> {
    let radicand = sigma_obs * sigma_obs - sigma_tpl * sigma_tpl;
    (radicand >= 0.0).then(|| radicand.sqrt())
}

/// Dispersion (km/s) of spectrum `i` at wavelength `lambda`.
///
/// One pixel when the spectra carry no resolution.
fn observed_dispersion(spectra: &Spectra, i: usize, lambda: f64, velscale: f64) -> f64 {
    match &spectra.resolution {
        Some(res) => sigma_from_resolution(interpolate(&spectra.wave, &res[i], lambda)),
        None => velscale,
    }
}
