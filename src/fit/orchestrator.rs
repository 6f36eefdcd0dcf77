//! Fit orchestration across many spectra.
//!
//! One invocation:
//!
//! - resolves the line database and builds the emission-line templates
//! - merges an optional fixed stellar continuum as component 0
//! - compiles the tied kinematic parameters
//! - fits every spectrum in parallel, isolating optimizer failures
//! - optionally rejects model outliers and refits the successful spectra once
//! - post-processes every spectrum into [`EmissionLineFitOutput`]
//!
//! Results always come back in input order, whatever order the workers finish in.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::domain::{C_KMS, FitConfig, RunContext};
use crate::error::{FitError, FitSetupError, OptimizerError, SpectrumFailure};
use crate::fit::postprocess::{SpectrumProducts, finalize};
use crate::fit::rejection::{rejection_mask, report_rejections};
use crate::fit::{
    ComponentSpec, EmissionLineFitOutput, Optimizer, OptimizerRequest, OptimizerSolution,
    Spectra, SpectrumStatus, StellarContinuum, TiedParameters, compile_ties, emission_components,
};
use crate::lines::{LineDatabase, TieResolver};
use crate::math::{interpolate, revert_velocity, sigma_from_resolution, velocity_scale};
use crate::templates::{EmissionLineTemplates, InstrumentalDispersion, TemplateBuilder};

/// Shared, read-only description of the model used for every spectrum.
#[derive(Debug)]
pub(crate) struct FitPlan {
    pub templates: Arc<DMatrix<f64>>,
    pub template_wave: Vec<f64>,
    pub template_component: Vec<usize>,
    pub template_velocity_group: Vec<usize>,
    pub template_sigma_group: Vec<usize>,
    /// Stellar templates occupy the first rows.
    pub n_stellar: usize,
    /// Components before the first emission-line component.
    pub n_fixed_components: usize,
    pub emission: EmissionLineTemplates,
    pub tied: TiedParameters,
    pub velscale: f64,
    pub sigma_limits: [f64; 2],
    pub near_bound_fraction: f64,
    pub sigma_valid_range: [f64; 2],
    /// Per-call optimizer timeout.
    pub timeout: Option<Duration>,
}

impl FitPlan {
    pub fn n_templates(&self) -> usize {
        self.templates.nrows()
    }

    pub fn is_gas_component(&self, component: usize) -> bool {
        component >= self.n_fixed_components
    }
}

/// Per-spectrum inputs that do not change between passes.
#[derive(Debug, Clone)]
pub(crate) struct SpectrumSetup {
    /// Fitting window `[start, end)` in spectrum pixels.
    pub start: usize,
    pub end: usize,
    /// Usable pixels of the window before any rejection.
    pub good: Vec<bool>,
    pub base_velocity: f64,
    pub active: Vec<usize>,
    /// Starting kinematics per component (pixel velocities).
    pub start_kinematics: Vec<Vec<f64>>,
    pub bounds: Vec<[f64; 2]>,
}

/// Outcome of one spectrum in one pass.
#[derive(Debug, Clone)]
pub(crate) enum Attempt {
    NotFit,
    Skipped { good_pixels: usize, required: usize },
    Failed(SpectrumFailure),
    Succeeded(OptimizerSolution),
}

impl Attempt {
    fn succeeded(&self) -> bool {
        matches!(self, Attempt::Succeeded(_))
    }
}

/// Drives an [`Optimizer`] over a batch of spectra.
#[derive(Clone)]
pub struct FitOrchestrator {
    config: FitConfig,
    optimizer: Arc<dyn Optimizer>,
    ctx: RunContext,
}

impl FitOrchestrator {
    pub fn new(config: FitConfig, optimizer: Arc<dyn Optimizer>) -> Self {
        Self {
            config,
            optimizer,
            ctx: RunContext::default(),
        }
    }

    pub fn with_context(mut self, ctx: RunContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fit the emission lines of every spectrum.
    ///
    /// Database and input-shape problems abort the whole invocation; problems
    /// with individual spectra are recorded in their results.
    pub fn fit(
        &self,
        db: &LineDatabase,
        spectra: &Spectra,
        stellar: Option<&StellarContinuum>,
    ) -> Result<EmissionLineFitOutput, FitError> {
        let cfg = &self.config;
        let timeout = validate_config(cfg)?;
        spectra.validate()?;
        if let Some(s) = stellar {
            s.validate(spectra)?;
        }

        let plan = self.plan(db, spectra, stellar, timeout)?;
        let nspec = spectra.n_spectra();
        let setups: Vec<Option<SpectrumSetup>> = (0..nspec)
            .map(|i| self.setup_spectrum(i, spectra, stellar, &plan))
            .collect();

        let pool = build_pool(cfg.threads)?;
        let mut goods: Vec<Option<Vec<bool>>> = setups
            .iter()
            .map(|s| s.as_ref().map(|s| s.good.clone()))
            .collect();

        if !self.ctx.quiet {
            info!(
                "Number of object spectra to fit: {}/{}",
                setups.iter().filter(|s| s.is_some()).count(),
                nspec
            );
        }
        let timer = Instant::now();
        let mut attempts = pool.install(|| self.run_pass(&plan, spectra, &setups, &goods));

        if let Some(boxcar) = cfg.reject_boxcar {
            // Barrier: every first-pass fit has finished before any mask changes.
            let refit: Vec<usize> = (0..nspec).filter(|&i| attempts[i].succeeded()).collect();
            if !self.ctx.quiet {
                info!(
                    "Number of object spectra to fit (excluding failed fits): {}/{}",
                    refit.len(),
                    nspec
                );
            }

            let mut before = Vec::with_capacity(refit.len());
            let mut after = Vec::with_capacity(refit.len());
            let mut second: Vec<Option<Vec<bool>>> = vec![None; nspec];
            for &i in &refit {
                let (Some(setup), Some(good), Attempt::Succeeded(sol)) =
                    (&setups[i], &goods[i], &attempts[i])
                else {
                    continue;
                };
                let flux = &spectra.flux[i][setup.start..setup.end];
                let mask = rejection_mask(flux, &sol.model, good, boxcar, cfg.reject_sigma);
                before.push(good.clone());
                after.push(mask.clone());
                second[i] = Some(mask);
            }
            report_rejections(&before, &after, &self.ctx);

            let refits = pool.install(|| self.run_pass(&plan, spectra, &setups, &second));
            for i in refit {
                if let Some(mask) = second[i].take() {
                    attempts[i] = refits[i].clone();
                    goods[i] = Some(mask);
                }
            }
        }

        if !self.ctx.quiet {
            info!("Fits completed in {:.3} s.", timer.elapsed().as_secs_f64());
        }

        let products: Vec<SpectrumProducts> = (0..nspec)
            .map(|i| {
                finalize(
                    &plan,
                    db,
                    spectra,
                    i,
                    setups[i].as_ref(),
                    &attempts[i],
                    goods[i].as_deref(),
                )
            })
            .collect();

        let mut output = EmissionLineFitOutput {
            wave: spectra.wave.clone(),
            velscale: plan.velscale,
            model: Vec::with_capacity(nspec),
            emission_model: Vec::with_capacity(nspec),
            model_mask: Vec::with_capacity(nspec),
            template_component: plan.template_component.clone(),
            template_velocity_group: plan.template_velocity_group.clone(),
            template_sigma_group: plan.template_sigma_group.clone(),
            tied: plan.tied.clone(),
            fits: Vec::with_capacity(nspec),
            lines: Vec::with_capacity(nspec),
        };
        for p in products {
            output.model.push(p.model);
            output.emission_model.push(p.emission_model);
            output.model_mask.push(p.mask);
            output.fits.push(p.fit);
            output.lines.push(p.lines);
        }

        if !self.ctx.quiet {
            info!(
                "Fit summary: {} succeeded, {} failed, {} skipped, {} not fit.",
                output.count(SpectrumStatus::Succeeded),
                output.count(SpectrumStatus::Failed),
                output.count(SpectrumStatus::Skipped),
                output.count(SpectrumStatus::NotFit)
            );
        }
        Ok(output)
    }

    /// Resolve ties, build templates, and compile the parameter ties.
    fn plan(
        &self,
        db: &LineDatabase,
        spectra: &Spectra,
        stellar: Option<&StellarContinuum>,
        timeout: Option<Duration>,
    ) -> Result<FitPlan, FitError> {
        let cfg = &self.config;
        let velscale = velocity_scale(&spectra.wave);
        let template_wave = stellar.map_or_else(|| spectra.wave.clone(), |s| s.wave.clone());
        let coverage = [template_wave[0], template_wave[template_wave.len() - 1]];

        let resolution = TieResolver::new()
            .with_kinematics_tie(cfg.kinematics_tie)
            .with_wavelength_range(coverage)
            .resolve(db, &self.ctx)?;

        let sigma_inst = template_dispersion(spectra, &template_wave, velscale);
        let emission = TemplateBuilder::new(template_wave.clone(), sigma_inst, true)?
            .with_undersample_threshold(cfg.undersample_threshold)
            .build(db, resolution, &self.ctx);
        let res = &emission.resolution;

        let mut components = Vec::new();
        let (n_stellar, n_fixed_components) = match stellar {
            Some(s) => {
                components.push(ComponentSpec::fixed(s.moments() as i32));
                (s.n_templates(), 1)
            }
            None => (0, 0),
        };
        components.extend(emission_components(res, cfg.moments));
        let tied = compile_ties(&components, cfg.degree, cfg.mdegree);

        let shift = n_fixed_components;
        let mut template_component = vec![0; n_stellar];
        let mut template_velocity_group = vec![0; n_stellar];
        let mut template_sigma_group = vec![0; n_stellar];
        template_component.extend(res.template_component.iter().map(|c| c + shift));
        template_velocity_group.extend(res.template_velocity_group.iter().map(|g| g + shift));
        template_sigma_group.extend(res.template_sigma_group.iter().map(|g| g + shift));

        let npix_tpl = template_wave.len();
        let mut templates = DMatrix::<f64>::zeros(n_stellar + emission.n_templates(), npix_tpl);
        if let Some(s) = stellar {
            templates.rows_mut(0, n_stellar).copy_from(&s.templates);
        }
        templates
            .rows_mut(n_stellar, emission.n_templates())
            .copy_from(&emission.flux);

        let sigma_limits = cfg.sigma_limits_for(velscale);
        if !self.ctx.quiet {
            info!("Pixel scale: {velscale:.4} km/s");
            info!("Dispersion limits: {:.4} - {:.4}", sigma_limits[0], sigma_limits[1]);
            info!("Model degrees of freedom: {}", tied.dof + templates.nrows());
            info!("Number of tied parameters: {}", tied.n_params() - tied.n_free);
        }

        Ok(FitPlan {
            templates: Arc::new(templates),
            template_wave,
            template_component,
            template_velocity_group,
            template_sigma_group,
            n_stellar,
            n_fixed_components,
            emission,
            tied,
            velscale,
            sigma_limits,
            near_bound_fraction: cfg.near_bound_fraction,
            sigma_valid_range: cfg.sigma_valid_range,
            timeout,
        })
    }

    /// Fitting window, good pixels, starting guesses, and bounds of one spectrum.
    ///
    /// `None` when the spectrum has no usable pixel.
    fn setup_spectrum(
        &self,
        i: usize,
        spectra: &Spectra,
        stellar: Option<&StellarContinuum>,
        plan: &FitPlan,
    ) -> Option<SpectrumSetup> {
        let cfg = &self.config;
        let in_range = |j: usize| {
            cfg.waverange
                .is_none_or(|[lo, hi]| spectra.wave[j] >= lo && spectra.wave[j] <= hi)
        };
        let usable: Vec<bool> = (0..spectra.n_pixels())
            .map(|j| spectra.is_usable(i, j) && in_range(j))
            .collect();
        let start = usable.iter().position(|u| *u)?;
        let end = usable.iter().rposition(|u| *u)? + 1;

        let base_velocity = C_KMS * (spectra.wave[start] / plan.template_wave[0]).ln();

        let mut active: Vec<usize> = (0..plan.n_stellar)
            .filter(|&k| stellar.is_none_or(|s| s.uses(i, k)))
            .collect();
        active.extend(plan.n_stellar..plan.n_templates());

        let gas_start = vec![
            revert_velocity(spectra.guess_cz[i]),
            spectra
                .guess_sigma
                .as_ref()
                .map_or(cfg.guess_dispersion, |s| s[i]),
        ];
        let mut start_kinematics = Vec::with_capacity(plan.tied.n_components());
        if let Some(s) = stellar {
            let mut k = s.kinematics[i].clone();
            k[0] = revert_velocity(k[0]);
            start_kinematics.push(k);
        }
        while start_kinematics.len() < plan.tied.n_components() {
            start_kinematics.push(gas_start.clone());
        }

        let mut bounds = Vec::with_capacity(plan.tied.n_params());
        for kin in &start_kinematics {
            for m in 0..kin.len() {
                bounds.push(match m {
                    0 => [kin[0] + cfg.velocity_range[0], kin[0] + cfg.velocity_range[1]],
                    1 => plan.sigma_limits,
                    _ => cfg.gh_limits,
                });
            }
        }

        Some(SpectrumSetup {
            start,
            end,
            good: usable[start..end].to_vec(),
            base_velocity,
            active,
            start_kinematics,
            bounds,
        })
    }

    /// Fit every spectrum that has a good-pixel mask; others are `NotFit`.
    fn run_pass(
        &self,
        plan: &FitPlan,
        spectra: &Spectra,
        setups: &[Option<SpectrumSetup>],
        goods: &[Option<Vec<bool>>],
    ) -> Vec<Attempt> {
        setups
            .par_iter()
            .zip(goods.par_iter())
            .enumerate()
            .map(|(i, (setup, good))| match (setup, good) {
                (Some(setup), Some(good)) => self.attempt(plan, spectra, i, setup, good),
                _ => Attempt::NotFit,
            })
            .collect()
    }

    fn attempt(
        &self,
        plan: &FitPlan,
        spectra: &Spectra,
        i: usize,
        setup: &SpectrumSetup,
        good: &[bool],
    ) -> Attempt {
        let cfg = &self.config;
        let good_pixels = good.iter().filter(|g| **g).count();
        let required = plan.tied.dof + setup.active.len();
        if good_pixels < required {
            if !self.ctx.quiet {
                warn!(
                    "Insufficient data points ({good_pixels}) to fit spectrum {} (dof={required}).",
                    i + 1
                );
            }
            return Attempt::Skipped {
                good_pixels,
                required,
            };
        }

        let request = OptimizerRequest {
            templates: Arc::clone(&plan.templates),
            active_templates: setup.active.clone(),
            template_component: setup
                .active
                .iter()
                .map(|k| plan.template_component[*k])
                .collect(),
            flux: spectra.flux[i][setup.start..setup.end].to_vec(),
            error: spectra.error[i][setup.start..setup.end].to_vec(),
            good_pixels: good.to_vec(),
            velscale: plan.velscale,
            velocity_offset: setup.base_velocity,
            moments: plan.tied.moments.clone(),
            start: setup.start_kinematics.clone(),
            ties: plan.tied.ties.clone(),
            bounds: setup.bounds.clone(),
            degree: cfg.degree,
            mdegree: cfg.mdegree,
            bias: cfg.bias,
        };
        let outcome = call_optimizer(&self.optimizer, request.clone(), plan.timeout)
            .and_then(|sol| check_solution(sol, &request));
        match outcome {
            Ok(sol) if !sol.converged => {
                warn!("Fit to spectrum {} did not converge.", i + 1);
                Attempt::Failed(SpectrumFailure::NotConverged)
            }
            Ok(sol) => {
                if sol.reached_max_iterations && !self.ctx.quiet {
                    warn!(
                        "Optimizer reached maximum number of iterations for spectrum {}.",
                        i + 1
                    );
                }
                Attempt::Succeeded(sol)
            }
            Err(failure) => {
                warn!("Fit to spectrum {} failed: {failure}", i + 1);
                Attempt::Failed(failure)
            }
        }
    }
}

/// Invoke the optimizer, converting errors, panics, and timeouts into failures.
///
/// With a timeout the call runs on its own thread; a call that overruns is
/// abandoned (its thread is left to finish in the background).
fn call_optimizer(
    optimizer: &Arc<dyn Optimizer>,
    request: OptimizerRequest,
    timeout: Option<Duration>,
) -> Result<OptimizerSolution, SpectrumFailure> {
    let Some(timeout) = timeout else {
        return panic::catch_unwind(AssertUnwindSafe(|| optimizer.fit(&request)))
            .map_err(|payload| SpectrumFailure::Panicked(panic_message(payload.as_ref())))?
            .map_err(SpectrumFailure::from);
    };

    let (tx, rx) = mpsc::channel();
    let optimizer = Arc::clone(optimizer);
    thread::spawn(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| optimizer.fit(&request)))
            .map_err(|payload| panic_message(payload.as_ref()));
        // The receiver is gone if the call timed out.
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(result)) => result.map_err(SpectrumFailure::from),
        Ok(Err(msg)) => Err(SpectrumFailure::Panicked(msg)),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            Err(SpectrumFailure::Timeout(timeout.as_secs_f64()))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(SpectrumFailure::Panicked(
            "optimizer thread exited without a result".to_string(),
        )),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Reject solutions whose shapes do not match the request.
fn check_solution(
    sol: OptimizerSolution,
    req: &OptimizerRequest,
) -> Result<OptimizerSolution, SpectrumFailure> {
    let ncomp = req.moments.len();
    let ntpl = req.active_templates.len();
    let npix = req.n_pixels();
    let kin_ok = |k: &Vec<Vec<f64>>| {
        k.len() == ncomp
            && k.iter()
                .zip(&req.moments)
                .all(|(v, m)| v.len() == m.unsigned_abs() as usize)
    };
    let ok = sol.weights.len() == ntpl
        && sol.weight_errors.len() == ntpl
        && kin_ok(&sol.kinematics)
        && kin_ok(&sol.kinematic_errors)
        && sol.model.len() == npix
        && sol.component_models.len() == ncomp
        && sol.component_models.iter().all(|m| m.len() == npix);
    if ok {
        Ok(sol)
    } else {
        Err(SpectrumFailure::Optimizer(OptimizerError::Other(
            "solution does not match the request shape".to_string(),
        )))
    }
}

/// Check the configuration; returns the optimizer timeout.
fn validate_config(cfg: &FitConfig) -> Result<Option<Duration>, FitSetupError> {
    if cfg.moments != 2 {
        return Err(FitSetupError::UnsupportedMoments(cfg.moments));
    }
    let invalid = |msg: &str| -> Result<Option<Duration>, FitSetupError> {
        Err(FitSetupError::InvalidConfig(msg.to_string()))
    };
    if !(cfg.reject_sigma.is_finite() && cfg.reject_sigma > 0.0) {
        return invalid("reject_sigma must be positive");
    }
    if cfg.reject_boxcar == Some(0) {
        return invalid("reject_boxcar must be at least 1 pixel");
    }
    if !(cfg.velocity_range[0] < cfg.velocity_range[1]) {
        return invalid("velocity_range must be increasing");
    }
    if let Some([lo, hi]) = cfg.sigma_limits {
        if !(lo > 0.0 && hi > lo) {
            return invalid("sigma_limits must be positive and increasing");
        }
    }
    if !(cfg.gh_limits[0] < cfg.gh_limits[1]) {
        return invalid("gh_limits must be increasing");
    }
    if !(cfg.near_bound_fraction >= 0.0 && cfg.near_bound_fraction < 0.5) {
        return invalid("near_bound_fraction must be in [0, 0.5)");
    }
    if !(cfg.guess_dispersion.is_finite() && cfg.guess_dispersion > 0.0) {
        return invalid("guess_dispersion must be positive");
    }
    if cfg.threads == Some(0) {
        return invalid("threads must be at least 1");
    }
    match cfg.optimizer_timeout_secs {
        None => Ok(None),
        Some(t) if t > 0.0 => Duration::try_from_secs_f64(t)
            .map(Some)
            .map_err(|e| FitSetupError::InvalidConfig(format!("optimizer_timeout_secs {t}: {e}"))),
        Some(_) => invalid("optimizer_timeout_secs must be positive"),
    }
}

fn build_pool(threads: Option<usize>) -> Result<rayon::ThreadPool, FitSetupError> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map_err(|e| FitSetupError::InvalidConfig(format!("cannot start worker pool: {e}")))
}

/// Instrumental dispersion used to build the templates.
///
/// Uses the narrowest line-spread function over all spectra at each channel
/// (maximum resolution), or one pixel when no resolution is given.
fn template_dispersion(spectra: &Spectra, template_wave: &[f64], velscale: f64) -> InstrumentalDispersion {
    let Some(res) = &spectra.resolution else {
        return InstrumentalDispersion::Constant(velscale);
    };
    let max_r: Vec<f64> = (0..spectra.n_pixels())
        .map(|j| res.iter().map(|row| row[j]).fold(f64::MIN, f64::max))
        .collect();
    InstrumentalDispersion::PerPixel(
        template_wave
            .iter()
            .map(|w| sigma_from_resolution(interpolate(&spectra.wave, &max_r, *w)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::domain::{Flag, LineRecord, TieMode};
    use crate::fit::GridSearchOptimizer;
    use crate::math::broaden;

    const NPIX: usize = 600;
    const DLOG: f64 = 1e-4;

    fn wave() -> Vec<f64> {
        (0..NPIX).map(|i| 4900.0 * (DLOG * i as f64).exp()).collect()
    }

    fn db() -> LineDatabase {
        LineDatabase::new(vec![
            LineRecord::new(0, "OIII-5008", 5008.24, TieMode::Primary),
            LineRecord::new(1, "OIII-4960", 4960.30, TieMode::TieAll(0)).with_flux_ratio(0.35),
        ])
        .unwrap()
    }

    fn spectra(nspec: usize) -> Spectra {
        Spectra {
            wave: wave(),
            flux: vec![vec![0.0; NPIX]; nspec],
            error: vec![vec![1.0; NPIX]; nspec],
            mask: None,
            resolution: None,
            guess_cz: vec![0.0; nspec],
            guess_sigma: None,
        }
    }

    fn quiet(config: FitConfig, optimizer: Arc<dyn Optimizer>) -> FitOrchestrator {
        FitOrchestrator::new(config, optimizer).with_context(RunContext::quiet())
    }

    /// Returns the starting kinematics and zero weights; records every call.
    #[derive(Default)]
    struct CountingOptimizer {
        calls: AtomicUsize,
        /// First flux value of every spectrum passed in.
        seen: std::sync::Mutex<Vec<f64>>,
    }

    impl Optimizer for CountingOptimizer {
        fn fit(&self, req: &OptimizerRequest) -> Result<OptimizerSolution, OptimizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(req.flux[0]);
            }
            Ok(echo_solution(req))
        }
    }

    fn echo_solution(req: &OptimizerRequest) -> OptimizerSolution {
        let ncomp = req.moments.len();
        let npix = req.n_pixels();
        OptimizerSolution {
            weights: vec![1.0; req.active_templates.len()],
            weight_errors: vec![0.1; req.active_templates.len()],
            kinematics: req.start.clone(),
            kinematic_errors: req.start.iter().map(|k| vec![1.0; k.len()]).collect(),
            component_models: vec![vec![0.0; npix]; ncomp],
            model: req.flux.clone(),
            chi2: 0.0,
            robust_rchi2: 1.0,
            converged: true,
            ..OptimizerSolution::default()
        }
    }

    /// Fails on spectra whose first flux value is negative; panics on NaN.
    struct PickyOptimizer;

    impl Optimizer for PickyOptimizer {
        fn fit(&self, req: &OptimizerRequest) -> Result<OptimizerSolution, OptimizerError> {
            let first = req.flux[0];
            if first == -1.0 {
                return Err(OptimizerError::Other("bad spectrum".to_string()));
            }
            if first == -2.0 {
                panic!("optimizer blew up");
            }
            if first == -3.0 {
                thread::sleep(Duration::from_millis(800));
            }
            Ok(echo_solution(req))
        }
    }

    #[test]
    fn insufficient_data_skips_without_calling_optimizer() {
        let mut s = spectra(1);
        // Two usable pixels; the fit needs dof (2) + 1 template.
        s.mask = Some(vec![(0..NPIX).map(|j| j >= 2).collect()]);
        let counter = Arc::new(CountingOptimizer::default());
        let out = quiet(FitConfig::default(), counter.clone())
            .fit(&db(), &s, None)
            .unwrap();

        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.fits[0].status, SpectrumStatus::Skipped);
        assert!(out.fits[0].mask.flagged(Flag::InsufficientData));
        assert!(out.lines[0][0].mask.flagged(Flag::InsufficientData));
        assert!(out.model_mask[0].iter().all(|m| m.flagged(Flag::NoFit)));
    }

    #[test]
    fn results_follow_input_order() {
        let mut s = spectra(16);
        for (i, row) in s.flux.iter_mut().enumerate() {
            row[0] = i as f64;
            row[1] = i as f64;
        }
        let config = FitConfig {
            threads: Some(4),
            ..FitConfig::default()
        };
        let counter = Arc::new(CountingOptimizer::default());
        let out = quiet(config, counter.clone()).fit(&db(), &s, None).unwrap();

        assert_eq!(counter.calls.load(Ordering::SeqCst), 16);
        let mut seen = counter.seen.lock().unwrap().clone();
        seen.sort_by(f64::total_cmp);
        assert_eq!(seen, (0..16).map(|i| i as f64).collect::<Vec<_>>());
        for i in 0..16 {
            assert_eq!(out.fits[i].status, SpectrumStatus::Succeeded);
            assert_eq!(out.model[i][1], i as f64);
        }
    }

    #[test]
    fn failures_are_isolated_per_spectrum() {
        let mut s = spectra(5);
        s.flux[1][0] = -1.0;
        s.flux[3][0] = -2.0;
        s.mask = Some(vec![vec![false; NPIX]; 5]);
        if let Some(mask) = s.mask.as_mut() {
            mask[4] = vec![true; NPIX];
        }
        let out = quiet(FitConfig::default(), Arc::new(PickyOptimizer))
            .fit(&db(), &s, None)
            .unwrap();

        let status: Vec<SpectrumStatus> = out.fits.iter().map(|f| f.status).collect();
        assert_eq!(
            status,
            vec![
                SpectrumStatus::Succeeded,
                SpectrumStatus::Failed,
                SpectrumStatus::Succeeded,
                SpectrumStatus::Failed,
                SpectrumStatus::NotFit,
            ]
        );
        assert!(out.fits[1].mask.flagged(Flag::FitFailed));
        assert!(out.fits[3].failure.as_deref().unwrap_or("").contains("blew up"));
        assert!(out.model_mask[3].iter().all(|m| m.flagged(Flag::FitFailed)));
        assert!(out.fits[4].mask.flagged(Flag::NoFit));
    }

    #[test]
    fn slow_calls_time_out() {
        let mut s = spectra(2);
        s.flux[0][0] = -3.0;
        let config = FitConfig {
            optimizer_timeout_secs: Some(0.1),
            ..FitConfig::default()
        };
        let out = quiet(config, Arc::new(PickyOptimizer)).fit(&db(), &s, None).unwrap();
        assert_eq!(out.fits[0].status, SpectrumStatus::Failed);
        assert!(out.fits[0].failure.as_deref().unwrap_or("").contains("timeout"));
        assert_eq!(out.fits[1].status, SpectrumStatus::Succeeded);
    }

    #[test]
    fn rejection_runs_exactly_one_extra_pass() {
        let mut s = spectra(3);
        s.flux[1][0] = -1.0;
        let config = FitConfig {
            reject_boxcar: Some(51),
            ..FitConfig::default()
        };
        let counter = Arc::new(CountingOptimizer::default());
        let out = quiet(config, counter.clone()).fit(&db(), &s, None).unwrap();
        // All three succeed with the echo optimizer, so each pass fits three.
        assert_eq!(counter.calls.load(Ordering::SeqCst), 6);
        assert_eq!(out.count(SpectrumStatus::Succeeded), 3);
    }

    #[test]
    fn failed_first_pass_spectra_are_not_refit() {
        let mut s = spectra(3);
        s.flux[2][0] = -1.0;
        let config = FitConfig {
            reject_boxcar: Some(51),
            ..FitConfig::default()
        };
        let out = quiet(config, Arc::new(PickyOptimizer)).fit(&db(), &s, None).unwrap();
        assert_eq!(out.fits[2].status, SpectrumStatus::Failed);
        assert_eq!(out.count(SpectrumStatus::Succeeded), 2);
    }

    #[test]
    fn unsupported_moments_are_rejected() {
        let config = FitConfig {
            moments: 4,
            ..FitConfig::default()
        };
        let err = quiet(config, Arc::new(PickyOptimizer))
            .fit(&db(), &spectra(1), None)
            .unwrap_err();
        assert_eq!(err, FitError::Setup(FitSetupError::UnsupportedMoments(4)));
    }

    #[test]
    fn database_errors_abort_before_fitting() {
        let bad = LineDatabase::new(vec![
            LineRecord::new(0, "A", 5008.24, TieMode::Primary),
            LineRecord::new(1, "B", 4960.30, TieMode::TieFluxOnly(0)),
        ])
        .unwrap();
        let counter = Arc::new(CountingOptimizer::default());
        let err = quiet(FitConfig::default(), counter.clone())
            .fit(&bad, &spectra(2), None)
            .unwrap_err();
        assert!(matches!(err, FitError::Validation(_)));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    /// Keeps the last request it was given.
    #[derive(Default)]
    struct RecordingOptimizer {
        last: std::sync::Mutex<Option<OptimizerRequest>>,
    }

    impl Optimizer for RecordingOptimizer {
        fn fit(&self, req: &OptimizerRequest) -> Result<OptimizerSolution, OptimizerError> {
            if let Ok(mut last) = self.last.lock() {
                *last = Some(req.clone());
            }
            Ok(echo_solution(req))
        }
    }

    #[test]
    fn stellar_continuum_is_a_fixed_leading_component() {
        let stellar = StellarContinuum {
            wave: wave(),
            templates: DMatrix::from_element(2, NPIX, 1.0),
            kinematics: vec![vec![50.0, 120.0]],
            usage: Some(vec![vec![true, false]]),
        };
        let recorder = Arc::new(RecordingOptimizer::default());
        let out = quiet(FitConfig::default(), recorder.clone())
            .fit(&db(), &spectra(1), Some(&stellar))
            .unwrap();

        let req = recorder.last.lock().unwrap().clone().unwrap();
        assert_eq!(req.moments, vec![-2, 2]);
        // Stellar template 1 is unused; the emission template follows the stellar rows.
        assert_eq!(req.active_templates, vec![0, 2]);
        assert_eq!(req.template_component, vec![0, 1]);
        assert!((req.start[0][0] - revert_velocity(50.0)).abs() < 1e-9);
        assert_eq!(req.start[0][1], 120.0);

        assert_eq!(out.fits[0].status, SpectrumStatus::Succeeded);
        assert_eq!(out.template_component, vec![0, 0, 1]);
        let oiii = &out.lines[0][0];
        assert_eq!(oiii.template, Some(2));
        assert_eq!(oiii.component, Some(1));
    }

    /// Echoes the starting kinematics with the adjustments below applied.
    #[derive(Default)]
    struct ScriptedOptimizer {
        /// Added to every component velocity.
        dv: f64,
        /// Return a flat zero model instead of the data.
        zero_model: bool,
        /// Weight reported for every template.
        weight: Option<f64>,
        max_iter: bool,
        /// Good-pixel count of every call.
        good_counts: std::sync::Mutex<Vec<usize>>,
    }

    impl Optimizer for ScriptedOptimizer {
        fn fit(&self, req: &OptimizerRequest) -> Result<OptimizerSolution, OptimizerError> {
            if let Ok(mut counts) = self.good_counts.lock() {
                counts.push(req.n_good());
            }
            let mut sol = echo_solution(req);
            for kin in sol.kinematics.iter_mut() {
                kin[0] += self.dv;
            }
            if self.zero_model {
                sol.model = vec![0.0; req.n_pixels()];
            }
            if let Some(w) = self.weight {
                sol.weights = vec![w; req.active_templates.len()];
            }
            sol.reached_max_iterations = self.max_iter;
            Ok(sol)
        }
    }

    #[test]
    fn oversized_timeout_is_a_config_error() {
        let config = FitConfig {
            optimizer_timeout_secs: Some(1e30),
            ..FitConfig::default()
        };
        let counter = Arc::new(CountingOptimizer::default());
        let err = quiet(config, counter.clone())
            .fit(&db(), &spectra(2), None)
            .unwrap_err();
        assert!(matches!(err, FitError::Setup(FitSetupError::InvalidConfig(_))));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = FitConfig {
                optimizer_timeout_secs: Some(bad),
                ..FitConfig::default()
            };
            assert!(quiet(config, Arc::new(PickyOptimizer)).fit(&db(), &spectra(1), None).is_err());
        }
    }

    #[test]
    fn velocity_bounds_follow_the_guess() {
        let run = |dv: f64| {
            let mut s = spectra(1);
            s.guess_cz = vec![1000.0];
            let optimizer = Arc::new(ScriptedOptimizer {
                dv,
                ..ScriptedOptimizer::default()
            });
            quiet(FitConfig::default(), optimizer).fit(&db(), &s, None).unwrap()
        };

        // 10 km/s inside the upper bound of guess + 2000 km/s.
        let near = run(1990.0);
        assert_eq!(near.fits[0].status, SpectrumStatus::Succeeded);
        assert!(near.fits[0].mask.flagged(Flag::NearBound));
        assert!(near.lines[0][0].mask.flagged(Flag::NearBound));
        assert!(near.lines[0][1].mask.flagged(Flag::NearBound));
        assert!(near.model_mask[0].iter().all(|m| m.flagged(Flag::NearBound)));

        let inside = run(-1000.0);
        assert!(!inside.fits[0].mask.flagged(Flag::NearBound));
        assert!(!inside.lines[0][0].mask.flagged(Flag::NearBound));
    }

    #[test]
    fn rising_resolution_clamps_the_sigma_correction() {
        let mut s = spectra(1);
        // Redshifted lines land where the resolution is higher than at rest.
        s.resolution = Some(vec![(0..NPIX).map(|j| 1500.0 + 10.0 * j as f64).collect()]);
        s.guess_cz = vec![3000.0];
        let out = quiet(FitConfig::default(), Arc::new(CountingOptimizer::default()))
            .fit(&db(), &s, None)
            .unwrap();

        assert_eq!(out.fits[0].status, SpectrumStatus::Succeeded);
        for line in &out.lines[0] {
            assert!(line.mask.flagged(Flag::NegativeSigmaCorr), "{}", line.name);
            assert_eq!(line.sigma_corr, 0.0);
        }
    }

    #[test]
    fn refit_sees_the_rejected_pixels() {
        let mut s = spectra(1);
        s.flux[0] = (0..NPIX).map(|j| (0.7 * j as f64).sin()).collect();
        s.flux[0][300] = 100.0;
        let config = FitConfig {
            reject_boxcar: Some(51),
            ..FitConfig::default()
        };
        let optimizer = Arc::new(ScriptedOptimizer {
            zero_model: true,
            ..ScriptedOptimizer::default()
        });
        let out = quiet(config, optimizer.clone()).fit(&db(), &s, None).unwrap();

        assert_eq!(*optimizer.good_counts.lock().unwrap(), vec![NPIX, NPIX - 1]);
        assert_eq!(out.fits[0].status, SpectrumStatus::Succeeded);
        assert_eq!(out.fits[0].npix_fit, NPIX - 1);
        assert!(out.model_mask[0][300].flagged(Flag::Rejected));
        assert_eq!(
            out.model_mask[0].iter().filter(|m| m.flagged(Flag::Rejected)).count(),
            1
        );
    }

    #[test]
    fn iteration_limit_flags_the_fitted_lines() {
        let s = spectra(1);
        let optimizer = Arc::new(ScriptedOptimizer {
            max_iter: true,
            ..ScriptedOptimizer::default()
        });
        let out = quiet(FitConfig::default(), optimizer).fit(&db(), &s, None).unwrap();

        assert_eq!(out.fits[0].status, SpectrumStatus::Succeeded);
        assert!(out.fits[0].mask.flagged(Flag::MaxIter));
        assert!(out.lines[0].iter().all(|l| l.mask.flagged(Flag::MaxIter)));
    }

    #[test]
    fn reduced_chi2_counts_only_positive_weights() {
        let rchi2 = |weight: f64| {
            let mut s = spectra(1);
            s.flux[0] = vec![1.0; NPIX];
            let optimizer = Arc::new(ScriptedOptimizer {
                zero_model: true,
                weight: Some(weight),
                ..ScriptedOptimizer::default()
            });
            let out = quiet(FitConfig::default(), optimizer).fit(&db(), &s, None).unwrap();
            assert_eq!(out.fits[0].chi2, NPIX as f64);
            out.fits[0].rchi2
        };
        // Two free kinematic parameters, plus one for a positive template weight.
        assert_eq!(rchi2(2.0), NPIX as f64 / (NPIX - 3) as f64);
        assert_eq!(rchi2(-2.0), NPIX as f64 / (NPIX - 2) as f64);
    }

    #[test]
    fn grid_search_recovers_injected_line() {
        let wave = wave();
        let velscale = velocity_scale(&wave);
        let cz = 150.0;
        let sigma = 80.0;

        // Build the data from the same templates the orchestrator will build.
        let d = db();
        let res = TieResolver::new().resolve(&d, &RunContext::quiet()).unwrap();
        let tpl = TemplateBuilder::new(wave.clone(), InstrumentalDispersion::Constant(velscale), true)
            .unwrap()
            .build(&d, res, &RunContext::quiet());
        let row: Vec<f64> = tpl.flux.row(0).iter().copied().collect();
        let v = revert_velocity(cz);
        let line = broaden(&row, NPIX, -v / velscale, sigma / velscale, &[]);

        let mut s = spectra(1);
        s.flux[0] = line.iter().map(|f| 500.0 * f).collect();
        s.error[0] = vec![0.05; NPIX];
        s.guess_cz = vec![100.0];

        let out = quiet(FitConfig::default(), Arc::new(GridSearchOptimizer::default()))
            .fit(&d, &s, None)
            .unwrap();
        let fit = &out.fits[0];
        assert_eq!(fit.status, SpectrumStatus::Succeeded);
        assert!((fit.kinematics[0] - cz).abs() < 1.0, "cz = {}", fit.kinematics[0]);
        assert!((fit.kinematics[1] - sigma).abs() < 1.0, "sigma = {}", fit.kinematics[1]);

        let oiii = &out.lines[0][0];
        assert!((oiii.flux - 500.0).abs() < 1.0);
        let weak = &out.lines[0][1];
        assert!((weak.flux - 175.0).abs() < 0.5);
        assert_eq!(oiii.component, Some(0));
        assert_eq!(weak.kinematics, oiii.kinematics);
        assert_eq!(oiii.sigma_corr, 0.0);
    }
}
