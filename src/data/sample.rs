//! Synthetic emission-line spectra for demos and end-to-end tests.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::{LineAction, LineRecord, RunContext, TieMode};
use crate::error::AppError;
use crate::fit::Spectra;
use crate::lines::{LineDatabase, TieResolver};
use crate::math::{broaden, revert_velocity, sigma_from_resolution, velocity_scale};
use crate::templates::{InstrumentalDispersion, TemplateBuilder};

/// Settings for [`generate_sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleConfig {
    pub n_spectra: usize,
    pub seed: u64,
    /// Wavelength of the first pixel (Å).
    pub wave_start: f64,
    /// Natural-log wavelength step per pixel.
    pub log_step: f64,
    pub n_pixels: usize,
    /// Constant spectral resolution `R`.
    pub resolution: f64,
    /// Redshift velocity range (km/s) the truth is drawn from.
    pub cz_range: [f64; 2],
    /// Intrinsic dispersion range (km/s).
    pub sigma_range: [f64; 2],
    /// Template flux range.
    pub flux_range: [f64; 2],
    /// Gaussian noise per pixel.
    pub noise: f64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            n_spectra: 8,
            seed: 42,
            wave_start: 4800.0,
            log_step: 1e-4,
            n_pixels: 3500,
            resolution: 2000.0,
            cz_range: [-300.0, 300.0],
            sigma_range: [60.0, 200.0],
            flux_range: [50.0, 500.0],
            noise: 0.05,
        }
    }
}

/// Generated spectra plus the kinematics used to make them.
#[derive(Debug, Clone)]
pub struct SampleData {
    pub spectra: Spectra,
    /// `[cz, sigma]` of every spectrum.
    pub truth: Vec<[f64; 2]>,
    /// Flux of every template in every spectrum.
    pub template_flux: Vec<Vec<f64>>,
}

/// Strong optical lines, tied the usual way.
///
/// Doublets with fixed ratios share a template; Hβ follows the Hα velocity
/// with its own dispersion; the forbidden red lines follow Hα.
pub fn builtin_line_database() -> Result<LineDatabase, AppError> {
    let lines = vec![
        LineRecord::new(0, "Hb", 4862.69, TieMode::TieVelocity(3)),
        LineRecord::new(1, "OIII-4960", 4960.30, TieMode::TieAll(2)).with_flux_ratio(0.35),
        LineRecord::new(2, "OIII-5008", 5008.24, TieMode::Primary),
        LineRecord::new(3, "Ha", 6564.61, TieMode::Primary),
        LineRecord::new(4, "NII-6550", 6549.86, TieMode::TieAll(5)).with_flux_ratio(0.34),
        LineRecord::new(5, "NII-6585", 6585.27, TieMode::TieKinematics(3)),
        LineRecord::new(6, "SII-6718", 6718.29, TieMode::TieKinematics(3)),
        LineRecord::new(7, "SII-6733", 6732.67, TieMode::TieKinematics(3)),
        LineRecord::new(8, "HeII-4687", 4687.02, TieMode::WeakIndependent).with_action(LineAction::Ignore),
    ];
    Ok(LineDatabase::new(lines)?)
}

/// Generate noisy spectra of the resolved line templates.
///
/// All templates of a spectrum share one `(cz, sigma)`; template fluxes are
/// drawn independently. The spectra sample the same grid the templates are
/// built on, so the base velocity offset is zero.
pub fn generate_sample(db: &LineDatabase, config: &SampleConfig) -> Result<SampleData, AppError> {
    if config.n_spectra == 0 {
        return Err(AppError::new(2, "Number of spectra must be > 0."));
    }
    if config.n_pixels < 2 || !(config.log_step > 0.0 && config.wave_start > 0.0) {
        return Err(AppError::new(2, "Invalid wavelength grid for sample generation."));
    }
    let ordered = |r: [f64; 2]| r[0].is_finite() && r[1].is_finite() && r[0] <= r[1];
    if !(ordered(config.cz_range) && ordered(config.sigma_range) && ordered(config.flux_range)) {
        return Err(AppError::new(2, "Invalid truth ranges for sample generation."));
    }
    if !(config.sigma_range[0] > 0.0 && config.resolution > 0.0 && config.noise >= 0.0) {
        return Err(AppError::new(2, "Dispersion, resolution, and noise must be positive."));
    }

    let wave: Vec<f64> = (0..config.n_pixels)
        .map(|i| config.wave_start * (config.log_step * i as f64).exp())
        .collect();
    let velscale = velocity_scale(&wave);
    let coverage = [wave[0], wave[wave.len() - 1]];

    let ctx = RunContext::quiet();
    let resolution = TieResolver::new().with_wavelength_range(coverage).resolve(db, &ctx)?;
    let templates = TemplateBuilder::new(
        wave.clone(),
        InstrumentalDispersion::Constant(sigma_from_resolution(config.resolution)),
        true,
    )?
    .build(db, resolution, &ctx);
    let rows: Vec<Vec<f64>> = (0..templates.n_templates())
        .map(|t| templates.flux.row(t).iter().copied().collect())
        .collect();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let noise = Normal::new(0.0, config.noise.max(f64::MIN_POSITIVE))
        .map_err(|e| AppError::new(4, format!("Noise distribution error: {e}")))?;

    let npix = wave.len();
    let mut flux = Vec::with_capacity(config.n_spectra);
    let mut truth = Vec::with_capacity(config.n_spectra);
    let mut template_flux = Vec::with_capacity(config.n_spectra);

    for _ in 0..config.n_spectra {
        let cz = rng.gen_range(config.cz_range[0]..=config.cz_range[1]);
        let sigma = rng.gen_range(config.sigma_range[0]..=config.sigma_range[1]);
        let v = revert_velocity(cz);

        let mut spectrum = vec![0.0; npix];
        let mut weights = Vec::with_capacity(rows.len());
        for row in &rows {
            let w = rng.gen_range(config.flux_range[0]..=config.flux_range[1]);
            let line = broaden(row, npix, -v / velscale, sigma / velscale, &[]);
            for (s, l) in spectrum.iter_mut().zip(&line) {
                *s += w * l;
            }
            weights.push(w);
        }
        if config.noise > 0.0 {
            for s in spectrum.iter_mut() {
                *s += noise.sample(&mut rng);
            }
        }

        flux.push(spectrum);
        truth.push([cz, sigma]);
        template_flux.push(weights);
    }

    let n = config.n_spectra;
    let spectra = Spectra {
        wave,
        flux,
        error: vec![vec![config.noise.max(1e-3); npix]; n],
        mask: None,
        resolution: Some(vec![vec![config.resolution; npix]; n]),
        guess_cz: vec![0.5 * (config.cz_range[0] + config.cz_range[1]); n],
        guess_sigma: None,
    };

    Ok(SampleData {
        spectra,
        truth,
        template_flux,
    })
}
