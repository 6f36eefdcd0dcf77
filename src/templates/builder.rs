//! Basis spectra for resolved emission-line templates.
//!
//! Every template row is the sum of its member lines, each evaluated with the
//! instrumental dispersion at the line's rest wavelength. Lines tied with `a`
//! therefore keep their flux ratios fixed inside a single basis spectrum.

use nalgebra::DMatrix;
use tracing::{debug, warn};

use crate::domain::{C_KMS, RunContext};
use crate::error::FitSetupError;
use crate::lines::{LineDatabase, TieResolution};
use crate::math::{interpolate, pixel_velocity_widths};

/// Instrumental dispersion (km/s) as a function of wavelength.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentalDispersion {
    Constant(f64),
    /// One value per pixel of the template wavelength grid.
    PerPixel(Vec<f64>),
}

impl InstrumentalDispersion {
    fn at(&self, wave: &[f64], lambda: f64) -> f64 {
        match self {
            InstrumentalDispersion::Constant(s) => *s,
            InstrumentalDispersion::PerPixel(s) => interpolate(wave, s, lambda),
        }
    }
}

/// Basis spectra plus the grouping they were built from.
#[derive(Debug, Clone)]
pub struct EmissionLineTemplates {
    /// Rest-frame wavelength grid (Å).
    pub wave: Vec<f64>,
    /// `n_templates x n_pixels`.
    pub flux: DMatrix<f64>,
    pub resolution: TieResolution,
    /// Instrumental dispersion used for each line (database position); `None` if not fit.
    pub line_sigma_inst: Vec<Option<f64>>,
    pub line_undersampled: Vec<bool>,
    pub log_sampled: bool,
}

impl EmissionLineTemplates {
    pub fn n_templates(&self) -> usize {
        self.flux.nrows()
    }

    pub fn n_pixels(&self) -> usize {
        self.flux.ncols()
    }

    /// Template dispersion (km/s) of a line, if it was fit.
    pub fn line_sigma(&self, pos: usize) -> Option<f64> {
        self.line_sigma_inst.get(pos).copied().flatten()
    }
}

#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    wave: Vec<f64>,
    sigma_inst: InstrumentalDispersion,
    log_sampled: bool,
    undersample_threshold: f64,
}

impl TemplateBuilder {
    pub fn new(
        wave: Vec<f64>,
        sigma_inst: InstrumentalDispersion,
        log_sampled: bool,
    ) -> Result<Self, FitSetupError> {
        validate_wavelengths(&wave)?;
        match &sigma_inst {
            InstrumentalDispersion::Constant(s) => check_dispersion(*s)?,
            InstrumentalDispersion::PerPixel(s) => {
                if s.len() != wave.len() {
                    return Err(FitSetupError::LengthMismatch {
                        what: "instrumental dispersion",
                        got: s.len(),
                        expected: wave.len(),
                    });
                }
                for v in s {
                    check_dispersion(*v)?;
                }
            }
        }
        Ok(Self {
            wave,
            sigma_inst,
            log_sampled,
            undersample_threshold: 0.9,
        })
    }

    pub fn with_undersample_threshold(mut self, threshold: f64) -> Self {
        self.undersample_threshold = threshold;
        self
    }

    pub fn wave(&self) -> &[f64] {
        &self.wave
    }

    pub fn build(
        &self,
        db: &LineDatabase,
        resolution: TieResolution,
        ctx: &RunContext,
    ) -> EmissionLineTemplates {
        let npix = self.wave.len();
        let n_lines = db.len();
        let dv = pixel_velocity_widths(&self.wave, self.log_sampled);

        let mut flux = DMatrix::<f64>::zeros(resolution.n_templates(), npix);
        let mut line_sigma_inst = vec![None; n_lines];
        let mut line_undersampled = vec![false; n_lines];

        for (pos, line) in db.iter().enumerate() {
            let Some(template) = resolution.line_template[pos] else {
                continue;
            };
            let sigma = self.sigma_inst.at(&self.wave, line.rest_wavelength);
            line_sigma_inst[pos] = Some(sigma);

            let closest = closest_pixel(&self.wave, line.rest_wavelength);
            if sigma / dv[closest] < self.undersample_threshold {
                line_undersampled[pos] = true;
                warn!(
                    "Line {} ({}) is undersampled: sigma_inst = {:.2} km/s for a {:.2} km/s pixel.",
                    line.index, line.name, sigma, dv[closest]
                );
            }

            let profile = line.profile.profile();
            let params = profile.parameters_from_moments(line.flux_ratio, 0.0, sigma);
            for (j, lambda) in self.wave.iter().enumerate() {
                let v = C_KMS * (lambda / line.rest_wavelength - 1.0);
                flux[(template, j)] += profile.evaluate(v, &params);
            }
        }

        if !ctx.quiet {
            debug!(
                "Built {} emission-line templates over {} pixels.",
                resolution.n_templates(),
                npix
            );
        }

        EmissionLineTemplates {
            wave: self.wave.clone(),
            flux,
            resolution,
            line_sigma_inst,
            line_undersampled,
            log_sampled: self.log_sampled,
        }
    }
}

fn validate_wavelengths(wave: &[f64]) -> Result<(), FitSetupError> {
    if wave.len() < 2 || wave.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
        return Err(FitSetupError::InvalidWavelengths);
    }
    if wave.windows(2).any(|w| w[1] <= w[0]) {
        return Err(FitSetupError::InvalidWavelengths);
    }
    Ok(())
}

fn check_dispersion(sigma: f64) -> Result<(), FitSetupError> {
    if sigma.is_finite() && sigma > 0.0 {
        Ok(())
    } else {
        Err(FitSetupError::InvalidDispersion(sigma))
    }
}

fn closest_pixel(wave: &[f64], lambda: f64) -> usize {
    let hi = wave.partition_point(|w| *w < lambda);
    if hi == 0 {
        return 0;
    }
    if hi >= wave.len() {
        return wave.len() - 1;
    }
    if lambda - wave[hi - 1] <= wave[hi] - lambda {
        hi - 1
    } else {
        hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LineRecord, ProfileKind, TieMode};
    use crate::lines::TieResolver;
    use approx::assert_relative_eq;

    fn log_grid(start: f64, dlog: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start * (dlog * i as f64).exp()).collect()
    }

    fn three_line_db() -> LineDatabase {
        LineDatabase::new(vec![
            LineRecord::new(0, "OIII-5008", 5008.24, TieMode::Primary),
            LineRecord::new(1, "OIII-4960", 4960.30, TieMode::TieAll(0)).with_flux_ratio(0.35),
            LineRecord::new(2, "Hb", 4862.69, TieMode::TieKinematics(0)),
        ])
        .unwrap()
    }

    #[test]
    fn tie_all_lines_share_one_basis_row() {
        let db = three_line_db();
        let res = TieResolver::new().resolve(&db, &RunContext::quiet()).unwrap();
        let wave = log_grid(4800.0, 1e-4, 4000);
        let builder = TemplateBuilder::new(wave.clone(), InstrumentalDispersion::Constant(60.0), true)
            .unwrap();
        let tpl = builder.build(&db, res, &RunContext::quiet());

        assert_eq!(tpl.n_templates(), 2);
        assert_eq!(tpl.n_pixels(), wave.len());

        // Template 0 is the two [OIII] lines summed with their flux ratio.
        let g = ProfileKind::Gaussian.profile();
        let p5008 = g.parameters_from_moments(1.0, 0.0, 60.0);
        let p4960 = g.parameters_from_moments(0.35, 0.0, 60.0);
        for j in (0..wave.len()).step_by(97) {
            let expected = g.evaluate(C_KMS * (wave[j] / 5008.24 - 1.0), &p5008)
                + g.evaluate(C_KMS * (wave[j] / 4960.30 - 1.0), &p4960);
            assert_relative_eq!(tpl.flux[(0, j)], expected, epsilon = 1e-12);
        }

        // Velocity-space flux of template 1 integrates to the flux ratio.
        let dv = C_KMS * 1e-4;
        let total: f64 = (0..wave.len()).map(|j| tpl.flux[(1, j)] * dv).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-2);
    }

    #[test]
    fn narrow_lines_are_flagged_undersampled() {
        let db = three_line_db();
        let res = TieResolver::new().resolve(&db, &RunContext::quiet()).unwrap();
        // 69 km/s pixels with a 20 km/s LSF.
        let builder = TemplateBuilder::new(
            log_grid(4800.0, 2.3e-4, 1500),
            InstrumentalDispersion::Constant(20.0),
            true,
        )
        .unwrap();
        let tpl = builder.build(&db, res, &RunContext::quiet());
        assert_eq!(tpl.line_undersampled, vec![true, true, true]);
        assert_eq!(tpl.line_sigma(1), Some(20.0));
    }

    #[test]
    fn per_pixel_dispersion_is_interpolated_at_rest_wavelength() {
        let db = LineDatabase::new(vec![LineRecord::new(0, "Ha", 6564.61, TieMode::Primary)]).unwrap();
        let res = TieResolver::new().resolve(&db, &RunContext::quiet()).unwrap();
        let wave = log_grid(6000.0, 1e-4, 2000);
        let sigma: Vec<f64> = wave.iter().map(|w| w / 100.0).collect();
        let tpl = TemplateBuilder::new(wave, InstrumentalDispersion::PerPixel(sigma), true)
            .unwrap()
            .build(&db, res, &RunContext::quiet());
        assert_relative_eq!(tpl.line_sigma(0).unwrap(), 65.6461, epsilon = 1e-3);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert_eq!(
            TemplateBuilder::new(vec![5000.0, 4999.0], InstrumentalDispersion::Constant(50.0), false)
                .unwrap_err(),
            FitSetupError::InvalidWavelengths
        );
        assert!(matches!(
            TemplateBuilder::new(vec![1.0, 2.0, 3.0], InstrumentalDispersion::PerPixel(vec![1.0]), false),
            Err(FitSetupError::LengthMismatch { got: 1, expected: 3, .. })
        ));
        assert_eq!(
            TemplateBuilder::new(vec![1.0, 2.0], InstrumentalDispersion::Constant(0.0), false).unwrap_err(),
            FitSetupError::InvalidDispersion(0.0)
        );
    }
}
