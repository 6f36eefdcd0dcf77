//! Velocity-space helpers.
//!
//! Spectra are sampled geometrically, so a constant velocity step per pixel
//! (`velscale`, km/s) maps pixel shifts to velocities. The optimizer works in
//! these "pixel velocities" `v = c ln(1 + z)`; reported velocities are
//! redshift velocities `cz = c (exp(v/c) - 1)`.

use crate::domain::{C_KMS, SIG2FWHM};

/// Kernel half-width in units of sigma.
const KERNEL_SIGMAS: f64 = 5.0;

/// Smallest dispersion (pixels) used when building a kernel.
const MIN_SIGMA_PIX: f64 = 1e-2;

/// Velocity step per pixel of a geometrically sampled wavelength vector.
pub fn velocity_scale(wave: &[f64]) -> f64 {
    let n = wave.len();
    if n < 2 {
        return f64::NAN;
    }
    C_KMS * (wave[n - 1] / wave[0]).ln() / (n - 1) as f64
}

/// Velocity width of each pixel.
///
/// For geometric sampling this is constant; otherwise it is `c Δλ / λ`.
pub fn pixel_velocity_widths(wave: &[f64], log_sampled: bool) -> Vec<f64> {
    let n = wave.len();
    if log_sampled {
        return vec![velocity_scale(wave); n];
    }
    (0..n)
        .map(|i| {
            let (a, b) = if i + 1 < n { (i, i + 1) } else { (i - 1, i) };
            C_KMS * (wave[b] - wave[a]) / wave[i]
        })
        .collect()
}

/// Convert pixel velocities (and errors) to redshift velocities.
pub fn convert_velocity(v: f64, verr: f64) -> (f64, f64) {
    let f = (v / C_KMS).exp();
    ((f - 1.0) * C_KMS, verr * f)
}

/// Convert a redshift velocity to a pixel velocity.
pub fn revert_velocity(cz: f64) -> f64 {
    C_KMS * (cz / C_KMS + 1.0).ln()
}

/// Instrumental dispersion (km/s) for a spectral resolution `R = λ/Δλ_FWHM`.
pub fn sigma_from_resolution(r: f64) -> f64 {
    C_KMS / (r * SIG2FWHM)
}

/// Linear interpolation of `y(x)` at `at`, clamped to the end values.
pub fn interpolate(x: &[f64], y: &[f64], at: f64) -> f64 {
    let n = x.len().min(y.len());
    if n == 0 {
        return f64::NAN;
    }
    if at <= x[0] {
        return y[0];
    }
    if at >= x[n - 1] {
        return y[n - 1];
    }
    let hi = x[..n].partition_point(|v| *v < at);
    let lo = hi - 1;
    let t = (at - x[lo]) / (x[hi] - x[lo]);
    y[lo] + t * (y[hi] - y[lo])
}

/// Broaden and shift a template with a line-of-sight velocity distribution.
///
/// Output pixel `j` samples the template around fractional pixel `j + offset`,
/// where `offset` (pixels) already includes the systemic offset minus the
/// velocity shift. `sigma` is in pixels. `hermite` holds optional
/// Gauss-Hermite coefficients `[h3, h4]`. Template pixels outside the range
/// contribute zero.
pub fn broaden(template: &[f64], n_out: usize, offset: f64, sigma: f64, hermite: &[f64]) -> Vec<f64> {
    let sigma = sigma.abs().max(MIN_SIGMA_PIX);
    let reach = (KERNEL_SIGMAS * sigma).ceil() as i64 + 1;
    let frac = offset - offset.floor();
    let base = offset.floor() as i64;
    let h3 = hermite.first().copied().unwrap_or(0.0);
    let h4 = hermite.get(1).copied().unwrap_or(0.0);

    // The fractional offset is the same for every output pixel, so the kernel is too.
    let mut norm = 0.0;
    let kernel: Vec<f64> = (-reach..=reach)
        .map(|k| {
            let y = (frac - k as f64) / sigma;
            let g = (-0.5 * y * y).exp();
            norm += g;
            g * (1.0 + h3 * hermite3(y) + h4 * hermite4(y))
        })
        .collect();

    let n_tpl = template.len() as i64;
    (0..n_out as i64)
        .map(|j| {
            let center = j + base;
            let mut acc = 0.0;
            for (ki, k) in (-reach..=reach).enumerate() {
                let m = center + k;
                if m >= 0 && m < n_tpl {
                    acc += template[m as usize] * kernel[ki];
                }
            }
            acc / norm
        })
        .collect()
}

fn hermite3(y: f64) -> f64 {
    y * (2.0 * y * y - 3.0) / 3f64.sqrt()
}

fn hermite4(y: f64) -> f64 {
    let y2 = y * y;
    (y2 * (4.0 * y2 - 12.0) + 3.0) / (2.0 * 6f64.sqrt())
}
