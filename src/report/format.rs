//! Formatted terminal output.
//!
//! Formatting lives in one place so the resolution and fitting code stays free
//! of presentation concerns.

use crate::domain::FitConfig;
use crate::fit::{EmissionLineFitOutput, SpectrumStatus};
use crate::lines::{LineDatabase, TieResolution};
use crate::report::LineSummary;

/// Tie grouping of every database line.
pub fn format_resolution(db: &LineDatabase, res: &TieResolution) -> String {
    let mut out = String::new();

    out.push_str("=== elfit - emission-line tie resolution ===\n");
    out.push_str(&format!(
        "Lines: {} ({} fit) | templates={} components={} velocity groups={} sigma groups={}\n\n",
        db.len(),
        res.n_fit_lines(),
        res.n_templates(),
        res.n_components,
        res.n_velocity_groups,
        res.n_sigma_groups
    ));

    push_row(
        &mut out,
        format!(
            "{:>6} {:<16} {:>10} {:<5} {:>8} {:>9} {:>6} {:>6}",
            "index", "name", "restwave", "mode", "template", "component", "vgroup", "sgroup"
        ),
    );
    push_row(
        &mut out,
        format!(
            "{:->6} {:-<16} {:->10} {:-<5} {:->8} {:->9} {:->6} {:->6}",
            "", "", "", "", "", "", "", ""
        ),
    );

    for (pos, line) in db.iter().enumerate() {
        let (template, component, vgroup, sgroup) = match res.line_template[pos] {
            Some(t) => (
                t.to_string(),
                res.template_component[t].to_string(),
                res.template_velocity_group[t].to_string(),
                res.template_sigma_group[t].to_string(),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string(), "-".to_string()),
        };
        push_row(
            &mut out,
            format!(
                "{:>6} {:<16} {:>10.3} {:<5} {:>8} {:>9} {:>6} {:>6}",
                line.index,
                truncate(&line.name, 16),
                line.rest_wavelength,
                line.mode.to_string(),
                template,
                component,
                vgroup,
                sgroup
            ),
        );
    }

    out
}

/// Batch summary: status counts, fit quality, and the per-line medians.
pub fn format_fit_summary(output: &EmissionLineFitOutput, summaries: &[LineSummary], config: &FitConfig) -> String {
    let mut out = String::new();

    out.push_str("=== elfit - emission-line fit ===\n");
    out.push_str(&format!(
        "Spectra: n={} | pixels={} | velscale={:.3} km/s\n",
        output.n_spectra(),
        output.wave.len(),
        output.velscale
    ));
    out.push_str(&format!(
        "Templates: {} | components: {} | free kinematic parameters: {} | dof: {}\n",
        output.template_component.len(),
        output.tied.n_components(),
        output.tied.n_free,
        output.tied.dof
    ));
    out.push_str(&format!(
        "Degree: additive={} multiplicative={} | rejection: {}\n",
        config.degree,
        config.mdegree,
        config
            .reject_boxcar
            .map(|b| format!("boxcar={b} sigma={:.1}", config.reject_sigma))
            .unwrap_or_else(|| "off".to_string())
    ));
    out.push_str(&format!(
        "Status: succeeded={} failed={} skipped={} not fit={}\n",
        output.count(SpectrumStatus::Succeeded),
        output.count(SpectrumStatus::Failed),
        output.count(SpectrumStatus::Skipped),
        output.count(SpectrumStatus::NotFit)
    ));

    let rchi2: Vec<f64> = output
        .fits
        .iter()
        .filter(|f| f.status == SpectrumStatus::Succeeded)
        .map(|f| f.rchi2)
        .collect();
    if !rchi2.is_empty() {
        let mean = rchi2.iter().sum::<f64>() / rchi2.len() as f64;
        out.push_str(&format!("Mean reduced chi2: {mean:.3}\n"));
    }

    out.push_str("\nLines:\n");
    push_row(
        &mut out,
        format!(
            "{:>6} {:<16} {:>9} {:>6} {:>7} {:>12} {:>10} {:>9}",
            "index", "name", "component", "n_fit", "flagged", "flux", "cz", "sigma"
        ),
    );
    push_row(
        &mut out,
        format!(
            "{:->6} {:-<16} {:->9} {:->6} {:->7} {:->12} {:->10} {:->9}",
            "", "", "", "", "", "", "", ""
        ),
    );
    for s in summaries {
        push_row(
            &mut out,
            format!(
                "{:>6} {:<16} {:>9} {:>6} {:>7} {:>12} {:>10} {:>9}",
                s.index,
                truncate(&s.name, 16),
                s.component.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                s.n_fit,
                s.n_flagged,
                fmt_value(s.median_flux, 4),
                fmt_value(s.median_cz, 2),
                fmt_value(s.median_sigma, 2)
            ),
        );
    }

    for (i, fit) in output.fits.iter().enumerate() {
        if let Some(reason) = &fit.failure {
            out.push_str(&format!("  (spectrum {i}) {reason}\n"));
        }
    }

    out
}

/// Injected versus recovered kinematics of the first emission-line component.
pub fn format_truth_comparison(truth: &[[f64; 2]], output: &EmissionLineFitOutput) -> String {
    let mut out = String::new();
    out.push_str("Truth vs fit (first emission-line component):\n");
    push_row(
        &mut out,
        format!(
            "{:>8} {:<10} {:>10} {:>10} {:>10} {:>10}",
            "spectrum", "status", "cz_true", "cz_fit", "sig_true", "sig_fit"
        ),
    );
    for (i, (t, lines)) in truth.iter().zip(&output.lines).enumerate() {
        let status = output.fits.get(i).map(|f| f.status);
        let fitted = lines
            .iter()
            .filter(|l| l.template.is_some())
            .min_by_key(|l| l.component)
            .filter(|_| status == Some(SpectrumStatus::Succeeded));
        let (cz, sigma) = fitted.map_or((f64::NAN, f64::NAN), |l| {
            (
                l.kinematics.first().copied().unwrap_or(f64::NAN),
                l.kinematics.get(1).copied().unwrap_or(f64::NAN),
            )
        });
        push_row(
            &mut out,
            format!(
                "{:>8} {:<10} {:>10.2} {:>10} {:>10.2} {:>10}",
                i,
                status.map(status_label).unwrap_or("-"),
                t[0],
                fmt_value(cz, 2),
                t[1],
                fmt_value(sigma, 2)
            ),
        );
    }
    out
}

fn status_label(status: SpectrumStatus) -> &'static str {
    match status {
        SpectrumStatus::NotFit => "not_fit",
        SpectrumStatus::Skipped => "skipped",
        SpectrumStatus::Failed => "failed",
        SpectrumStatus::Succeeded => "ok",
    }
}

fn push_row(out: &mut String, row: String) {
    out.push_str(row.trim_end());
    out.push('\n');
}

fn fmt_value(v: f64, decimals: usize) -> String {
    if v.is_finite() {
        format!("{v:.decimals$}")
    } else {
        "-".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
