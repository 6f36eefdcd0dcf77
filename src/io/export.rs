//! Export fit results.
//!
//! - JSON: the complete [`EmissionLineFitOutput`] plus run metadata
//! - CSV: one row per (spectrum, line), easy to load in spreadsheets

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::FitConfig;
use crate::error::AppError;
use crate::fit::EmissionLineFitOutput;

#[derive(Debug, Serialize)]
struct FitExport<'a> {
    tool: &'static str,
    version: &'static str,
    created: DateTime<Utc>,
    config: &'a FitConfig,
    result: &'a EmissionLineFitOutput,
}

/// Write the full fit output as pretty-printed JSON.
pub fn write_fit_json(path: &Path, output: &EmissionLineFitOutput, config: &FitConfig) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create export JSON '{}': {e}", path.display())))?;

    let export = FitExport {
        tool: "elfit",
        version: env!("CARGO_PKG_VERSION"),
        created: Utc::now(),
        config,
        result: output,
    };
    serde_json::to_writer_pretty(BufWriter::new(file), &export)
        .map_err(|e| AppError::new(2, format!("Failed to write export JSON: {e}")))?;

    Ok(())
}

/// Write per-line measurements to a CSV file.
pub fn write_lines_csv(path: &Path, output: &EmissionLineFitOutput) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create export CSV '{}': {e}", path.display())))?;
    write_lines(BufWriter::new(file), output)
        .map_err(|e| AppError::new(2, format!("Failed to write export CSV: {e}")))
}

fn write_lines(mut out: impl Write, output: &EmissionLineFitOutput) -> std::io::Result<()> {
    writeln!(
        out,
        "spectrum,status,index,name,template,component,flux,flux_err,cz,cz_err,sigma,sigma_err,sigma_corr,mask"
    )?;

    for (i, (fit, lines)) in output.fits.iter().zip(&output.lines).enumerate() {
        let status = serde_json::to_value(fit.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        for line in lines {
            let kin = |k: usize| line.kinematics.get(k).copied().unwrap_or(0.0);
            let err = |k: usize| line.kinematic_errors.get(k).copied().unwrap_or(0.0);
            writeln!(
                out,
                "{i},{status},{},{},{},{},{:.6e},{:.6e},{:.4},{:.4},{:.4},{:.4},{:.4},{}",
                line.index,
                line.name,
                line.template.map(|t| t.to_string()).unwrap_or_default(),
                line.component.map(|c| c.to_string()).unwrap_or_default(),
                line.flux,
                line.flux_error,
                kin(0),
                err(0),
                kin(1),
                err(1),
                line.sigma_corr,
                line.mask.bits(),
            )?;
        }
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Flag, Mask};
    use crate::fit::{FitParameters, LineParameters, SpectrumStatus, compile_ties};

    fn output() -> EmissionLineFitOutput {
        let line = |index: i64, name: &str, mask: Mask| LineParameters {
            index,
            name: name.to_string(),
            template: (index == 0).then_some(0),
            component: (index == 0).then_some(0),
            flux: 12.5,
            flux_error: 0.5,
            kinematics: vec![150.0, 80.0],
            kinematic_errors: vec![2.0, 3.0],
            sigma_corr: 10.0,
            mask,
        };
        EmissionLineFitOutput {
            wave: vec![5000.0, 5001.0],
            velscale: 60.0,
            model: vec![vec![0.0; 2]],
            emission_model: vec![vec![0.0; 2]],
            model_mask: vec![vec![Mask::default(); 2]],
            template_component: vec![0],
            template_velocity_group: vec![0],
            template_sigma_group: vec![0],
            tied: compile_ties(&[], -1, 0),
            fits: vec![FitParameters::empty(SpectrumStatus::Succeeded, 1, 2)],
            lines: vec![vec![
                line(0, "Ha", Mask::default()),
                line(1, "NII", Mask::default().with(Flag::NoFit)),
            ]],
        }
    }

    #[test]
    fn csv_has_one_row_per_line() {
        let mut buf = Vec::new();
        write_lines(&mut buf, &output()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].starts_with("0,succeeded,0,Ha,0,0,"));
        assert!(rows[2].starts_with("0,succeeded,1,NII,,,"));
        assert!(rows[2].ends_with(&Mask::default().with(Flag::NoFit).bits().to_string()));
    }
}
