//! JSON readers for line databases, spectra, and fit configuration.
//!
//! Parse failures are reported with exit code 2, except for records that parse
//! as JSON but violate the line database schema (bad tie modes, duplicate
//! indices), which are database validation problems (exit code 3).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::domain::{FitConfig, LineRecord};
use crate::error::AppError;
use crate::fit::Spectra;
use crate::lines::LineDatabase;

/// Read a line database: a JSON array of line records.
pub fn read_line_database(path: &Path) -> Result<LineDatabase, AppError> {
    let records: Vec<LineRecord> = read_json(path, "line database").map_err(|(e, msg)| {
        if e.is_data() {
            AppError::new(3, format!("Invalid emission-line database: {e}"))
        } else {
            AppError::new(2, msg)
        }
    })?;
    Ok(LineDatabase::new(records)?)
}

/// Read spectra: `{wave, flux, error, mask?, resolution?, guess_cz, guess_sigma?}`.
pub fn read_spectra(path: &Path) -> Result<Spectra, AppError> {
    let spectra: Spectra = read_json(path, "spectra").map_err(|(_, msg)| AppError::new(2, msg))?;
    spectra.validate()?;
    Ok(spectra)
}

/// Read a fit configuration; missing fields keep their defaults.
pub fn read_fit_config(path: &Path) -> Result<FitConfig, AppError> {
    read_json(path, "fit configuration").map_err(|(_, msg)| AppError::new(2, msg))
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, (serde_json::Error, String)> {
    let file = File::open(path).map_err(|e| {
        (
            serde_json::Error::io(e),
            format!("Failed to open {what} '{}'.", path.display()),
        )
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        let msg = format!("Invalid {what} JSON '{}': {e}", path.display());
        (e, msg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TieMode;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("elfit-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reads_line_database() {
        let path = temp_file(
            "lines.json",
            r#"[
                {"index": 0, "name": "OIII-5008", "restwave": 5008.24, "action": "f", "mode": "f"},
                {"index": 1, "name": "OIII-4960", "restwave": 4960.30, "action": "f", "mode": "a0", "flux": 0.35}
            ]"#,
        );
        let db = read_line_database(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(1).unwrap().mode, TieMode::TieAll(0));
        assert_eq!(db.get(1).unwrap().flux_ratio, 0.35);
    }

    #[test]
    fn malformed_mode_is_a_database_error() {
        let path = temp_file(
            "badmode.json",
            r#"[{"index": 0, "name": "Ha", "restwave": 6564.6, "action": "f", "mode": "q1"}]"#,
        );
        let err = read_line_database(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("q1"));
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let err = read_spectra(Path::new("/nonexistent/elfit/spectra.json")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let path = temp_file("config.json", r#"{"reject_boxcar": 101, "threads": 2}"#);
        let cfg = read_fit_config(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.reject_boxcar, Some(101));
        assert_eq!(cfg.threads, Some(2));
        assert_eq!(cfg.degree, -1);
    }
}
