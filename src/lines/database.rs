//! Validated, ordered collection of emission lines.

use std::collections::HashMap;

use crate::domain::LineRecord;
use crate::error::ValidationError;

/// Emission-line database.
///
/// Lines keep their input order; tie targets refer to [`LineRecord::index`],
/// which is resolved to a position through [`LineDatabase::position_of`].
#[derive(Debug, Clone)]
pub struct LineDatabase {
    lines: Vec<LineRecord>,
    positions: HashMap<i64, usize>,
}

impl LineDatabase {
    /// Validate the records and build the index lookup.
    ///
    /// Tie consistency is not checked here; that is the job of
    /// [`crate::lines::TieResolver`].
    pub fn new(lines: Vec<LineRecord>) -> Result<Self, ValidationError> {
        if lines.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut positions = HashMap::with_capacity(lines.len());
        for (pos, line) in lines.iter().enumerate() {
            if positions.insert(line.index, pos).is_some() {
                return Err(ValidationError::DuplicateIndex {
                    index: line.index,
                    name: line.name.clone(),
                });
            }
            if !(line.rest_wavelength.is_finite() && line.rest_wavelength > 0.0) {
                return Err(ValidationError::InvalidWavelength {
                    index: line.index,
                    name: line.name.clone(),
                    restwave: line.rest_wavelength,
                });
            }
            if !line.flux_ratio.is_finite() {
                return Err(ValidationError::InvalidFluxRatio {
                    index: line.index,
                    name: line.name.clone(),
                    flux: line.flux_ratio,
                });
            }
        }

        Ok(Self { lines, positions })
    }

    pub fn lines(&self) -> &[LineRecord] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&LineRecord> {
        self.lines.get(pos)
    }

    /// Position of the line with database index `index`.
    pub fn position_of(&self, index: i64) -> Option<usize> {
        self.positions.get(&index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineRecord> {
        self.lines.iter()
    }

    /// Number of lines flagged to be fit.
    pub fn n_fit(&self) -> usize {
        self.lines.iter().filter(|l| l.is_fit()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TieMode;

    #[test]
    fn rejects_duplicate_indices() {
        let err = LineDatabase::new(vec![
            LineRecord::new(1, "Hb", 4862.7, TieMode::Primary),
            LineRecord::new(1, "Ha", 6564.6, TieMode::Primary),
        ])
        .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateIndex { index: 1, .. }));
    }

    #[test]
    fn rejects_nonpositive_wavelength() {
        let err = LineDatabase::new(vec![LineRecord::new(0, "bad", 0.0, TieMode::Primary)])
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidWavelength { .. }));
    }

    #[test]
    fn looks_up_positions_by_index() {
        let db = LineDatabase::new(vec![
            LineRecord::new(10, "OIII-4960", 4960.3, TieMode::TieAll(20)),
            LineRecord::new(20, "OIII-5008", 5008.2, TieMode::Primary),
        ])
        .unwrap();
        assert_eq!(db.position_of(20), Some(1));
        assert_eq!(db.position_of(10), Some(0));
        assert_eq!(db.position_of(5), None);
        assert_eq!(db.n_fit(), 2);
    }

    #[test]
    fn empty_database_is_invalid() {
        assert_eq!(LineDatabase::new(vec![]).unwrap_err(), ValidationError::Empty);
    }
}
