//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - line database records and tie modes (`LineRecord`, `TieMode`)
//! - fit configuration (`FitConfig`) and the logging context (`RunContext`)
//! - quality flags (`Flag`, `Mask`)

pub mod mask;
pub mod types;

pub use mask::*;
pub use types::*;
