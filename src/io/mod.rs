//! Input/output helpers.
//!
//! - JSON readers for line databases, spectra, and configuration (`input`)
//! - result exports (JSON/CSV) (`export`)

pub mod export;
pub mod input;

pub use export::*;
pub use input::*;
