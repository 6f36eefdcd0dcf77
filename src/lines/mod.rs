//! Emission-line database and tie resolution.
//!
//! - `database`: validated, ordered line records
//! - `ties`: tie-mode resolution into templates, components, and groups

pub mod database;
pub mod ties;

pub use database::*;
pub use ties::*;
