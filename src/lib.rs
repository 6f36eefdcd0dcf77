//! `elfit` library crate.
//!
//! The binary (`elfit`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - tie resolution, template building, and fitting are reusable on their own
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod lines;
pub mod math;
pub mod report;
pub mod templates;
