//! Emission-line fitting.
//!
//! Responsibilities:
//!
//! - compile kinematic ties into a flat parameter vector
//! - define the optimizer boundary and ship a grid-search reference optimizer
//! - fit batches of spectra in parallel (two passes when rejecting outliers)
//! - post-process solutions into per-spectrum and per-line results

pub mod grid_optimizer;
pub mod input;
pub mod optimizer;
pub mod orchestrator;
pub mod output;
mod postprocess;
pub mod rejection;
pub mod tied;

pub use grid_optimizer::*;
pub use input::*;
pub use optimizer::*;
pub use orchestrator::FitOrchestrator;
pub use output::*;
pub use rejection::*;
pub use tied::*;
