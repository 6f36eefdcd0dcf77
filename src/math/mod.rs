//! Mathematical utilities: velocity-space kernels, polynomial bases, search
//! grids, weighted least squares, and robust statistics.

pub mod basis;
pub mod grid;
pub mod losvd;
pub mod ols;
pub mod stats;

pub use basis::*;
pub use grid::*;
pub use losvd::*;
pub use ols::*;
pub use stats::*;
