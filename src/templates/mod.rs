//! Emission-line basis templates.

pub mod builder;
pub mod profiles;

pub use builder::*;
pub use profiles::*;
