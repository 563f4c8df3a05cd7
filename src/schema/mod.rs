//! Schema module - configuration, dataset, and program data model.

mod collaborators;
mod config;
mod dataset;
mod program;

pub use collaborators::*;
pub use config::*;
pub use dataset::*;
pub use program::*;
