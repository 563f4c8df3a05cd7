//! Multi-objective symbolic regression.
//!
//! This crate evolves a population of candidate symbolic expressions against
//! several simultaneous objectives, combining NSGA-style Pareto ranking and
//! crowding-distance selection with an inner gradient-based optimizer that
//! tunes each candidate's free constants using analytically-derived
//! gradients.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: configuration, the columnar dataset, the program data model,
//!   and the contracts for the external collaborators (expression trees,
//!   program factory, offspring generator, fitness metrics)
//! - `engine`: the evolutionary controller, population registry, Pareto
//!   ranking and crowding, hypervolume, constant optimizer, and built-in
//!   fitness metrics
//!
//! Expression trees and genetic operators live outside this crate: the
//! engine drives them through the `ProgramFactory` and `OffspringGenerator`
//! traits, constructs populations in parallel over an owned worker pool, and
//! keeps every registry mutation on the controller thread.

pub mod engine;
pub mod schema;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use engine::{
    Checkpoint, FitError, FitOptions, Status, SummaryRow, SymbolicRegressor, evaluate_program,
};
pub use engine::metrics::{NotConstant, RegressionMetric, ValueRange};
pub use schema::{
    Dataset, Evaluator, Expression, FitnessMetric, FitnessVector, Objective, OffspringGenerator,
    OptimizerConfig, OptimizerSpec, OptimizerVariant, Program, ProgramFactory, RegressorConfig,
    Task,
};
