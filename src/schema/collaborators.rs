//! Contracts for the external collaborators the engine drives.
//!
//! Program construction and genetic recombination live outside this crate;
//! the engine only sees the trait surface below. Implementations must be
//! stateless with respect to the population: every call returns a newly
//! constructed program, and shared state (if any) must be safe behind `&self`
//! from multiple worker threads.

use std::collections::HashMap;
use std::sync::Arc;

use super::dataset::Dataset;
use super::program::{Expression, ExprError, Program};

/// Inputs for independent program construction (initial population, refill).
pub struct GenerationContext<'a> {
    pub data: &'a Dataset,
    pub features: &'a [String],
    pub const_range: (f64, f64),
    pub operators: &'a [String],
    pub metrics: &'a [Arc<dyn FitnessMetric>],
    pub parsimony: f64,
    pub parsimony_decay: f64,
}

/// Inputs for producing one offspring from the current population.
pub struct OffspringContext<'a> {
    pub population: &'a [Program],
    pub data: &'a Dataset,
    pub metrics: &'a [Arc<dyn FitnessMetric>],
    pub generation: usize,
    pub tournament_size: usize,
    pub operator_frequencies: &'a HashMap<String, f64>,
}

/// Builds new independent programs, and restores expressions from
/// checkpoint snapshots.
pub trait ProgramFactory: Send + Sync {
    fn generate(&self, ctx: &GenerationContext<'_>) -> Program;

    /// Inverse of `Expression::to_value`, used when loading a checkpoint.
    fn restore(&self, expression: &serde_json::Value) -> Result<Arc<dyn Expression>, ExprError>;
}

/// Produces one offspring per call via selection + genetic operators.
pub trait OffspringGenerator: Send + Sync {
    fn generate(&self, ctx: &OffspringContext<'_>) -> Program;
}

/// A single scoring objective.
///
/// `evaluate` may tune the program's constants in place (the constant
/// optimizer runs inside fitness evaluation) and must convert numeric
/// failures to `+inf` for minimized metrics; constraint-style metrics return
/// the violation magnitude instead, 0 when satisfied.
pub trait FitnessMetric: Send + Sync {
    fn name(&self) -> &str;

    fn minimize(&self) -> bool {
        true
    }

    /// Reference point for hypervolume accounting, when configured.
    fn hv_reference(&self) -> Option<f64> {
        None
    }

    /// Value at which this objective considers a program converged.
    fn convergence_threshold(&self) -> Option<f64> {
        None
    }

    /// Derive any dataset columns this metric needs (e.g. weight columns).
    /// Runs once, single-threaded, before parallel evaluation begins.
    fn prepare(&self, _data: &mut Dataset) {}

    fn evaluate(&self, program: &mut Program, data: &Dataset) -> f64;
}
