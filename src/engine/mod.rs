//! Engine module - the evolutionary and numerical core.

pub mod checkpoint;
pub mod fitness;
pub mod metrics;
pub mod optimizer;
pub mod pareto;
pub mod population;
pub mod regressor;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use fitness::evaluate_program;
pub use optimizer::OptimizerResult;
pub use population::Population;
pub use regressor::{FitError, FitOptions, Status, SummaryRow, SymbolicRegressor};
