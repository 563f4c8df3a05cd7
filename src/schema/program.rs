//! Program data model: fitness vectors, dominance, and the opaque
//! expression contract.
//!
//! The expression tree itself is external to this crate. A [`Program`] owns an
//! `Arc<dyn Expression>` plus everything the evolutionary loop needs: the free
//! constants, the referenced feature names, the per-objective fitness vector,
//! and the per-pass derived fields (rank, crowding distance, duplicate flag).

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use super::dataset::{Dataset, DatasetError};

/// Errors surfaced by expression compilation and (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("expression cannot be compiled: {0}")]
    Compile(String),
    #[error("expression has no derivative for constant {0}")]
    NotDifferentiable(usize),
    #[error("expression cannot be serialized: {0}")]
    Serialize(String),
    #[error("expression cannot be restored: {0}")]
    Restore(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// A compiled, numerically evaluable function of (features, constants).
pub trait Evaluator: Send + Sync {
    fn eval(&self, row: &[f64], constants: &[f64]) -> f64;
}

/// Contract for the external expression-tree representation.
///
/// `gradient` returns the compiled analytic derivative with respect to one
/// constant symbol; `to_value` is the serialization seam used by checkpoints
/// (the matching deserializer lives on the `ProgramFactory` collaborator).
pub trait Expression: fmt::Debug + Send + Sync {
    fn evaluator(&self) -> Result<Arc<dyn Evaluator>, ExprError>;
    fn gradient(&self, constant: usize) -> Result<Arc<dyn Evaluator>, ExprError>;
    fn complexity(&self) -> usize;
    fn render(&self) -> String;
    fn to_value(&self) -> Result<serde_json::Value, ExprError>;
}

/// Compiled form of an expression and its full constant gradient.
///
/// Built at most once per program; reused across every optimizer invocation
/// and prediction for that expression identity.
pub struct CompiledProgram {
    pub value: Arc<dyn Evaluator>,
    pub gradients: Vec<Arc<dyn Evaluator>>,
}

impl CompiledProgram {
    pub fn compile(expr: &dyn Expression, n_constants: usize) -> Result<Self, ExprError> {
        let value = expr.evaluator()?;
        let gradients = (0..n_constants)
            .map(|i| expr.gradient(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { value, gradients })
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("gradients", &self.gradients.len())
            .finish()
    }
}

/// JSON-safe representation for values that may be non-finite.
///
/// `serde_json` maps non-finite floats to `null`, which would corrupt
/// checkpoints (crowding distances are infinite at front boundaries).
pub(crate) mod total_f64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = if value.is_finite() {
            Repr::Finite(*value)
        } else if value.is_nan() {
            Repr::Special("nan".to_string())
        } else if *value > 0.0 {
            Repr::Special("inf".to_string())
        } else {
            Repr::Special("-inf".to_string())
        };
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(value) => Ok(value),
            Repr::Special(tag) => match tag.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(serde::de::Error::custom(format!(
                    "unknown float tag `{other}`"
                ))),
            },
        }
    }
}

/// One scored objective of a program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    #[serde(with = "total_f64")]
    pub value: f64,
    /// Direction of the comparison in dominance checks.
    pub minimize: bool,
    /// Reference point for hypervolume, when configured for this objective.
    pub hv_reference: Option<f64>,
}

/// Ordered per-objective scores, aligned across a population by construction
/// (every program is scored by the same metric sequence).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitnessVector {
    objectives: Vec<Objective>,
}

impl FitnessVector {
    pub fn push(&mut self, objective: Objective) {
        self.objectives.push(objective);
    }

    pub fn clear(&mut self) {
        self.objectives.clear();
    }

    pub fn len(&self) -> usize {
        self.objectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn get(&self, name: &str) -> Option<&Objective> {
        self.objectives.iter().find(|o| o.name == name)
    }

    /// Exact equality of objective values, used for duplicate detection.
    pub fn values_equal(&self, other: &FitnessVector) -> bool {
        self.objectives.len() == other.objectives.len()
            && self
                .objectives
                .iter()
                .zip(&other.objectives)
                .all(|(a, b)| a.name == b.name && a.value == b.value)
    }

    /// Pareto dominance: no objective worse, at least one strictly better.
    /// Objectives with `minimize == false` invert the comparison.
    pub fn dominates(&self, other: &FitnessVector) -> bool {
        if self.objectives.len() != other.objectives.len() || self.objectives.is_empty() {
            return false;
        }
        let mut strictly_better = false;
        for (a, b) in self.objectives.iter().zip(&other.objectives) {
            let (mine, theirs) = if a.minimize {
                (a.value, b.value)
            } else {
                (b.value, a.value)
            };
            if mine > theirs {
                return false;
            }
            if mine < theirs {
                strictly_better = true;
            }
        }
        strictly_better
    }
}

/// A candidate solution in the population.
///
/// The expression structure is immutable once created; the derived fields
/// (`rank`, `crowding_distance`, `is_duplicate`, fitness) are repopulated by
/// each pipeline pass. Offspring are always newly constructed, never aliased
/// from parents.
#[derive(Debug, Clone)]
pub struct Program {
    expr: Arc<dyn Expression>,
    /// Free constants tuned by the optimizer.
    pub constants: Vec<f64>,
    /// Input-variable names referenced by the expression.
    pub features: Vec<String>,
    /// Per-objective scores, filled by fitness evaluation.
    pub fitness: FitnessVector,
    /// Non-domination level; 0 until ranking runs, 1 = first front.
    pub rank: usize,
    /// Diversity tie-break within a rank group.
    pub crowding_distance: f64,
    /// False once a required evaluation was numerically undefined.
    pub is_valid: bool,
    /// True when an earlier program in the same population has an identical
    /// fitness vector. Recomputed each generation.
    pub is_duplicate: bool,
    /// Objective-specific stopping predicate, set by fitness evaluation.
    pub converged: bool,
    compiled: OnceLock<Option<Arc<CompiledProgram>>>,
}

impl Program {
    pub fn new(expr: Arc<dyn Expression>, constants: Vec<f64>, features: Vec<String>) -> Self {
        Self {
            expr,
            constants,
            features,
            fitness: FitnessVector::default(),
            rank: 0,
            crowding_distance: 0.0,
            is_valid: true,
            is_duplicate: false,
            converged: false,
            compiled: OnceLock::new(),
        }
    }

    pub fn expression(&self) -> Arc<dyn Expression> {
        Arc::clone(&self.expr)
    }

    pub fn complexity(&self) -> usize {
        self.expr.complexity()
    }

    pub fn render(&self) -> String {
        self.expr.render()
    }

    /// The compiled expression and gradient, memoized per expression
    /// identity. `None` when symbolic compilation fails; callers treat that
    /// as "nothing to optimize" rather than an error.
    pub fn compiled(&self) -> Option<Arc<CompiledProgram>> {
        self.compiled
            .get_or_init(|| {
                CompiledProgram::compile(&*self.expr, self.constants.len())
                    .ok()
                    .map(Arc::new)
            })
            .clone()
    }

    /// Evaluate the program over every dataset row.
    pub fn predict(&self, data: &Dataset) -> Result<Vec<f64>, ExprError> {
        let compiled = self
            .compiled()
            .ok_or_else(|| ExprError::Compile(self.expr.render()))?;
        let matrix = data.matrix(&self.features)?;
        Ok((0..matrix.n_rows())
            .map(|row| compiled.value.eval(matrix.row(row), &self.constants))
            .collect())
    }

    /// Snapshot for checkpoint serialization.
    pub fn to_state(&self) -> Result<ProgramState, ExprError> {
        Ok(ProgramState {
            expression: self.expr.to_value()?,
            constants: self.constants.clone(),
            features: self.features.clone(),
            fitness: self.fitness.clone(),
            rank: self.rank,
            crowding_distance: self.crowding_distance,
            is_valid: self.is_valid,
            is_duplicate: self.is_duplicate,
            converged: self.converged,
        })
    }

    /// Rebuild a program from a snapshot and the restored expression.
    pub fn from_state(state: ProgramState, expr: Arc<dyn Expression>) -> Self {
        Self {
            expr,
            constants: state.constants,
            features: state.features,
            fitness: state.fitness,
            rank: state.rank,
            crowding_distance: state.crowding_distance,
            is_valid: state.is_valid,
            is_duplicate: state.is_duplicate,
            converged: state.converged,
            compiled: OnceLock::new(),
        }
    }
}

/// Serializable form of a [`Program`]; the expression round-trips through
/// `Expression::to_value` / `ProgramFactory::restore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramState {
    pub expression: serde_json::Value,
    pub constants: Vec<f64>,
    pub features: Vec<String>,
    pub fitness: FitnessVector,
    pub rank: usize,
    #[serde(with = "total_f64")]
    pub crowding_distance: f64,
    pub is_valid: bool,
    pub is_duplicate: bool,
    pub converged: bool,
}
