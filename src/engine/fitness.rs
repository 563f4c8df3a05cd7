//! Fitness evaluation: constant tuning, optional logistic transform,
//! per-objective scoring.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::engine::optimizer::{self, sigmoid};
use crate::schema::{
    Dataset, Evaluator, ExprError, Expression, FitnessMetric, Objective, OptimizerSpec,
    OptimizerVariant, Program,
};

/// Score a program against every metric, filling its fitness vector.
///
/// Metrics may tune the program's constants in place (the constant optimizer
/// runs inside `FitnessMetric::evaluate`). A program whose expression cannot
/// be compiled, or that scores NaN on any metric, is marked invalid; it then
/// never reaches selection. The converged flag is set when every metric that
/// declares a convergence threshold is satisfied.
pub fn evaluate_program(
    program: &mut Program,
    data: &Dataset,
    metrics: &[Arc<dyn FitnessMetric>],
) {
    program.fitness.clear();
    if program.compiled().is_none() {
        program.is_valid = false;
    }

    let mut has_threshold = false;
    let mut all_converged = true;
    for metric in metrics {
        let value = metric.evaluate(program, data);
        if value.is_nan() {
            program.is_valid = false;
        }
        if let Some(threshold) = metric.convergence_threshold() {
            has_threshold = true;
            let satisfied = if metric.minimize() {
                value <= threshold
            } else {
                value >= threshold
            };
            all_converged &= satisfied;
        }
        program.fitness.push(Objective {
            name: metric.name().to_string(),
            value,
            minimize: metric.minimize(),
            hv_reference: metric.hv_reference(),
        });
    }
    program.converged = has_threshold && all_converged;
}

/// Run the configured constant-optimizer variant for a metric, writing the
/// tuned constants back into the program.
///
/// Guards the optimizer's `batch_count >= 1` precondition by clamping the
/// batch size to the dataset row count.
pub fn optimize_constants(
    program: &mut Program,
    data: &Dataset,
    target: &str,
    weights: Option<&str>,
    spec: &OptimizerSpec,
) {
    let mut config = spec.config.clone();
    config.batch_size = config.batch_size.clamp(1, data.n_rows().max(1));
    let mut rng = StdRng::from_entropy();

    let result = match spec.variant {
        OptimizerVariant::Sgd => {
            optimizer::sgd(program, data, target, weights, &config, spec.task, &mut rng)
        }
        OptimizerVariant::Adam => {
            optimizer::adam(program, data, target, weights, &config, spec.task, &mut rng)
        }
        OptimizerVariant::AdamTwoFold => match &spec.secondary_target {
            Some(secondary) => optimizer::adam_two_fold(
                program,
                data,
                (target, secondary.as_str()),
                (weights, spec.secondary_weights.as_deref()),
                &config,
                spec.task,
                &mut rng,
            ),
            // Without a second target the blended variant degenerates to ADAM.
            None => {
                optimizer::adam(program, data, target, weights, &config, spec.task, &mut rng)
            }
        },
    };

    if !result.is_no_op() {
        program.constants = result.constants;
    }
}

/// Logistic-wrapped copy of a program, used when a metric is configured for
/// classification. The wrapper is transient: it is evaluated and dropped,
/// never stored in the population or a checkpoint.
pub fn logistic_copy(program: &Program) -> Program {
    let wrapped: Arc<dyn Expression> = Arc::new(LogisticExpr {
        inner: program.expression(),
    });
    let mut copy = Program::new(wrapped, program.constants.clone(), program.features.clone());
    copy.is_valid = program.is_valid;
    copy
}

#[derive(Debug)]
struct LogisticExpr {
    inner: Arc<dyn Expression>,
}

struct LogisticValue {
    inner: Arc<dyn Evaluator>,
}

struct LogisticGradient {
    value: Arc<dyn Evaluator>,
    gradient: Arc<dyn Evaluator>,
}

impl Evaluator for LogisticValue {
    fn eval(&self, row: &[f64], constants: &[f64]) -> f64 {
        sigmoid(self.inner.eval(row, constants))
    }
}

impl Evaluator for LogisticGradient {
    fn eval(&self, row: &[f64], constants: &[f64]) -> f64 {
        let s = sigmoid(self.value.eval(row, constants));
        s * (1.0 - s) * self.gradient.eval(row, constants)
    }
}

impl Expression for LogisticExpr {
    fn evaluator(&self) -> Result<Arc<dyn Evaluator>, ExprError> {
        Ok(Arc::new(LogisticValue {
            inner: self.inner.evaluator()?,
        }))
    }

    fn gradient(&self, constant: usize) -> Result<Arc<dyn Evaluator>, ExprError> {
        Ok(Arc::new(LogisticGradient {
            value: self.inner.evaluator()?,
            gradient: self.inner.gradient(constant)?,
        }))
    }

    fn complexity(&self) -> usize {
        self.inner.complexity() + 1
    }

    fn render(&self) -> String {
        format!("logistic({})", self.inner.render())
    }

    fn to_value(&self) -> Result<serde_json::Value, ExprError> {
        Ok(serde_json::json!({ "logistic": self.inner.to_value()? }))
    }
}
