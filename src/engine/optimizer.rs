//! Gradient-based constant optimization with analytic derivatives.
//!
//! Three engines share one batch loop: plain SGD, ADAM, and a blended
//! two-target ADAM variant that fits two label columns simultaneously. All of
//! them walk contiguous, deterministic batches (no shuffling) and use
//! NaN-ignoring means so single undefined rows do not poison a batch.
//!
//! Degenerate inputs (invalid program, no free constants, an expression that
//! will not compile, zero batches) are not errors: the optimizer returns the
//! empty [`OptimizerResult`], meaning "nothing to optimize".

use std::ops::Range;
use std::sync::Arc;

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::schema::{
    CompiledProgram, Dataset, FeatureMatrix, OptimizerConfig, Program, Task,
};

const DIV_EPSILON: f64 = 1e-20;

/// Outcome of one optimizer invocation.
///
/// Empty `constants` means the call was a no-op. Histories hold one entry per
/// epoch: the constants after the epoch and the final batch's average loss.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerResult {
    pub constants: Vec<f64>,
    pub loss_history: Vec<f64>,
    pub constants_history: Vec<Vec<f64>>,
}

impl OptimizerResult {
    pub fn is_no_op(&self) -> bool {
        self.constants.is_empty()
    }
}

/// Plain stochastic gradient descent with the elastic-net-fused step.
pub fn sgd(
    program: &Program,
    data: &Dataset,
    target: &str,
    weights: Option<&str>,
    config: &OptimizerConfig,
    task: Task,
    rng: &mut StdRng,
) -> OptimizerResult {
    run_single_target(program, data, target, weights, config, task, Engine::Sgd, rng)
}

/// ADAM with bias-corrected moments and the same elastic-net-fused step.
pub fn adam(
    program: &Program,
    data: &Dataset,
    target: &str,
    weights: Option<&str>,
    config: &OptimizerConfig,
    task: Task,
    rng: &mut StdRng,
) -> OptimizerResult {
    let engine = Engine::adam(program.constants.len());
    run_single_target(program, data, target, weights, config, task, engine, rng)
}

/// Blended two-target ADAM.
///
/// Each batch draws one mixing coefficient `lambda ~ U[0, 1]` and minimizes
/// the convex combination of the two targets' weighted squared errors. Only
/// the `regression:wmse` task is wired; other tasks return the no-op result.
pub fn adam_two_fold(
    program: &Program,
    data: &Dataset,
    targets: (&str, &str),
    weights: (Option<&str>, Option<&str>),
    config: &OptimizerConfig,
    task: Task,
    rng: &mut StdRng,
) -> OptimizerResult {
    if task != Task::RegressionWmse {
        return OptimizerResult::default();
    }
    let Some(prepared) = Prepared::build(program, data, targets.0, weights.0, config.batch_size)
    else {
        return OptimizerResult::default();
    };
    let Some((secondary_targets, secondary_weights)) =
        fetch_target(data, targets.1, weights.1)
    else {
        return OptimizerResult::default();
    };

    let mut engine = Engine::adam(program.constants.len());
    let mut constants = program.constants.clone();
    let mut spread = 0.0;
    let mut result = OptimizerResult::default();

    for _ in 0..config.epochs {
        let mut epoch_loss = f64::NAN;
        for batch in &prepared.batches {
            let lambda: f64 = rng.gen_range(0.0..=1.0);
            let eval = prepared.eval_blended(
                &constants,
                batch,
                lambda,
                &secondary_targets,
                &secondary_weights,
            );
            epoch_loss = eval.loss;
            if eval.loss.is_nan() {
                spread += 0.2;
                resample_constants(&mut constants, spread, rng);
                continue;
            }
            let grad = clip_gradient(eval.grad, config.gradient_clip);
            engine.apply(&mut constants, &grad, config);
        }
        result.constants_history.push(constants.clone());
        result.loss_history.push(epoch_loss);
    }

    result.constants = constants;
    result
}

fn run_single_target(
    program: &Program,
    data: &Dataset,
    target: &str,
    weights: Option<&str>,
    config: &OptimizerConfig,
    task: Task,
    mut engine: Engine,
    rng: &mut StdRng,
) -> OptimizerResult {
    let Some(prepared) = Prepared::build(program, data, target, weights, config.batch_size)
    else {
        return OptimizerResult::default();
    };

    let mut constants = program.constants.clone();
    let mut spread = 0.0;
    let mut result = OptimizerResult::default();

    for _ in 0..config.epochs {
        let mut epoch_loss = f64::NAN;
        for batch in &prepared.batches {
            let eval = prepared.eval_batch(&constants, batch, task);
            epoch_loss = eval.loss;
            if eval.loss.is_nan() {
                // Diverged: widen the exploration radius and re-draw the
                // constants; the corrupted gradient is never applied.
                spread += 0.2;
                resample_constants(&mut constants, spread, rng);
                continue;
            }
            let grad = clip_gradient(eval.grad, config.gradient_clip);
            engine.apply(&mut constants, &grad, config);
        }
        result.constants_history.push(constants.clone());
        result.loss_history.push(epoch_loss);
    }

    result.constants = constants;
    result
}

/// Update rule state for the single-target loop.
enum Engine {
    Sgd,
    Adam { m: Vec<f64>, v: Vec<f64>, t: i32 },
}

impl Engine {
    fn adam(n_constants: usize) -> Self {
        Engine::Adam {
            m: vec![0.0; n_constants],
            v: vec![0.0; n_constants],
            t: 1,
        }
    }

    fn apply(&mut self, constants: &mut [f64], grad: &[f64], config: &OptimizerConfig) {
        match self {
            Engine::Sgd => {
                for (c, g) in constants.iter_mut().zip(grad) {
                    *c -= config.learning_rate * g
                        + 2.0 * config.learning_rate * config.l2_param * *c
                        + config.learning_rate * config.l1_param * sign(*c);
                }
            }
            Engine::Adam { m, v, t } => {
                let bias_1 = 1.0 - config.beta_1.powi(*t);
                let bias_2 = 1.0 - config.beta_2.powi(*t);
                for (i, (c, g)) in constants.iter_mut().zip(grad).enumerate() {
                    m[i] = config.beta_1 * m[i] + (1.0 - config.beta_1) * g;
                    v[i] = config.beta_2 * v[i] + (1.0 - config.beta_2) * g * g;
                    let m_hat = m[i] / bias_1;
                    let v_hat = v[i] / bias_2;
                    *c -= config.learning_rate * m_hat / (v_hat.sqrt() + config.epsilon)
                        + 2.0 * config.learning_rate * config.l2_param * *c
                        + config.learning_rate * config.l1_param * sign(*c);
                }
                *t += 1;
            }
        }
    }
}

/// Compiled program plus batched dataset views for one optimizer run.
struct Prepared {
    compiled: Arc<CompiledProgram>,
    matrix: FeatureMatrix,
    targets: Vec<f64>,
    weights: Vec<f64>,
    batches: Vec<Range<usize>>,
}

struct BatchEval {
    loss: f64,
    grad: Vec<f64>,
}

impl Prepared {
    /// Returns `None` for every "nothing to optimize" case: invalid program,
    /// no free constants, compilation failure, missing columns, or fewer
    /// rows than one batch.
    fn build(
        program: &Program,
        data: &Dataset,
        target: &str,
        weights: Option<&str>,
        batch_size: usize,
    ) -> Option<Self> {
        if !program.is_valid || program.constants.is_empty() {
            return None;
        }
        let compiled = program.compiled()?;
        let matrix = data.matrix(&program.features).ok()?;
        let (targets, weights) = fetch_target(data, target, weights)?;

        let n_batches = data.n_rows() / batch_size.max(1);
        if n_batches == 0 {
            return None;
        }
        Some(Self {
            compiled,
            matrix,
            targets,
            weights,
            batches: split_ranges(data.n_rows(), n_batches),
        })
    }

    fn eval_batch(&self, constants: &[f64], batch: &Range<usize>, task: Task) -> BatchEval {
        let rows = batch.clone();
        let preds: Vec<f64> = rows
            .clone()
            .map(|row| self.compiled.value.eval(self.matrix.row(row), constants))
            .collect();

        let n_constants = self.compiled.gradients.len();
        let mut grad = Vec::with_capacity(n_constants);
        let loss;

        match task {
            Task::RegressionWmse => {
                loss = nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
                    let residual = pred - self.targets[row];
                    self.weights[row] * residual * residual
                }));
                for j in 0..n_constants {
                    grad.push(nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
                        let g = self.compiled.gradients[j].eval(self.matrix.row(row), constants);
                        2.0 * self.weights[row] * (pred - self.targets[row]) * g
                    })));
                }
            }
            Task::RegressionWrrmse => {
                let target_mean = mean(
                    rows.clone()
                        .map(|row| self.targets[row] * self.weights[row]),
                ) + DIV_EPSILON;
                let sq_term = nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
                    let residual = pred - self.targets[row];
                    self.weights[row] * residual * residual
                }))
                .sqrt();
                loss = sq_term * 100.0 / target_mean;
                // At a perfect fit the normalized gradient is 0/0; no step is
                // needed there, so report a zero gradient instead.
                let factor = if sq_term > 0.0 {
                    100.0 / (target_mean * sq_term)
                } else {
                    0.0
                };
                for j in 0..n_constants {
                    grad.push(
                        factor
                            * nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
                                let g = self.compiled.gradients[j]
                                    .eval(self.matrix.row(row), constants);
                                self.weights[row] * (pred - self.targets[row]) * g
                            })),
                    );
                }
            }
            Task::BinaryLogistic => {
                loss = nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
                    let s = sigmoid(*pred);
                    let y = self.targets[row];
                    -self.weights[row]
                        * (y * (s + DIV_EPSILON).ln() + (1.0 - y) * (1.0 - s + DIV_EPSILON).ln())
                }));
                for j in 0..n_constants {
                    grad.push(nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
                        let g = self.compiled.gradients[j].eval(self.matrix.row(row), constants);
                        self.weights[row] * (sigmoid(*pred) - self.targets[row]) * g
                    })));
                }
            }
        }

        BatchEval { loss, grad }
    }

    fn eval_blended(
        &self,
        constants: &[f64],
        batch: &Range<usize>,
        lambda: f64,
        secondary_targets: &[f64],
        secondary_weights: &[f64],
    ) -> BatchEval {
        let rows = batch.clone();
        let preds: Vec<f64> = rows
            .clone()
            .map(|row| self.compiled.value.eval(self.matrix.row(row), constants))
            .collect();

        let loss = nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
            let d1 = pred - self.targets[row];
            let d2 = pred - secondary_targets[row];
            lambda * self.weights[row] * d1 * d1
                + (1.0 - lambda) * secondary_weights[row] * d2 * d2
        }));

        let n_constants = self.compiled.gradients.len();
        let mut grad = Vec::with_capacity(n_constants);
        for j in 0..n_constants {
            grad.push(nan_mean(rows.clone().zip(&preds).map(|(row, pred)| {
                let g = self.compiled.gradients[j].eval(self.matrix.row(row), constants);
                let d1 = pred - self.targets[row];
                let d2 = pred - secondary_targets[row];
                2.0 * (lambda * self.weights[row] * d1
                    + (1.0 - lambda) * secondary_weights[row] * d2)
                    * g
            })));
        }

        BatchEval { loss, grad }
    }
}

fn fetch_target(
    data: &Dataset,
    target: &str,
    weights: Option<&str>,
) -> Option<(Vec<f64>, Vec<f64>)> {
    let targets = data.column(target)?.to_vec();
    let weights = match weights {
        Some(name) => data.column(name)?.to_vec(),
        None => vec![1.0; data.n_rows()],
    };
    Some((targets, weights))
}

/// Contiguous near-equal row ranges; the leading ranges absorb the remainder.
fn split_ranges(n_rows: usize, n_batches: usize) -> Vec<Range<usize>> {
    let base = n_rows / n_batches;
    let extra = n_rows % n_batches;
    let mut batches = Vec::with_capacity(n_batches);
    let mut start = 0;
    for i in 0..n_batches {
        let len = base + usize::from(i < extra);
        batches.push(start..start + len);
        start += len;
    }
    batches
}

pub(crate) fn clip_gradient(mut grad: Vec<f64>, enabled: bool) -> Vec<f64> {
    if enabled {
        let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if norm > 1.0 {
            for g in &mut grad {
                *g /= norm + DIV_EPSILON;
            }
        }
    }
    grad
}

fn resample_constants(constants: &mut [f64], spread: f64, rng: &mut StdRng) {
    if let Ok(normal) = Normal::new(0.0, spread) {
        for c in constants.iter_mut() {
            *c = normal.sample(rng);
        }
    }
}

fn nan_mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        if !value.is_nan() {
            sum += value;
            count += 1;
        }
    }
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// `np.sign` semantics: zero stays zero.
fn sign(x: f64) -> f64 {
    if x == 0.0 { 0.0 } else { x.signum() }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::testutil::{affine_program, broken_program, nan_program};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn constant_dataset(target: f64, rows: usize) -> Dataset {
        Dataset::from_columns([("y".to_string(), vec![target; rows])]).unwrap()
    }

    fn config(batch_size: usize, epochs: usize) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: 0.1,
            batch_size,
            epochs,
            gradient_clip: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_constants_is_no_op() {
        let program = affine_program(vec![], vec![]);
        let data = constant_dataset(1.0, 4);
        let result = sgd(
            &program,
            &data,
            "y",
            None,
            &config(4, 3),
            Task::RegressionWmse,
            &mut rng(),
        );
        assert!(result.is_no_op());
    }

    #[test]
    fn test_invalid_program_is_no_op() {
        let mut program = affine_program(vec![1.0], vec![]);
        program.is_valid = false;
        let data = constant_dataset(1.0, 4);
        let result = adam(
            &program,
            &data,
            "y",
            None,
            &config(4, 3),
            Task::RegressionWmse,
            &mut rng(),
        );
        assert!(result.is_no_op());
    }

    #[test]
    fn test_uncompilable_expression_is_no_op() {
        let program = broken_program(vec![1.0]);
        let data = constant_dataset(1.0, 4);
        let result = sgd(
            &program,
            &data,
            "y",
            None,
            &config(4, 3),
            Task::RegressionWmse,
            &mut rng(),
        );
        assert!(result.is_no_op());
    }

    #[test]
    fn test_zero_epochs_returns_constants_unchanged() {
        let program = affine_program(vec![2.5], vec![]);
        let data = constant_dataset(1.0, 4);
        let result = sgd(
            &program,
            &data,
            "y",
            None,
            &config(4, 0),
            Task::RegressionWmse,
            &mut rng(),
        );
        assert_eq!(result.constants, vec![2.5]);
        assert!(result.loss_history.is_empty());
        assert!(result.constants_history.is_empty());
    }

    #[test]
    fn test_zero_gradient_leaves_constants_unchanged() {
        // Prediction already matches the target everywhere: gradient is
        // exactly zero in the single-batch case.
        let program = affine_program(vec![2.0], vec![]);
        let data = constant_dataset(2.0, 8);
        let result = sgd(
            &program,
            &data,
            "y",
            None,
            &config(8, 5),
            Task::RegressionWmse,
            &mut rng(),
        );
        assert_eq!(result.constants, vec![2.0]);
        assert!(result.loss_history.iter().all(|l| *l == 0.0));
    }

    #[test]
    fn test_sgd_reduces_wmse_loss() {
        let program = affine_program(vec![0.0], vec![]);
        let data = constant_dataset(1.0, 16);
        let result = sgd(
            &program,
            &data,
            "y",
            None,
            &config(4, 20),
            Task::RegressionWmse,
            &mut rng(),
        );
        assert!(result.loss_history.last().unwrap() < result.loss_history.first().unwrap());
        assert!((result.constants[0] - 1.0).abs() < 0.2);
    }

    #[test]
    fn test_adam_with_zero_betas_matches_sgd_at_unit_gradient() {
        // pred - y = 0.5 everywhere, so the wmse gradient is exactly 1.0 and
        // the ADAM denominator sqrt(g^2) + eps collapses to ~1.
        let program = affine_program(vec![1.5], vec![]);
        let data = constant_dataset(1.0, 4);
        let cfg = OptimizerConfig {
            learning_rate: 0.05,
            batch_size: 4,
            epochs: 1,
            gradient_clip: true,
            beta_1: 0.0,
            beta_2: 0.0,
            ..Default::default()
        };

        let from_sgd = sgd(
            &program,
            &data,
            "y",
            None,
            &cfg,
            Task::RegressionWmse,
            &mut rng(),
        );
        let from_adam = adam(
            &program,
            &data,
            "y",
            None,
            &cfg,
            Task::RegressionWmse,
            &mut rng(),
        );
        assert!((from_sgd.constants[0] - from_adam.constants[0]).abs() < 1e-6);
    }

    #[test]
    fn test_nan_loss_recovery_never_emits_nan_constants() {
        let program = nan_program(vec![1.0, -2.0]);
        let data = constant_dataset(1.0, 8);
        let result = adam(
            &program,
            &data,
            "y",
            None,
            &config(4, 5),
            Task::RegressionWmse,
            &mut rng(),
        );
        assert_eq!(result.constants.len(), 2);
        assert!(result.constants.iter().all(|c| !c.is_nan()));
        assert!(result.loss_history.iter().all(|l| l.is_nan()));
    }

    #[test]
    fn test_gradient_clip_rescales_to_unit_norm() {
        let clipped = clip_gradient(vec![3.0, 4.0], true);
        let norm = clipped.iter().map(|g| g * g).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);

        let unclipped = clip_gradient(vec![3.0, 4.0], false);
        assert_eq!(unclipped, vec![3.0, 4.0]);

        let small = clip_gradient(vec![0.3, 0.4], true);
        assert_eq!(small, vec![0.3, 0.4]);
    }

    #[test]
    fn test_logistic_task_pushes_prediction_toward_label() {
        // All labels 1: cross-entropy pushes the raw prediction upward.
        let program = affine_program(vec![0.0], vec![]);
        let data = constant_dataset(1.0, 8);
        let result = adam(
            &program,
            &data,
            "y",
            None,
            &config(8, 30),
            Task::BinaryLogistic,
            &mut rng(),
        );
        assert!(result.constants[0] > 0.5);
    }

    #[test]
    fn test_wrrmse_perfect_fit_has_zero_gradient() {
        let program = affine_program(vec![3.0], vec![]);
        let data = constant_dataset(3.0, 8);
        let result = sgd(
            &program,
            &data,
            "y",
            None,
            &config(8, 3),
            Task::RegressionWrrmse,
            &mut rng(),
        );
        assert_eq!(result.constants, vec![3.0]);
    }

    #[test]
    fn test_two_fold_converges_between_targets() {
        let data = Dataset::from_columns([
            ("y1".to_string(), vec![1.0; 16]),
            ("y2".to_string(), vec![3.0; 16]),
        ])
        .unwrap();
        let program = affine_program(vec![0.0], vec![]);
        let cfg = OptimizerConfig {
            learning_rate: 0.1,
            batch_size: 4,
            epochs: 60,
            ..Default::default()
        };
        let result = adam_two_fold(
            &program,
            &data,
            ("y1", "y2"),
            (None, None),
            &cfg,
            Task::RegressionWmse,
            &mut rng(),
        );
        // The blended optimum lies inside the interval spanned by the targets.
        assert!(result.constants[0] > 0.5 && result.constants[0] < 3.5);
    }

    #[test]
    fn test_two_fold_rejects_unsupported_task() {
        let data = constant_dataset(1.0, 8);
        let program = affine_program(vec![0.0], vec![]);
        let result = adam_two_fold(
            &program,
            &data,
            ("y", "y"),
            (None, None),
            &config(4, 5),
            Task::BinaryLogistic,
            &mut rng(),
        );
        assert!(result.is_no_op());
    }

    #[test]
    fn test_split_ranges_are_contiguous() {
        let ranges = split_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(split_ranges(8, 4), vec![0..2, 2..4, 4..6, 6..8]);
    }
}
