//! Built-in fitness metrics for regression targets and shape constraints.
//!
//! Accuracy metrics run the constant optimizer before scoring when they carry
//! an [`OptimizerSpec`]; constraint metrics score the violation magnitude
//! directly. Anything numerically undefined becomes `+inf` so comparisons in
//! ranking never see an unusable value.

use crate::engine::fitness::{logistic_copy, optimize_constants};
use crate::schema::{Dataset, FitnessMetric, OptimizerSpec, Program};

/// How a regression metric reduces residuals to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Weighted mean squared error.
    SquaredError,
    /// Weighted mean absolute error.
    AbsoluteError,
    /// Weighted root-mean-squared error normalized by the weighted mean
    /// target, as a percentage.
    RelativeRootSquaredError,
}

/// Accuracy metric against one target column.
#[derive(Debug, Clone)]
pub struct RegressionMetric {
    name: String,
    target: String,
    reduction: Reduction,
    weights: Option<String>,
    bins: usize,
    logistic: bool,
    optimization: Option<OptimizerSpec>,
    convergence_threshold: Option<f64>,
    hv_reference: Option<f64>,
}

impl RegressionMetric {
    pub fn wmse(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Reduction::SquaredError)
    }

    pub fn wmae(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Reduction::AbsoluteError)
    }

    pub fn wrrmse(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Reduction::RelativeRootSquaredError)
    }

    fn new(name: impl Into<String>, target: impl Into<String>, reduction: Reduction) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            reduction,
            weights: None,
            bins: 10,
            logistic: false,
            optimization: None,
            convergence_threshold: None,
            hv_reference: None,
        }
    }

    /// Weight column name. Derived from the target (inverse bin frequency)
    /// during `prepare` when the column does not exist yet.
    pub fn with_weights(mut self, column: impl Into<String>) -> Self {
        self.weights = Some(column.into());
        self
    }

    pub fn with_bins(mut self, bins: usize) -> Self {
        self.bins = bins.max(1);
        self
    }

    /// Score the logistic-wrapped form of the program (classification).
    pub fn with_logistic(mut self) -> Self {
        self.logistic = true;
        self
    }

    pub fn with_optimization(mut self, spec: OptimizerSpec) -> Self {
        self.optimization = Some(spec);
        self
    }

    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = Some(threshold);
        self
    }

    pub fn with_hv_reference(mut self, reference: f64) -> Self {
        self.hv_reference = Some(reference);
        self
    }

    fn weight_column<'a>(&self, data: &'a Dataset) -> Option<&'a [f64]> {
        self.weights.as_deref().and_then(|name| data.column(name))
    }
}

impl FitnessMetric for RegressionMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn hv_reference(&self) -> Option<f64> {
        self.hv_reference
    }

    fn convergence_threshold(&self) -> Option<f64> {
        self.convergence_threshold
    }

    fn prepare(&self, data: &mut Dataset) {
        if let Some(name) = &self.weights
            && !data.has_column(name)
            && let Some(target) = data.column(&self.target)
        {
            let derived = regression_weights(target, self.bins);
            // Length always matches: the weights are derived per target row.
            let _ = data.insert_column(name.clone(), derived);
        }
    }

    fn evaluate(&self, program: &mut Program, data: &Dataset) -> f64 {
        if let Some(spec) = &self.optimization {
            optimize_constants(program, data, &self.target, self.weights.as_deref(), spec);
        }

        let predictions = if self.logistic {
            logistic_copy(program).predict(data)
        } else {
            program.predict(data)
        };
        let Ok(predictions) = predictions else {
            return f64::INFINITY;
        };
        let Some(target) = data.column(&self.target) else {
            return f64::INFINITY;
        };
        let weights = self.weight_column(data);
        let weight_at = |row: usize| weights.map_or(1.0, |w| w[row]);

        let n = predictions.len() as f64;
        match self.reduction {
            Reduction::SquaredError => {
                predictions
                    .iter()
                    .zip(target)
                    .enumerate()
                    .map(|(row, (p, y))| weight_at(row) * (p - y) * (p - y))
                    .sum::<f64>()
                    / n
            }
            Reduction::AbsoluteError => {
                predictions
                    .iter()
                    .zip(target)
                    .enumerate()
                    .map(|(row, (p, y))| weight_at(row) * (p - y).abs())
                    .sum::<f64>()
                    / n
            }
            Reduction::RelativeRootSquaredError => {
                let target_mean = 1e-20
                    + target
                        .iter()
                        .enumerate()
                        .map(|(row, y)| y * weight_at(row))
                        .sum::<f64>()
                        / n;
                let mse = predictions
                    .iter()
                    .zip(target)
                    .enumerate()
                    .map(|(row, (p, y))| weight_at(row) * (p - y) * (p - y))
                    .sum::<f64>()
                    / n;
                mse.sqrt() * 100.0 / target_mean
            }
        }
    }
}

/// Constraint: predictions must not be (near-)constant.
///
/// Violation is `max(0, epsilon - std(predictions))`, 0 when satisfied.
#[derive(Debug, Clone)]
pub struct NotConstant {
    name: String,
    pub epsilon: f64,
}

impl NotConstant {
    pub fn new(name: impl Into<String>, epsilon: f64) -> Self {
        Self {
            name: name.into(),
            epsilon,
        }
    }
}

impl FitnessMetric for NotConstant {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, program: &mut Program, data: &Dataset) -> f64 {
        let Ok(predictions) = program.predict(data) else {
            return self.epsilon;
        };
        (self.epsilon - std_dev(&predictions)).max(0.0)
    }
}

/// Constraint: predictions must stay inside `[lower, upper]`.
///
/// Violation is the mean overshoot above the upper bound plus the mean
/// undershoot below the lower bound.
#[derive(Debug, Clone)]
pub struct ValueRange {
    name: String,
    pub lower: f64,
    pub upper: f64,
}

impl ValueRange {
    pub fn new(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
        }
    }
}

impl FitnessMetric for ValueRange {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, program: &mut Program, data: &Dataset) -> f64 {
        let Ok(predictions) = program.predict(data) else {
            return f64::INFINITY;
        };
        if predictions.is_empty() {
            return 0.0;
        }
        let n = predictions.len() as f64;
        let upper = predictions
            .iter()
            .map(|p| (p - self.upper).max(0.0))
            .sum::<f64>()
            / n;
        let lower = predictions
            .iter()
            .map(|p| (self.lower - p).max(0.0))
            .sum::<f64>()
            / n;
        upper + lower
    }
}

/// Inverse bin-frequency weights: rows whose target falls in a rare bin get
/// proportionally more weight.
pub(crate) fn regression_weights(target: &[f64], bins: usize) -> Vec<f64> {
    let bins = bins.max(1);
    let min = target.iter().copied().fold(f64::INFINITY, f64::min);
    let max = target.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return vec![1.0; target.len()];
    }

    let width = (max - min) / bins as f64;
    let bin_of = |y: f64| (((y - min) / width) as usize).min(bins - 1);

    let mut counts = vec![0usize; bins];
    for y in target {
        counts[bin_of(*y)] += 1;
    }

    let total = target.len() as f64;
    target
        .iter()
        .map(|y| total / (bins as f64 * counts[bin_of(*y)] as f64))
        .collect()
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    variance.sqrt()
}
