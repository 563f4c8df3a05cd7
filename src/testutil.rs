//! Shared test doubles: a minimal affine expression, degenerate expressions,
//! and a fixed-value metric.

use std::sync::Arc;

use crate::schema::{Dataset, Evaluator, ExprError, Expression, FitnessMetric, Program};

/// `c0 + c1*x0 + c2*x1 + ...` over the given number of features.
#[derive(Debug, Clone)]
pub struct AffineExpr {
    pub n_features: usize,
}

struct AffineValue {
    n_features: usize,
}

struct AffineGradient {
    index: usize,
}

impl Evaluator for AffineValue {
    fn eval(&self, row: &[f64], constants: &[f64]) -> f64 {
        let mut acc = constants.first().copied().unwrap_or(0.0);
        for i in 0..self.n_features {
            acc += constants.get(i + 1).copied().unwrap_or(0.0) * row[i];
        }
        acc
    }
}

impl Evaluator for AffineGradient {
    fn eval(&self, row: &[f64], _constants: &[f64]) -> f64 {
        if self.index == 0 {
            1.0
        } else {
            row.get(self.index - 1).copied().unwrap_or(0.0)
        }
    }
}

impl Expression for AffineExpr {
    fn evaluator(&self) -> Result<Arc<dyn Evaluator>, ExprError> {
        Ok(Arc::new(AffineValue {
            n_features: self.n_features,
        }))
    }

    fn gradient(&self, constant: usize) -> Result<Arc<dyn Evaluator>, ExprError> {
        Ok(Arc::new(AffineGradient { index: constant }))
    }

    fn complexity(&self) -> usize {
        1 + 2 * self.n_features
    }

    fn render(&self) -> String {
        format!("affine[{}]", self.n_features)
    }

    fn to_value(&self) -> Result<serde_json::Value, ExprError> {
        Ok(serde_json::json!({ "affine": self.n_features }))
    }
}

/// Expression that evaluates to NaN everywhere (drives the optimizer's
/// divergence-recovery path).
#[derive(Debug)]
pub struct NanExpr;

struct NanValue;
struct UnitGradient;

impl Evaluator for NanValue {
    fn eval(&self, _row: &[f64], _constants: &[f64]) -> f64 {
        f64::NAN
    }
}

impl Evaluator for UnitGradient {
    fn eval(&self, _row: &[f64], _constants: &[f64]) -> f64 {
        1.0
    }
}

impl Expression for NanExpr {
    fn evaluator(&self) -> Result<Arc<dyn Evaluator>, ExprError> {
        Ok(Arc::new(NanValue))
    }

    fn gradient(&self, _constant: usize) -> Result<Arc<dyn Evaluator>, ExprError> {
        Ok(Arc::new(UnitGradient))
    }

    fn complexity(&self) -> usize {
        1
    }

    fn render(&self) -> String {
        "nan".to_string()
    }

    fn to_value(&self) -> Result<serde_json::Value, ExprError> {
        Ok(serde_json::json!("nan"))
    }
}

/// Expression whose compilation fails.
#[derive(Debug)]
pub struct BrokenExpr;

impl Expression for BrokenExpr {
    fn evaluator(&self) -> Result<Arc<dyn Evaluator>, ExprError> {
        Err(ExprError::Compile("broken".to_string()))
    }

    fn gradient(&self, constant: usize) -> Result<Arc<dyn Evaluator>, ExprError> {
        Err(ExprError::NotDifferentiable(constant))
    }

    fn complexity(&self) -> usize {
        1
    }

    fn render(&self) -> String {
        "broken".to_string()
    }

    fn to_value(&self) -> Result<serde_json::Value, ExprError> {
        Ok(serde_json::json!("broken"))
    }
}

pub fn affine_program(constants: Vec<f64>, features: Vec<String>) -> Program {
    let n_features = features.len();
    Program::new(Arc::new(AffineExpr { n_features }), constants, features)
}

pub fn nan_program(constants: Vec<f64>) -> Program {
    Program::new(Arc::new(NanExpr), constants, vec![])
}

pub fn broken_program(constants: Vec<f64>) -> Program {
    Program::new(Arc::new(BrokenExpr), constants, vec![])
}

/// Metric that always scores the same value.
pub struct ConstantMetric {
    name: String,
    value: f64,
    hv_reference: Option<f64>,
    convergence_threshold: Option<f64>,
}

impl ConstantMetric {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            hv_reference: None,
            convergence_threshold: None,
        }
    }

    pub fn with_hv_reference(mut self, reference: f64) -> Self {
        self.hv_reference = Some(reference);
        self
    }

    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = Some(threshold);
        self
    }
}

impl FitnessMetric for ConstantMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn hv_reference(&self) -> Option<f64> {
        self.hv_reference
    }

    fn convergence_threshold(&self) -> Option<f64> {
        self.convergence_threshold
    }

    fn evaluate(&self, _program: &mut Program, _data: &Dataset) -> f64 {
        self.value
    }
}
