//! Collaborator doubles for driving the engine end-to-end: a minimal affine
//! expression family plus deterministic factory and offspring generators.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use symreg::schema::{
    Dataset, Evaluator, ExprError, Expression, GenerationContext, OffspringContext,
    OffspringGenerator, Program, ProgramFactory,
};

/// `c0 + c1*x0 + ...` over the given number of features.
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

pub fn affine_program(constants: Vec<f64>, features: Vec<String>) -> Program {
    let n_features = features.len();
    Program::new(Arc::new(AffineExpr { n_features }), constants, features)
}

/// Simple regression fixture: y = 2x over eight points.
pub fn line_dataset() -> Dataset {
    let x: Vec<f64> = (0..8).map(|i| i as f64).collect();
    let y: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
    Dataset::from_columns([("x".to_string(), x), ("y".to_string(), y)]).unwrap()
}

/// Deterministic factory: the k-th generated program is `d + (2 + d)*x` with
/// `d = 0.1*(k+1)`, so every program has a distinct, non-zero squared error
/// against `y = 2x`.
#[derive(Default)]
pub struct StubFactory {
    counter: AtomicU64,
}

impl ProgramFactory for StubFactory {
    fn generate(&self, ctx: &GenerationContext<'_>) -> Program {
        let k = self.counter.fetch_add(1, Ordering::Relaxed) as f64;
        let d = 0.1 * (k + 1.0);
        affine_program(vec![d, 2.0 + d], ctx.features.to_vec())
    }

    fn restore(&self, value: &serde_json::Value) -> Result<Arc<dyn Expression>, ExprError> {
        let n_features = value
            .get("affine")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ExprError::Restore(value.to_string()))? as usize;
        Ok(Arc::new(AffineExpr { n_features }))
    }
}

/// Offspring generator cycling through a fixed table of constants.
pub struct FixedOffspring {
    counter: AtomicU64,
    table: Vec<(f64, f64)>,
    features: Vec<String>,
}

impl FixedOffspring {
    pub fn new(features: Vec<String>) -> Self {
        Self {
            counter: AtomicU64::new(0),
            // Includes the exact solution (0, 2) of y = 2x.
            table: vec![
                (0.0, 2.0),
                (0.5, 2.0),
                (1.0, 2.0),
                (0.0, 2.5),
                (0.0, 1.5),
                (0.25, 2.0),
                (0.75, 2.0),
                (0.0, 2.25),
                (0.0, 1.75),
                (0.5, 2.5),
                (1.5, 2.0),
                (0.0, 3.0),
            ],
            features,
        }
    }
}

impl OffspringGenerator for FixedOffspring {
    fn generate(&self, _ctx: &OffspringContext<'_>) -> Program {
        let k = self.counter.fetch_add(1, Ordering::Relaxed) as usize;
        let (c0, c1) = self.table[k % self.table.len()];
        affine_program(vec![c0, c1], self.features.clone())
    }
}

/// Raises the cancellation flag from inside offspring generation, simulating
/// an interrupt that lands mid-generation. The handle is armed after the
/// regressor (which owns the flag) has been constructed.
pub struct CancellingOffspring {
    counter: AtomicU64,
    cancel: std::sync::OnceLock<Arc<AtomicBool>>,
    features: Vec<String>,
}

impl CancellingOffspring {
    pub fn new(features: Vec<String>) -> Self {
        Self {
            counter: AtomicU64::new(0),
            cancel: std::sync::OnceLock::new(),
            features,
        }
    }

    pub fn arm(&self, handle: Arc<AtomicBool>) {
        let _ = self.cancel.set(handle);
    }
}

impl OffspringGenerator for CancellingOffspring {
    fn generate(&self, _ctx: &OffspringContext<'_>) -> Program {
        if let Some(cancel) = self.cancel.get() {
            cancel.store(true, Ordering::Relaxed);
        }
        let k = self.counter.fetch_add(1, Ordering::Relaxed) as f64;
        affine_program(vec![5.0 + k, 5.0], self.features.clone())
    }
}

/// Offspring generator that outlives any reasonable timeout.
pub struct SlowOffspring {
    pub delay: Duration,
    pub features: Vec<String>,
}

impl OffspringGenerator for SlowOffspring {
    fn generate(&self, _ctx: &OffspringContext<'_>) -> Program {
        std::thread::sleep(self.delay);
        affine_program(vec![1.0, 1.0], self.features.clone())
    }
}
