//! Run and optimizer configuration types.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a symbolic-regression run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressorConfig {
    /// Population survivor count per generation.
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Tournament size forwarded to the offspring generator.
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    /// Range from which new program constants are drawn.
    #[serde(default = "default_const_range")]
    pub const_range: (f64, f64),
    /// Probability of choosing an operation over a terminal during program
    /// generation.
    #[serde(default = "default_parsimony")]
    pub parsimony: f64,
    /// Multiplicative decay applied to parsimony with tree depth.
    #[serde(default = "default_parsimony_decay")]
    pub parsimony_decay: f64,
    /// Operator set forwarded to the program factory.
    #[serde(default)]
    pub operators: Vec<String>,
    /// Relative frequencies of the genetic operators, forwarded to the
    /// offspring generator.
    #[serde(default)]
    pub operator_frequencies: HashMap<String, f64>,
    /// Worker threads (0 = all available cores).
    #[serde(default)]
    pub parallelism: usize,
    /// Bound on each offspring result wait; exceeding it fails the
    /// generation step.
    #[serde(default = "default_offspring_timeout")]
    pub offspring_timeout_secs: u64,
    /// Periodic full-state snapshots, when configured.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    /// Random seed forwarded to collaborators for reproducible runs.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for RegressorConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            tournament_size: default_tournament_size(),
            const_range: default_const_range(),
            parsimony: default_parsimony(),
            parsimony_decay: default_parsimony_decay(),
            operators: Vec::new(),
            operator_frequencies: HashMap::new(),
            parallelism: 0,
            offspring_timeout_secs: default_offspring_timeout(),
            checkpoint: None,
            random_seed: None,
        }
    }
}

fn default_population_size() -> usize {
    100
}
fn default_tournament_size() -> usize {
    10
}
fn default_const_range() -> (f64, f64) {
    (-1.0, 1.0)
}
fn default_parsimony() -> f64 {
    0.9
}
fn default_parsimony_decay() -> f64 {
    0.9
}
fn default_offspring_timeout() -> u64 {
    120
}

/// Checkpoint cadence and destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Write a snapshot every N generations.
    #[serde(default = "default_checkpoint_frequency")]
    pub frequency: usize,
}

fn default_checkpoint_frequency() -> usize {
    10
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("population size must be at least 2")]
    PopulationTooSmall,
    #[error("tournament size must be at least 1")]
    TournamentTooSmall,
    #[error("constant range min ({0}) > max ({1})")]
    InvalidConstRange(f64, f64),
    #[error("parsimony parameters must be in (0, 1]")]
    InvalidParsimony,
    #[error("operator frequency for `{0}` must be non-negative")]
    NegativeFrequency(String),
    #[error("offspring timeout must be positive")]
    InvalidTimeout,
    #[error("checkpoint frequency must be at least 1")]
    InvalidCheckpointFrequency,
    #[error("learning rate must be positive")]
    InvalidLearningRate,
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("beta parameters must be in [0, 1)")]
    InvalidBeta,
    #[error("epsilon must be positive")]
    InvalidEpsilon,
    #[error("regularization parameters must be non-negative")]
    NegativeRegularization,
}

impl RegressorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size < 2 {
            return Err(ConfigError::PopulationTooSmall);
        }
        if self.tournament_size < 1 {
            return Err(ConfigError::TournamentTooSmall);
        }
        if self.const_range.0 > self.const_range.1 {
            return Err(ConfigError::InvalidConstRange(
                self.const_range.0,
                self.const_range.1,
            ));
        }
        for value in [self.parsimony, self.parsimony_decay] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidParsimony);
            }
        }
        for (name, frequency) in &self.operator_frequencies {
            if *frequency < 0.0 {
                return Err(ConfigError::NegativeFrequency(name.clone()));
            }
        }
        if self.offspring_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if let Some(checkpoint) = &self.checkpoint
            && checkpoint.frequency == 0
        {
            return Err(ConfigError::InvalidCheckpointFrequency);
        }
        Ok(())
    }
}

/// Loss/gradient formula family for the constant optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    #[serde(rename = "regression:wmse")]
    RegressionWmse,
    #[serde(rename = "regression:wrrmse")]
    RegressionWrrmse,
    #[serde(rename = "binary:logistic")]
    BinaryLogistic,
}

/// Which gradient engine the constant optimizer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerVariant {
    Sgd,
    Adam,
    /// Blended two-target ADAM: per-batch convex combination of two targets'
    /// losses and gradients.
    AdamTwoFold,
}

/// Hyperparameters shared by all constant-optimizer variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Rescale gradients with Euclidean norm above 1.
    #[serde(default = "default_gradient_clip")]
    pub gradient_clip: bool,
    #[serde(default)]
    pub l1_param: f64,
    #[serde(default)]
    pub l2_param: f64,
    #[serde(default = "default_beta_1")]
    pub beta_1: f64,
    #[serde(default = "default_beta_2")]
    pub beta_2: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            gradient_clip: default_gradient_clip(),
            l1_param: 0.0,
            l2_param: 0.0,
            beta_1: default_beta_1(),
            beta_2: default_beta_2(),
            epsilon: default_epsilon(),
        }
    }
}

fn default_learning_rate() -> f64 {
    1e-2
}
fn default_batch_size() -> usize {
    64
}
fn default_epochs() -> usize {
    50
}
fn default_gradient_clip() -> bool {
    true
}
fn default_beta_1() -> f64 {
    0.9
}
fn default_beta_2() -> f64 {
    0.999
}
fn default_epsilon() -> f64 {
    1e-8
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::InvalidLearningRate);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        for beta in [self.beta_1, self.beta_2] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ConfigError::InvalidBeta);
            }
        }
        if self.epsilon <= 0.0 {
            return Err(ConfigError::InvalidEpsilon);
        }
        if self.l1_param < 0.0 || self.l2_param < 0.0 {
            return Err(ConfigError::NegativeRegularization);
        }
        Ok(())
    }
}

/// Full constant-optimization setup carried by a fitness metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub variant: OptimizerVariant,
    pub task: Task,
    #[serde(default)]
    pub config: OptimizerConfig,
    /// Second target column for the blended two-target variant.
    #[serde(default)]
    pub secondary_target: Option<String>,
    /// Weight column paired with the second target.
    #[serde(default)]
    pub secondary_weights: Option<String>,
}

impl OptimizerSpec {
    pub fn new(variant: OptimizerVariant, task: Task) -> Self {
        Self {
            variant,
            task,
            config: OptimizerConfig::default(),
            secondary_target: None,
            secondary_weights: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(RegressorConfig::default().validate().is_ok());
        assert!(OptimizerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_population() {
        let config = RegressorConfig {
            population_size: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PopulationTooSmall)
        ));
    }

    #[test]
    fn test_rejects_zero_batch() {
        let config = OptimizerConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_task_serialization_tags() {
        let json = serde_json::to_string(&Task::RegressionWrrmse).unwrap();
        assert_eq!(json, "\"regression:wrrmse\"");
        let parsed: Task = serde_json::from_str("\"binary:logistic\"").unwrap();
        assert_eq!(parsed, Task::BinaryLogistic);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = RegressorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RegressorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.population_size, config.population_size);
        assert_eq!(parsed.offspring_timeout_secs, config.offspring_timeout_secs);
    }
}
