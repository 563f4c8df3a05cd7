//! Full-state snapshots for resumable training.
//!
//! A checkpoint carries the entire run state plus the population; expressions
//! round-trip through `Expression::to_value` and `ProgramFactory::restore`.
//! Writes are atomic (temp file + rename) so a crash mid-write never leaves a
//! truncated snapshot behind.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::regressor::Status;
use crate::schema::{ExprError, ProgramState};

/// Checkpoint persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// Serializable snapshot of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub generation: usize,
    pub status: Status,
    pub converged_generation: Option<usize>,
    pub elapsed_secs: f64,
    pub average_complexity: f64,
    pub population: Vec<ProgramState>,
    pub best_history: Vec<ProgramState>,
    pub first_front_history: Vec<Vec<ProgramState>>,
    pub hypervolume_history: Vec<f64>,
}

impl Checkpoint {
    /// Write the snapshot atomically.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let encoded = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FitnessVector;

    fn state() -> ProgramState {
        ProgramState {
            expression: serde_json::json!({ "affine": 0 }),
            constants: vec![0.5],
            features: vec![],
            fitness: FitnessVector::default(),
            rank: 1,
            crowding_distance: f64::INFINITY,
            is_valid: true,
            is_duplicate: false,
            converged: false,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let checkpoint = Checkpoint {
            generation: 4,
            status: Status::GenerationsCompleted,
            converged_generation: Some(3),
            elapsed_secs: 1.25,
            average_complexity: 2.0,
            population: vec![state(), state()],
            best_history: vec![state()],
            first_front_history: vec![vec![state()]],
            hypervolume_history: vec![0.0, 1.5],
        };
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.generation, 4);
        assert_eq!(loaded.status, Status::GenerationsCompleted);
        assert_eq!(loaded.population.len(), 2);
        assert_eq!(loaded.population[0].crowding_distance, f64::INFINITY);
        assert_eq!(loaded.hypervolume_history, vec![0.0, 1.5]);
    }

    #[test]
    fn test_save_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("model.json");
        let checkpoint = Checkpoint {
            generation: 0,
            status: Status::Uninitialized,
            converged_generation: None,
            elapsed_secs: 0.0,
            average_complexity: 0.0,
            population: vec![],
            best_history: vec![],
            first_front_history: vec![],
            hypervolume_history: vec![],
        };
        assert!(checkpoint.save(&path).is_err());
    }
}
