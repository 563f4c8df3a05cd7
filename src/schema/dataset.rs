//! Columnar dataset shared by fitness evaluation and constant optimization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Dataset validation and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("column `{name}` has {actual} rows, expected {expected}")]
    LengthMismatch {
        name: String,
        actual: usize,
        expected: usize,
    },
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
}

/// A columnar table of `f64` values with a fixed row count.
///
/// Feature, target, and weight columns all live here. Metric weight columns
/// are derived once, before the parallel phase of a run, so workers only ever
/// see the dataset through shared references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    n_rows: usize,
    columns: HashMap<String, Vec<f64>>,
}

impl Dataset {
    /// Create an empty dataset with a fixed row count.
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: HashMap::new(),
        }
    }

    /// Build a dataset from named columns, validating that all lengths agree.
    pub fn from_columns(
        columns: impl IntoIterator<Item = (String, Vec<f64>)>,
    ) -> Result<Self, DatasetError> {
        let mut dataset = Self::default();
        let mut first = true;
        for (name, values) in columns {
            if first {
                dataset.n_rows = values.len();
                first = false;
            }
            dataset.insert_column(name, values)?;
        }
        Ok(dataset)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Insert (or replace) a column. Length must match the dataset row count.
    pub fn insert_column(&mut self, name: String, values: Vec<f64>) -> Result<(), DatasetError> {
        if values.len() != self.n_rows {
            return Err(DatasetError::LengthMismatch {
                name,
                actual: values.len(),
                expected: self.n_rows,
            });
        }
        self.columns.insert(name, values);
        Ok(())
    }

    /// Extract a row-major matrix of the named feature columns.
    pub fn matrix(&self, features: &[String]) -> Result<FeatureMatrix, DatasetError> {
        let mut columns = Vec::with_capacity(features.len());
        for name in features {
            columns.push(
                self.column(name)
                    .ok_or_else(|| DatasetError::UnknownColumn(name.clone()))?,
            );
        }
        let mut values = Vec::with_capacity(self.n_rows * features.len());
        for row in 0..self.n_rows {
            for column in &columns {
                values.push(column[row]);
            }
        }
        Ok(FeatureMatrix {
            values,
            n_features: features.len(),
            n_rows: self.n_rows,
        })
    }
}

/// Row-major feature values for batch evaluation of a program.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    values: Vec<f64>,
    n_features: usize,
    n_rows: usize,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// One row of feature values, in the order the features were requested.
    pub fn row(&self, index: usize) -> &[f64] {
        let start = index * self.n_features;
        &self.values[start..start + self.n_features]
    }
}
