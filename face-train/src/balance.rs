//! Inverse-frequency class weights.

use crate::{
    common::*,
    data::{ClassIndex, DatasetSplit},
};

/// Per-class loss weights indexed by class index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeightTable {
    weights: Vec<f64>,
}

impl ClassWeightTable {
    /// Computes `max_count / count` for every class.
    ///
    /// A class without examples is a data error.
    pub fn from_counts(counts: &[usize], class_index: &ClassIndex) -> Fallible<Self> {
        if let Some(class) = counts.iter().position(|&count| count == 0) {
            return Err(Error::data(format!(
                "class '{}' has zero training examples",
                class_index.label(class).unwrap_or("?")
            )));
        }

        let max_count = counts
            .iter()
            .copied()
            .max()
            .ok_or_else(|| Error::data("no class to balance"))?;
        let weights = counts
            .iter()
            .map(|&count| max_count as f64 / count as f64)
            .collect();

        Ok(Self { weights })
    }

    /// Computes the weights from the train split.
    pub fn from_split(train: &DatasetSplit, class_index: &ClassIndex) -> Fallible<Self> {
        let counts = train.class_counts(class_index.len());
        Self::from_counts(&counts, class_index)
    }

    /// All weights set to 1.0.
    pub fn uniform(num_classes: usize) -> Self {
        Self {
            weights: vec![1.0; num_classes],
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weight(&self, class: usize) -> Fallible<f64> {
        self.weights.get(class).copied().ok_or_else(|| {
            Error::data(format!(
                "class index {} is out of range of {} class weights",
                class,
                self.weights.len()
            ))
        })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.weights
    }

    /// Gathers the weight of each example.
    pub fn example_weights(&self, classes: &[usize]) -> Fallible<Vec<f64>> {
        classes.iter().map(|&class| self.weight(class)).collect()
    }
}
