//! Ordered pipeline of stages.
//!
//! Stages run strictly sequentially in numeric order; the dependency
//! structure between them is expressed through the directory tree, not a
//! general graph. The pipeline validates its shape (unique names, unique
//! order numbers) once at build time, before anything runs.

use std::sync::Arc;
use thiserror::Error;

use super::task::Task;

/// Errors that can occur when assembling a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Two stages share a name.
    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    /// Two stages share an order number.
    #[error("duplicate stage order {order}: '{first}' and '{second}'")]
    DuplicateOrder {
        order: u32,
        first: String,
        second: String,
    },
}

/// A validated, ordered sequence of stages.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Task>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage, keeping the sequence sorted by order number.
    pub fn add_stage(&mut self, stage: Arc<dyn Task>) -> Result<(), PipelineError> {
        if let Some(existing) = self.stages.iter().find(|s| s.name() == stage.name()) {
            return Err(PipelineError::DuplicateStage(existing.name().to_string()));
        }
        if let Some(existing) = self.stages.iter().find(|s| s.order() == stage.order()) {
            return Err(PipelineError::DuplicateOrder {
                order: stage.order(),
                first: existing.name().to_string(),
                second: stage.name().to_string(),
            });
        }
        self.stages.push(stage);
        self.stages.sort_by_key(|s| s.order());
        Ok(())
    }

    /// The stages in execution order.
    pub fn stages(&self) -> &[Arc<dyn Task>] {
        &self.stages
    }

    /// Look up a stage by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Task>> {
        self.stages.iter().find(|s| s.name() == name)
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if the pipeline is empty.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
