//! The pipeline stages.
//!
//! Each stage resolves its inputs by naming convention from upstream
//! directories, derives every artifact through exactly one external command
//! (written under a scratch name, then renamed into place), and declares
//! the tables its dependency and idempotence gates are checked against.

pub mod fodf;
pub mod masking;
pub mod preparation;
pub mod registration;

pub use fodf::FodfReconstruction;
pub use masking::Masking;
pub use preparation::Preparation;
pub use registration::Registration;

use std::sync::Arc;

use crate::core::pipeline::{Pipeline, PipelineError};

/// Assemble the standard preprocessing pipeline.
pub fn standard_pipeline() -> Result<Pipeline, PipelineError> {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(Arc::new(Preparation))?;
    pipeline.add_stage(Arc::new(Registration))?;
    pipeline.add_stage(Arc::new(Masking))?;
    pipeline.add_stage(Arc::new(FodfReconstruction))?;
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_pipeline_order() {
        let pipeline = standard_pipeline().unwrap();
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["preparation", "registration", "masking", "fodf"]);
    }

    #[test]
    fn test_standard_pipeline_orders_are_stable() {
        let pipeline = standard_pipeline().unwrap();
        let orders: Vec<u32> = pipeline.stages().iter().map(|s| s.order()).collect();
        assert_eq!(orders, vec![1, 6, 7, 12]);
    }
}
