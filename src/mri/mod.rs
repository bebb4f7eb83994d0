//! Utilities shared by the imaging stages.
//!
//! Gradient encoding file conversions and data-stride layouts. Everything
//! here is file-format plumbing; the numerical work stays in the external
//! tools.

pub mod gradients;
pub mod strides;

pub use gradients::{GradientError, GradientTable};
pub use strides::StrideLayout;
