//! Execution: external command invocation and the sequential pipeline
//! runner.

pub mod command;
pub mod runner;

pub use command::{CommandOutput, ShellCommand};
pub use runner::{FailurePolicy, PipelineRunner, RunReport, StageOutcome, StageStatus};
