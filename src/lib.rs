pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod mri;
pub mod qa;
pub mod tasks;

pub use config::{ConfigError, ConfigFile, PipelineConfig, SeedKind, SeedList};
pub use core::context::StageContext;
pub use core::environment::Environment;
pub use core::pipeline::{Pipeline, PipelineError};
pub use core::subject::{Subject, SubjectError};
pub use core::task::{Requirement, Task, TaskError};
pub use core::types::{RunId, SubjectId, TaskId};
pub use events::{Event, EventBus, EventHandler};
pub use execution::command::{CommandOutput, ShellCommand};
pub use execution::runner::{FailurePolicy, PipelineRunner, RunReport, StageOutcome, StageStatus};
pub use qa::{QaItem, QaSection};
pub use tasks::standard_pipeline;
