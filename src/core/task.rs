//! Task trait and error types.
//!
//! A [`Task`] is one numbered pipeline stage. It declares its upstream
//! dependencies, a table of required inputs, a table of expected outputs,
//! and the work itself. The two gate predicates are derived from the tables
//! by default:
//!
//! - [`Task::meet_requirement`] — true only when every required upstream
//!   image exists; read-only, no side effects.
//! - [`Task::is_dirty`] — true when any expected output is missing from the
//!   stage's own working directory, i.e. work is still needed.
//!
//! Stages with conditions the tables cannot express (an either/or input,
//! a config-gated output) override the predicate and call the default
//! helpers for the rest.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use super::context::StageContext;
use crate::mri::gradients::GradientError;
use crate::qa::QaItem;

/// Errors that can occur during stage execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A required input image was absent at implement time.
    #[error("missing required input: {0}")]
    MissingInput(String),

    /// A dependency directory could not be resolved.
    #[error("dependency directory '{0}' not found")]
    MissingDependency(String),

    /// External command exited non-zero.
    #[error("{program} exited with code {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    /// External command exceeded the configured timeout.
    #[error("{program} timed out after {timeout:?}")]
    CommandTimeout {
        program: String,
        timeout: std::time::Duration,
    },

    /// External command could not be launched at all.
    #[error("failed to launch {program}: {source}")]
    CommandLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// External command produced output we could not interpret.
    #[error("unexpected output from {program}: {detail}")]
    UnexpectedOutput { program: String, detail: String },

    /// Gradient encoding file error.
    #[error(transparent)]
    Gradient(#[from] GradientError),

    /// Filesystem error while staging files.
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TaskError {
    /// Build an [`TaskError::Io`] from a path and source error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// One row of a stage's input or output table: an image expected to exist
/// in a specific directory, with a human-readable description for
/// diagnostics.
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Human-readable description, e.g. "brain extracted, resampled high
    /// resolution".
    pub description: String,
    /// Directory to look in. `None` when the dependency directory itself
    /// could not be resolved, which reads as "missing".
    pub dir: Option<PathBuf>,
    /// Image role.
    pub role: &'static str,
    /// Required tags.
    pub tags: Vec<&'static str>,
    /// Explicit extension, or any volume extension when `None`.
    pub extension: Option<&'static str>,
}

impl Requirement {
    /// Locate the image this requirement describes.
    pub fn locate(&self) -> Option<PathBuf> {
        let dir = self.dir.as_deref()?;
        super::naming::find_image(dir, self.role, &self.tags, self.extension)
    }
}

/// The core trait for pipeline stages.
///
/// # Example
///
/// ```ignore
/// use toad::{Requirement, StageContext, Task, TaskError};
/// use async_trait::async_trait;
///
/// struct Smoothing;
///
/// #[async_trait]
/// impl Task for Smoothing {
///     fn name(&self) -> &'static str {
///         "smoothing"
///     }
///
///     fn order(&self) -> u32 {
///         9
///     }
///
///     fn depends_on(&self) -> &'static [&'static str] {
///         &["preparation"]
///     }
///
///     fn description(&self) -> &'static str {
///         "smooth the diffusion volumes"
///     }
///
///     fn required_inputs(&self, ctx: &StageContext) -> Vec<Requirement> {
///         vec![ctx.requirement("preparation", "diffusion weighted", "dwi", &[], None)]
///     }
///
///     fn expected_outputs(&self, ctx: &StageContext) -> Vec<Requirement> {
///         vec![ctx.output("smoothed diffusion weighted", "dwi", &["smooth"], None)]
///     }
///
///     async fn implement(&self, ctx: &StageContext) -> Result<(), TaskError> {
///         // resolve inputs, run external commands, rename into place
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Stage name, e.g. "preparation".
    fn name(&self) -> &'static str;

    /// Position in the numeric pipeline order; also the working directory
    /// prefix (`01-preparation`).
    fn order(&self) -> u32;

    /// Names of the upstream stage directories this stage reads from.
    fn depends_on(&self) -> &'static [&'static str];

    /// One-line human-readable description for display and logging.
    fn description(&self) -> &'static str;

    /// Table of upstream images this stage needs before it can run.
    fn required_inputs(&self, ctx: &StageContext) -> Vec<Requirement>;

    /// Table of images this stage is expected to leave in its working
    /// directory. The set may depend on configuration.
    fn expected_outputs(&self, ctx: &StageContext) -> Vec<Requirement>;

    /// Check that every required upstream image exists.
    ///
    /// Read-only; logs each missing requirement by description.
    fn meet_requirement(&self, ctx: &StageContext) -> bool {
        all_present(self.name(), &self.required_inputs(ctx))
    }

    /// Check whether work is still needed: true when any expected output is
    /// missing from the working directory.
    fn is_dirty(&self, ctx: &StageContext) -> bool {
        !outputs_complete(self.name(), &self.expected_outputs(ctx))
    }

    /// Do the work: stage inputs, run external commands, rename outputs
    /// into their canonical names.
    async fn implement(&self, ctx: &StageContext) -> Result<(), TaskError>;

    /// Images for the downstream quality-assessment report, in display
    /// order. Stages without a report return `None`.
    fn qa_supplier(&self, _ctx: &StageContext) -> Option<Vec<QaItem>> {
        None
    }
}

/// Check a requirement table, logging each missing entry.
pub fn all_present(stage: &str, requirements: &[Requirement]) -> bool {
    let mut ok = true;
    for req in requirements {
        if req.locate().is_none() {
            warn!(stage, "missing requirement: {}", req.description);
            ok = false;
        }
    }
    ok
}

/// Check an output table without logging failures as warnings; a missing
/// output just means the stage still has work to do.
pub fn outputs_complete(stage: &str, outputs: &[Requirement]) -> bool {
    for out in outputs {
        if out.locate().is_none() {
            tracing::debug!(stage, "expected output not yet present: {}", out.description);
            return false;
        }
    }
    true
}
