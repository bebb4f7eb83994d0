//! Pipeline execution engine.
//!
//! The runner walks the stages in numeric order, strictly one at a time,
//! and drives each through its state machine:
//!
//! ```text
//! Pending ── outputs already complete ──────────────▶ Skipped
//! Pending ── upstream requirements missing ─────────▶ Blocked
//! Pending ─▶ Running ── implement ok, outputs ok ───▶ Completed
//!            Running ── implement error ────────────▶ Failed
//! ```
//!
//! A failure is surfaced distinctly from "nothing to do"; whether it halts
//! the remaining stages is the runner's policy, not the stage's.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::core::pipeline::Pipeline;
use crate::core::subject::Subject;
use crate::core::task::Task;
use crate::core::types::{RunId, SubjectId, TaskId};
use crate::events::{Event, EventBus};
use crate::qa::QaSection;

/// Status of a stage within a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not reached (an earlier failure halted the run).
    Pending,
    /// Upstream requirements missing; terminal for this run.
    Blocked,
    /// Outputs already complete, nothing to do.
    Skipped,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed; terminal for this run.
    Failed,
}

/// Per-stage result recorded in the run report.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    /// The stage.
    pub task: TaskId,
    /// Final status.
    pub status: StageStatus,
    /// Wall-clock duration of `implement`, in seconds, when it ran.
    pub duration_secs: Option<f64>,
    /// Error message when the stage failed.
    pub error: Option<String>,
}

/// Result of a full pipeline run for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique identifier of this run.
    pub run_id: RunId,
    /// The subject the pipeline ran for.
    pub subject: SubjectId,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// True when every stage completed or was skipped.
    pub success: bool,
    /// Per-stage outcomes, in pipeline order.
    pub stages: Vec<StageOutcome>,
    /// Quality-assessment images supplied by completed stages.
    pub qa: Vec<QaSection>,
}

impl RunReport {
    /// Get the outcome for a stage by name.
    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|o| o.task.as_str() == name)
    }

    /// Number of stages that completed.
    pub fn completed_count(&self) -> usize {
        self.count(StageStatus::Completed)
    }

    /// Number of stages that were skipped.
    pub fn skipped_count(&self) -> usize {
        self.count(StageStatus::Skipped)
    }

    /// Number of stages that failed.
    pub fn failed_count(&self) -> usize {
        self.count(StageStatus::Failed)
    }

    fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|o| o.status == status).count()
    }
}

/// What to do with the rest of the pipeline after a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the run; remaining stages stay pending.
    #[default]
    Halt,
    /// Keep going; dependents of the failed stage block naturally.
    Continue,
}

/// Executor for sequential pipeline runs.
pub struct PipelineRunner {
    policy: FailurePolicy,
    event_bus: Option<Arc<EventBus>>,
}

impl PipelineRunner {
    /// Create a runner with the default halt-on-failure policy.
    pub fn new() -> Self {
        Self {
            policy: FailurePolicy::default(),
            event_bus: None,
        }
    }

    /// Builder: set the failure policy.
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder: attach an event bus for lifecycle events.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run the pipeline for one subject.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        subject: &Subject,
        config: Arc<PipelineConfig>,
    ) -> RunReport {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let run_start = Instant::now();
        info!(subject = %subject.id(), run = %run_id, "starting pipeline run");

        let mut outcomes: Vec<StageOutcome> = Vec::with_capacity(pipeline.len());
        let mut qa: Vec<QaSection> = Vec::new();
        let mut halted = false;

        for stage in pipeline.stages() {
            if halted {
                outcomes.push(StageOutcome {
                    task: TaskId::new(stage.name()),
                    status: StageStatus::Pending,
                    duration_secs: None,
                    error: None,
                });
                continue;
            }

            let outcome = self
                .run_stage(stage.as_ref(), subject, config.clone(), &mut qa)
                .await;
            if outcome.status == StageStatus::Failed && self.policy == FailurePolicy::Halt {
                halted = true;
            }
            outcomes.push(outcome);
        }

        let success = outcomes
            .iter()
            .all(|o| matches!(o.status, StageStatus::Completed | StageStatus::Skipped));

        self.emit(Event::run_completed(
            subject.id().clone(),
            run_id.clone(),
            success,
            run_start.elapsed(),
        ))
        .await;

        if success {
            info!(subject = %subject.id(), run = %run_id, "pipeline run finished");
        } else {
            warn!(subject = %subject.id(), run = %run_id, "pipeline run incomplete");
        }

        RunReport {
            run_id,
            subject: subject.id().clone(),
            started_at,
            finished_at: Utc::now(),
            success,
            stages: outcomes,
            qa,
        }
    }

    async fn run_stage(
        &self,
        stage: &dyn Task,
        subject: &Subject,
        config: Arc<PipelineConfig>,
        qa: &mut Vec<QaSection>,
    ) -> StageOutcome {
        let task_id = TaskId::new(stage.name());
        let ctx = subject.stage_context(stage, config);

        if !stage.is_dirty(&ctx) {
            info!(stage = stage.name(), "outputs already present, skipping");
            self.emit(Event::stage_skipped(task_id.clone(), subject.id().clone()))
                .await;
            return StageOutcome {
                task: task_id,
                status: StageStatus::Skipped,
                duration_secs: None,
                error: None,
            };
        }

        if !stage.meet_requirement(&ctx) {
            warn!(
                stage = stage.name(),
                "requirements not met, blocking ({})",
                stage.description()
            );
            self.emit(Event::stage_blocked(task_id.clone(), subject.id().clone()))
                .await;
            return StageOutcome {
                task: task_id,
                status: StageStatus::Blocked,
                duration_secs: None,
                error: None,
            };
        }

        // working directory is created lazily, on first actual run
        if let Err(e) = tokio::fs::create_dir_all(ctx.working_dir()).await {
            error!(stage = stage.name(), "cannot create working directory: {}", e);
            return StageOutcome {
                task: task_id,
                status: StageStatus::Failed,
                duration_secs: None,
                error: Some(format!(
                    "cannot create working directory '{}': {}",
                    ctx.working_dir().display(),
                    e
                )),
            };
        }

        info!(stage = stage.name(), "starting: {}", stage.description());
        self.emit(Event::stage_started(task_id.clone(), subject.id().clone()))
            .await;
        let start = Instant::now();

        match stage.implement(&ctx).await {
            Ok(()) => {
                let duration = start.elapsed();
                // completion must be self-consistent with the idempotence gate
                if stage.is_dirty(&ctx) {
                    let message =
                        "stage reported success but expected outputs are missing".to_string();
                    error!(stage = stage.name(), "{}", message);
                    self.emit(Event::stage_failed(
                        task_id.clone(),
                        subject.id().clone(),
                        message.clone(),
                    ))
                    .await;
                    return StageOutcome {
                        task: task_id,
                        status: StageStatus::Failed,
                        duration_secs: Some(duration.as_secs_f64()),
                        error: Some(message),
                    };
                }

                if let Some(items) = stage.qa_supplier(&ctx) {
                    qa.push(QaSection {
                        stage: stage.name().to_string(),
                        items,
                    });
                }

                info!(stage = stage.name(), elapsed = ?duration, "completed");
                self.emit(Event::stage_completed(
                    task_id.clone(),
                    subject.id().clone(),
                    duration,
                ))
                .await;
                StageOutcome {
                    task: task_id,
                    status: StageStatus::Completed,
                    duration_secs: Some(duration.as_secs_f64()),
                    error: None,
                }
            }
            Err(err) => {
                let duration = start.elapsed();
                let message = err.to_string();
                error!(stage = stage.name(), "failed: {}", message);
                self.emit(Event::stage_failed(
                    task_id.clone(),
                    subject.id().clone(),
                    message.clone(),
                ))
                .await;
                StageOutcome {
                    task: task_id,
                    status: StageStatus::Failed,
                    duration_secs: Some(duration.as_secs_f64()),
                    error: Some(message),
                }
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(event).await;
        }
    }
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}
