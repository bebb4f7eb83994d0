//! toad - a pipeline orchestrator for diffusion-MRI preprocessing.
//!
//! Usage:
//!   toad run <subject-dir>       Run the pipeline for one subject
//!   toad status <subject-dir>    Show per-stage state without running
//!   toad validate <config>       Validate a configuration file

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use toad::{
    config, standard_pipeline, Event, EventBus, EventHandler, FailurePolicy, PipelineConfig,
    PipelineRunner, Subject,
};
use tracing::{error, info, warn};

/// toad - diffusion-MRI preprocessing pipeline orchestrator
#[derive(Parser)]
#[command(name = "toad")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a subject directory
    Run {
        /// Path to the subject directory (contains 00-backup)
        #[arg(value_name = "SUBJECT_DIR")]
        subject_dir: PathBuf,

        /// Path to the configuration file (default: <subject-dir>/toad.yaml
        /// when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Keep running after a stage fails instead of halting
        #[arg(long)]
        continue_on_failure: bool,
    },

    /// Show per-stage state for a subject without running anything
    Status {
        /// Path to the subject directory
        #[arg(value_name = "SUBJECT_DIR")]
        subject_dir: PathBuf,

        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a configuration file without running
    Validate {
        /// Path to the configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

/// Event handler that logs stage transitions.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::StageStarted { task_id, .. } => {
                info!("stage '{}' started", task_id);
            }
            Event::StageCompleted {
                task_id, duration, ..
            } => {
                info!("stage '{}' completed in {:?}", task_id, duration);
            }
            Event::StageFailed { task_id, error, .. } => {
                error!("stage '{}' failed: {}", task_id, error);
            }
            Event::StageSkipped { task_id, .. } => {
                info!("stage '{}' skipped, outputs already present", task_id);
            }
            Event::StageBlocked { task_id, .. } => {
                warn!("stage '{}' blocked on missing requirements", task_id);
            }
            Event::RunCompleted {
                subject,
                run_id,
                success,
                duration,
                ..
            } => {
                if *success {
                    info!(
                        "run {} for subject '{}' finished in {:?}",
                        run_id, subject, duration
                    );
                } else {
                    warn!(
                        "run {} for subject '{}' incomplete after {:?}",
                        run_id, subject, duration
                    );
                }
            }
        }
    }
}

fn load_config(
    explicit: Option<&Path>,
    subject_dir: &Path,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    if let Some(path) = explicit {
        return Ok(config::load(path)?);
    }
    let default = subject_dir.join("toad.yaml");
    if default.is_file() {
        return Ok(config::load(&default)?);
    }
    Ok(PipelineConfig::default())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Run {
            subject_dir,
            config,
            continue_on_failure,
        } => run(&subject_dir, config.as_deref(), continue_on_failure).await,
        Commands::Status {
            subject_dir,
            config,
        } => status(&subject_dir, config.as_deref()),
        Commands::Validate { config } => validate(&config),
    };
    std::process::exit(exit_code);
}

async fn run(subject_dir: &Path, config_path: Option<&Path>, continue_on_failure: bool) -> i32 {
    let config = match load_config(config_path, subject_dir) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("configuration error: {}", e);
            return 1;
        }
    };
    let subject = match Subject::open(subject_dir) {
        Ok(subject) => subject,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    let pipeline = match standard_pipeline() {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let bus = Arc::new(EventBus::new());
    bus.register(Arc::new(LoggingHandler)).await;

    let policy = if continue_on_failure {
        FailurePolicy::Continue
    } else {
        FailurePolicy::Halt
    };
    let runner = PipelineRunner::new()
        .with_policy(policy)
        .with_event_bus(bus);

    let report = runner.execute(&pipeline, &subject, config).await;

    let report_path = subject.root().join("toad_report.json");
    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&report_path, json) {
                warn!("could not write run report to '{}': {}", report_path.display(), e);
            } else {
                info!("run report written to {}", report_path.display());
            }
        }
        Err(e) => warn!("could not serialize run report: {}", e),
    }

    if report.success {
        0
    } else {
        1
    }
}

fn status(subject_dir: &Path, config_path: Option<&Path>) -> i32 {
    let config = match load_config(config_path, subject_dir) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("configuration error: {}", e);
            return 1;
        }
    };
    let subject = match Subject::open(subject_dir) {
        Ok(subject) => subject,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    let pipeline = match standard_pipeline() {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    println!("subject: {}", subject.id());
    for stage in pipeline.stages() {
        let ctx = subject.stage_context(stage.as_ref(), config.clone());
        let state = if !stage.is_dirty(&ctx) {
            "complete"
        } else if stage.meet_requirement(&ctx) {
            "ready"
        } else {
            "blocked"
        };
        println!("  {:02}-{:<14} {}", stage.order(), stage.name(), state);
    }
    0
}

fn validate(config_path: &Path) -> i32 {
    match config::load(config_path) {
        Ok(_) => {
            println!("{}: ok", config_path.display());
            0
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}
