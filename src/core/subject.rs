//! Per-subject directory tree.
//!
//! All of a subject's data lives under one root: a `00-backup` directory
//! holding the raw inputs and one `NN-name` working directory per stage.
//! Dependency directories are resolved by stage name against that tree, so
//! a stage never needs to know which numeric prefix an upstream stage was
//! given.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::PipelineConfig;

use super::context::StageContext;
use super::task::Task;
use super::types::{SubjectId, TaskId};

/// Errors that can occur when opening a subject tree.
#[derive(Debug, Error)]
pub enum SubjectError {
    /// The subject root does not exist or is not a directory.
    #[error("subject root '{0}' is not a directory")]
    NotADirectory(PathBuf),

    /// The subject root has no usable directory name.
    #[error("cannot derive a subject id from '{0}'")]
    UnnamedRoot(PathBuf),
}

/// A subject: an identifier plus the root of its directory tree.
#[derive(Debug, Clone)]
pub struct Subject {
    id: SubjectId,
    root: PathBuf,
}

impl Subject {
    /// Open an existing subject directory. The subject id is the directory
    /// name.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SubjectError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SubjectError::NotADirectory(root));
        }
        let id = root
            .file_name()
            .and_then(|n| n.to_str())
            .map(SubjectId::new)
            .ok_or_else(|| SubjectError::UnnamedRoot(root.clone()))?;
        Ok(Self { id, root })
    }

    /// The subject identifier.
    pub fn id(&self) -> &SubjectId {
        &self.id
    }

    /// The subject root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The working directory a stage will use, whether or not it exists
    /// yet: `{root}/{NN-name}`.
    pub fn working_dir(&self, task: &dyn Task) -> PathBuf {
        self.root.join(format!("{:02}-{}", task.order(), task.name()))
    }

    /// Resolve a stage name to an existing directory under the root.
    ///
    /// Accepts both numbered (`06-registration`) and bare (`registration`)
    /// directory names; when several numbered candidates exist the
    /// lexicographically smallest wins, which makes resolution
    /// deterministic.
    pub fn resolve_dir(&self, stage: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.root).ok()?;
        let mut candidates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| {
                name == stage
                    || name
                        .split_once('-')
                        .is_some_and(|(prefix, rest)| {
                            !prefix.is_empty()
                                && prefix.bytes().all(|b| b.is_ascii_digit())
                                && rest == stage
                        })
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next().map(|name| self.root.join(name))
    }

    /// Build the execution context for a stage: its working directory plus
    /// every declared dependency that resolves to an existing directory.
    /// Unresolved dependencies are simply absent from the map; the stage's
    /// requirement table reports them as missing.
    pub fn stage_context(&self, task: &dyn Task, config: Arc<PipelineConfig>) -> StageContext {
        let mut depend_dirs: HashMap<&'static str, PathBuf> = HashMap::new();
        for &dep in task.depends_on() {
            if let Some(dir) = self.resolve_dir(dep) {
                depend_dirs.insert(dep, dir);
            }
        }
        StageContext::new(
            self.id.clone(),
            TaskId::new(task.name()),
            self.working_dir(task),
            depend_dirs,
            config,
        )
    }
}
