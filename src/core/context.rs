//! Per-stage execution context.
//!
//! A [`StageContext`] bundles everything a stage touches at run time: its
//! working directory, the resolved dependency directories (an explicit
//! stage-name → path map, built once per run), and the validated pipeline
//! configuration. All naming-convention lookups and output-name derivations
//! go through the context so stages never assemble paths by hand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::execution::command::ShellCommand;

use super::naming;
use super::task::{Requirement, TaskError};
use super::types::{SubjectId, TaskId};

/// Execution context handed to a stage by the runner.
#[derive(Debug, Clone)]
pub struct StageContext {
    subject: SubjectId,
    task: TaskId,
    working_dir: PathBuf,
    depend_dirs: HashMap<&'static str, PathBuf>,
    config: Arc<PipelineConfig>,
}

impl StageContext {
    /// Create a context from resolved directories.
    pub fn new(
        subject: SubjectId,
        task: TaskId,
        working_dir: PathBuf,
        depend_dirs: HashMap<&'static str, PathBuf>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            subject,
            task,
            working_dir,
            depend_dirs,
            config,
        }
    }

    /// The subject this run belongs to.
    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    /// The stage this context was built for.
    pub fn task(&self) -> &TaskId {
        &self.task
    }

    /// This stage's working directory.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The validated pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resolved path of a dependency directory, if it exists.
    pub fn depend_dir(&self, name: &str) -> Option<&Path> {
        self.depend_dirs.get(name).map(PathBuf::as_path)
    }

    /// Look up an image in a dependency directory.
    pub fn find_in(
        &self,
        depend: &str,
        role: &'static str,
        tags: &[&str],
        extension: Option<&str>,
    ) -> Option<PathBuf> {
        let dir = self.depend_dir(depend)?;
        naming::find_image(dir, role, tags, extension)
    }

    /// Look up an image in this stage's own working directory.
    pub fn find_output(
        &self,
        role: &'static str,
        tags: &[&str],
        extension: Option<&str>,
    ) -> Option<PathBuf> {
        naming::find_image(&self.working_dir, role, tags, extension)
    }

    /// Derive a canonical output path in the working directory from a
    /// source image, appending tags and optionally overriding the
    /// extension.
    pub fn target_from(&self, source: &Path, tags: &[&str], extension: Option<&str>) -> PathBuf {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.working_dir.join(naming::build_name(name, tags, extension))
    }

    /// Mint a canonical output path in the working directory from the
    /// subject prefix and a role, for outputs with no single source image.
    pub fn role_target(&self, role: &str, tags: &[&str], extension: Option<&str>) -> PathBuf {
        self.working_dir
            .join(naming::role_name(self.subject.as_str(), role, tags, extension))
    }

    /// Scratch path next to `target` that no canonical lookup can match.
    pub fn temp_target(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        target.with_file_name(naming::temp_name(name))
    }

    /// Atomically promote a scratch file to its canonical name.
    pub async fn promote(&self, scratch: &Path, target: &Path) -> Result<(), TaskError> {
        tokio::fs::rename(scratch, target)
            .await
            .map_err(|source| TaskError::io(target, source))
    }

    /// Symlink an upstream image into the working directory unchanged.
    ///
    /// Re-runs find the link already present and leave it alone.
    pub fn link_into_working(&self, source: &Path) -> Result<PathBuf, TaskError> {
        let name = source
            .file_name()
            .ok_or_else(|| TaskError::MissingInput(source.display().to_string()))?;
        let dest = self.working_dir.join(name);
        if dest.symlink_metadata().is_ok() {
            return Ok(dest);
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(source, &dest).map_err(|e| TaskError::io(&dest, e))?;
        #[cfg(not(unix))]
        std::fs::copy(source, &dest).map_err(|e| TaskError::io(&dest, e))?;
        Ok(dest)
    }

    /// Start building an external command with this stage's defaults: the
    /// working directory as cwd, the configured timeout, and the FSL output
    /// format pinned so flirt/fslmaths produce `.nii.gz`.
    pub fn command(&self, program: impl Into<String>) -> ShellCommand {
        let mut cmd = ShellCommand::new(program)
            .current_dir(&self.working_dir)
            .env("FSLOUTPUTTYPE", "NIFTI_GZ");
        if let Some(timeout) = self.config.command_timeout {
            cmd = cmd.timeout(timeout);
        }
        cmd
    }

    /// Build a requirement row pointing at a dependency directory.
    pub fn requirement(
        &self,
        depend: &str,
        description: &str,
        role: &'static str,
        tags: &[&'static str],
        extension: Option<&'static str>,
    ) -> Requirement {
        Requirement {
            description: description.to_string(),
            dir: self.depend_dir(depend).map(Path::to_path_buf),
            role,
            tags: tags.to_vec(),
            extension,
        }
    }

    /// Build an expected-output row pointing at the working directory.
    pub fn output(
        &self,
        description: &str,
        role: &'static str,
        tags: &[&'static str],
        extension: Option<&'static str>,
    ) -> Requirement {
        Requirement {
            description: description.to_string(),
            dir: Some(self.working_dir.clone()),
            role,
            tags: tags.to_vec(),
            extension,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn context(working: &TempDir, depend: Option<(&'static str, &Path)>) -> StageContext {
        let mut dirs = HashMap::new();
        if let Some((name, path)) = depend {
            dirs.insert(name, path.to_path_buf());
        }
        StageContext::new(
            SubjectId::new("sub01"),
            TaskId::new("probe"),
            working.path().to_path_buf(),
            dirs,
            Arc::new(PipelineConfig::default()),
        )
    }

    #[test]
    fn test_find_in_dependency_dir() {
        let dep = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        File::create(dep.path().join("sub01_anat.nii.gz")).unwrap();
        let ctx = context(&working, Some(("backup", dep.path())));

        let found = ctx.find_in("backup", "anat", &[], None).unwrap();
        assert_eq!(found.file_name().unwrap(), "sub01_anat.nii.gz");
        assert!(ctx.find_in("missing", "anat", &[], None).is_none());
    }

    #[test]
    fn test_target_from_appends_tags_in_working_dir() {
        let working = TempDir::new().unwrap();
        let ctx = context(&working, None);

        let target = ctx.target_from(Path::new("/dep/sub01_dwi.nii.gz"), &["stride"], None);
        assert_eq!(target, working.path().join("sub01_dwi_stride.nii.gz"));
    }

    #[test]
    fn test_role_target_uses_subject_prefix() {
        let working = TempDir::new().unwrap();
        let ctx = context(&working, None);

        let target = ctx.role_target("anat", &["extended"], None);
        assert_eq!(target, working.path().join("sub01_anat_extended.nii.gz"));
    }

    #[test]
    fn test_link_into_working_is_idempotent() {
        let dep = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        let source = dep.path().join("sub01_anat.nii.gz");
        File::create(&source).unwrap();
        let ctx = context(&working, Some(("backup", dep.path())));

        let first = ctx.link_into_working(&source).unwrap();
        let second = ctx.link_into_working(&source).unwrap();

        assert_eq!(first, second);
        assert!(first.symlink_metadata().is_ok());
    }

    #[tokio::test]
    async fn test_promote_renames_scratch_over_target() {
        let working = TempDir::new().unwrap();
        let ctx = context(&working, None);
        let target = working.path().join("sub01_anat_extended.nii.gz");
        let scratch = ctx.temp_target(&target);
        std::fs::write(&scratch, b"data").unwrap();

        ctx.promote(&scratch, &target).await.unwrap();

        assert!(target.exists());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_command_carries_fsl_output_type() {
        let working = TempDir::new().unwrap();
        let ctx = context(&working, None);

        let cmd = ctx.command("flirt");
        assert_eq!(cmd.environment().get("FSLOUTPUTTYPE"), Some("NIFTI_GZ"));
        assert_eq!(cmd.program(), "flirt");
    }
}
