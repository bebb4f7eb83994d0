//! Common test utilities shared across integration tests.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use toad::{ConfigFile, PipelineConfig, Subject};

/// A subject tree rooted in a temporary directory.
pub struct SubjectFixture {
    _root: TempDir,
    pub subject: Subject,
    pub backup: PathBuf,
}

/// Create a subject directory with an empty `00-backup`.
pub fn subject_fixture() -> SubjectFixture {
    let root = TempDir::new().unwrap();
    let subject_dir = root.path().join("sub01");
    let backup = subject_dir.join("00-backup");
    fs::create_dir_all(&backup).unwrap();
    let subject = Subject::open(&subject_dir).unwrap();
    SubjectFixture {
        _root: root,
        subject,
        backup,
    }
}

/// Create an empty file.
pub fn touch(dir: &Path, name: &str) {
    File::create(dir.join(name)).unwrap();
}

/// Populate the backup directory with a minimal raw data set carrying a
/// mrtrix `.b` encoding.
pub fn populate_backup_with_b(backup: &Path) {
    touch(backup, "sub01_anat.nii.gz");
    touch(backup, "sub01_dwi.nii.gz");
    fs::write(
        backup.join("sub01_grad.b"),
        "0 0 0 0\n1 0 0 1000\n0 1 0 1000\n",
    )
    .unwrap();
}

/// Populate the backup directory with a minimal raw data set carrying only
/// the FSL `.bvals`/`.bvecs` pair.
pub fn populate_backup_with_fsl_pair(backup: &Path) {
    touch(backup, "sub01_anat.nii.gz");
    touch(backup, "sub01_dwi.nii.gz");
    fs::write(backup.join("sub01_grad.bvecs"), "0 1 0\n0 0 1\n0 0 0\n").unwrap();
    fs::write(backup.join("sub01_grad.bvals"), "0 1000 1000\n").unwrap();
}

/// A configuration that never restrides, so no external tool is needed for
/// the preparation stage.
pub fn no_restride_config() -> PipelineConfig {
    let mut file = ConfigFile::default();
    file.force_realign_strides = false;
    file.validate().unwrap()
}
