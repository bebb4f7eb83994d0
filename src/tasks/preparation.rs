//! Preparation stage: stage the raw subject inputs.
//!
//! Links every usable image out of the backup directory into the working
//! directory, synthesizes whichever gradient encoding representation is
//! missing, and restrides any volume whose data layout differs from the
//! configured orientation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::context::StageContext;
use crate::core::task::{all_present, Requirement, Task, TaskError};
use crate::mri::gradients::GradientTable;
use crate::mri::strides::image_strides;
use crate::qa::QaItem;

/// The preparation stage.
pub struct Preparation;

/// Images staged when present: (description, role, tags).
const OPTIONAL_INPUTS: &[(&str, &str, &[&str])] = &[
    ("high resolution", "anat", &[]),
    ("B0 posterior to anterior", "b0_pa", &[]),
    ("B0 anterior to posterior", "b0_ap", &[]),
    ("MR magnitude", "mag", &[]),
    ("MR phase", "phase", &[]),
    ("parcellation", "aparc_aseg", &[]),
    ("freesurfer anatomical", "anat", &["freesurfer"]),
    ("left hemisphere ribbon", "lh_ribbon", &[]),
    ("right hemisphere ribbon", "rh_ribbon", &[]),
    ("brodmann", "brodmann", &[]),
];

#[async_trait]
impl Task for Preparation {
    fn name(&self) -> &'static str {
        "preparation"
    }

    fn order(&self) -> u32 {
        1
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["backup"]
    }

    fn description(&self) -> &'static str {
        "stage raw images and gradient encodings into the pipeline"
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        vec![
            ctx.requirement("backup", "high resolution", "anat", &[], None),
            ctx.requirement("backup", "diffusion weighted", "dwi", &[], None),
        ]
    }

    fn meet_requirement(&self, ctx: &StageContext) -> bool {
        let mut ok = all_present(self.name(), &self.required_inputs(ctx));

        // a mrtrix .b file or the fsl bvals/bvecs pair must exist; either
        // representation can synthesize the other
        let has_mrtrix = ctx.find_in("backup", "grad", &[], Some("b")).is_some();
        let has_fsl = ctx.find_in("backup", "grad", &[], Some("bvals")).is_some()
            && ctx.find_in("backup", "grad", &[], Some("bvecs")).is_some();
        if !has_mrtrix && !has_fsl {
            warn!(
                stage = self.name(),
                "no gradient encoding file found in the backup directory"
            );
            ok = false;
        }
        ok
    }

    fn expected_outputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        vec![
            ctx.output("gradient .bvals encoding file", "grad", &[], Some("bvals")),
            ctx.output("gradient .bvecs encoding file", "grad", &[], Some("bvecs")),
            ctx.output("gradient .b encoding file", "grad", &[], Some("b")),
            ctx.output("high resolution", "anat", &[], None),
            ctx.output("diffusion weighted", "dwi", &[], None),
        ]
    }

    async fn implement(&self, ctx: &StageContext) -> Result<(), TaskError> {
        let dwi = ctx
            .find_in("backup", "dwi", &[], None)
            .ok_or_else(|| TaskError::MissingInput("diffusion weighted".to_string()))?;

        let (b_enc, bvecs, bvals) = self.produce_encoding_files(ctx).await?;

        if self.needs_restride(ctx, &dwi).await? {
            warn!("reorienting strides for image {}", dwi.display());
            self.stride_dwi(ctx, &dwi, &b_enc, &bvecs, &bvals).await?;
        } else {
            ctx.link_into_working(&dwi)?;
        }

        for &(description, role, tags) in OPTIONAL_INPUTS {
            let Some(image) = ctx.find_in("backup", role, tags, None) else {
                continue;
            };
            if self.needs_restride(ctx, &image).await? {
                warn!("reorienting strides for image {}", image.display());
                self.stride_volume(ctx, &image).await?;
            } else {
                info!(
                    "found {} image, linking {} into {}",
                    description,
                    image.display(),
                    ctx.working_dir().display()
                );
                ctx.link_into_working(&image)?;
            }
        }

        Ok(())
    }

    fn qa_supplier(&self, ctx: &StageContext) -> Option<Vec<QaItem>> {
        let anat = ctx.find_output("anat", &[], None)?;
        let dwi = ctx.find_output("dwi", &[], None)?;
        Some(vec![
            QaItem::new(anat, "High resolution anatomical image"),
            QaItem::new(dwi, "Diffusion weighted image"),
        ])
    }
}

impl Preparation {
    /// Check whether an image must be restrided. Only queries the actual
    /// strides when realignment is enabled.
    async fn needs_restride(&self, ctx: &StageContext, image: &Path) -> Result<bool, TaskError> {
        if !ctx.config().force_realign_strides {
            return Ok(false);
        }
        let actual = image_strides(image, ctx).await?;
        Ok(!ctx.config().stride_orientation.matches(&actual))
    }

    /// Ensure all three gradient encoding representations exist in the
    /// working directory: present files are linked unchanged, missing ones
    /// are synthesized from whichever representation is available.
    async fn produce_encoding_files(
        &self,
        ctx: &StageContext,
    ) -> Result<(PathBuf, PathBuf, PathBuf), TaskError> {
        info!("produce .b, .bvals and .bvecs gradient files if not existing");
        let b_enc = ctx.find_in("backup", "grad", &[], Some("b"));
        let bvals = ctx.find_in("backup", "grad", &[], Some("bvals"));
        let bvecs = ctx.find_in("backup", "grad", &[], Some("bvecs"));

        let b_target = match &b_enc {
            Some(path) => ctx.link_into_working(path)?,
            None => {
                let vals = bvals.as_deref().ok_or_else(|| {
                    TaskError::MissingInput("gradient .bvals encoding file".to_string())
                })?;
                let vecs = bvecs.as_deref().ok_or_else(|| {
                    TaskError::MissingInput("gradient .bvecs encoding file".to_string())
                })?;
                let table = GradientTable::read_fsl(vecs, vals)?;
                let target = ctx.target_from(vals, &[], Some("b"));
                table.write_mrtrix(&target)?;
                target
            }
        };

        let bvals_target = match &bvals {
            Some(path) => ctx.link_into_working(path)?,
            None => {
                let table = GradientTable::read_mrtrix(&b_target)?;
                let target = ctx.target_from(&b_target, &[], Some("bvals"));
                table.write_bvals(&target)?;
                target
            }
        };

        let bvecs_target = match &bvecs {
            Some(path) => ctx.link_into_working(path)?,
            None => {
                let table = GradientTable::read_mrtrix(&b_target)?;
                let target = ctx.target_from(&b_target, &[], Some("bvecs"));
                table.write_bvecs(&target)?;
                target
            }
        };

        Ok((b_target, bvecs_target, bvals_target))
    }

    /// Restride the 4-D diffusion image, re-exporting the gradient tables
    /// alongside so directions stay consistent with the new layout.
    async fn stride_dwi(
        &self,
        ctx: &StageContext,
        dwi: &Path,
        b_enc: &Path,
        bvecs: &Path,
        bvals: &Path,
    ) -> Result<(), TaskError> {
        let layout = ctx.config().stride_orientation.as_arg_4d();
        let dwi_target = ctx.target_from(dwi, &["stride"], None);
        let b_target = ctx.target_from(b_enc, &["stride"], None);
        let bvecs_target = ctx.target_from(bvecs, &["stride"], None);
        let bvals_target = ctx.target_from(bvals, &["stride"], None);

        let scratch = ctx.temp_target(&dwi_target);
        ctx.command("mrconvert")
            .arg_path(dwi)
            .arg_path(&scratch)
            .args(["-quiet", "-force", "-stride"])
            .arg(&layout)
            .arg("-grad")
            .arg_path(b_enc)
            .arg("-export_grad_mrtrix")
            .arg_path(&b_target)
            .run()
            .await?;
        ctx.promote(&scratch, &dwi_target).await?;

        let scratch = ctx.temp_target(&dwi_target);
        ctx.command("mrconvert")
            .arg_path(dwi)
            .arg_path(&scratch)
            .args(["-quiet", "-force", "-stride"])
            .arg(&layout)
            .arg("-fslgrad")
            .arg_path(bvecs)
            .arg_path(bvals)
            .arg("-export_grad_fsl")
            .arg_path(&bvecs_target)
            .arg_path(&bvals_target)
            .run()
            .await?;
        ctx.promote(&scratch, &dwi_target).await?;

        Ok(())
    }

    /// Restride a 3-D volume into a copy tagged "stride".
    async fn stride_volume(&self, ctx: &StageContext, image: &Path) -> Result<(), TaskError> {
        let target = ctx.target_from(image, &["stride"], None);
        let scratch = ctx.temp_target(&target);
        ctx.command("mrconvert")
            .arg_path(image)
            .arg_path(&scratch)
            .args(["-quiet", "-force", "-stride"])
            .arg(ctx.config().stride_orientation.as_arg())
            .run()
            .await?;
        ctx.promote(&scratch, &target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::core::types::{SubjectId, TaskId};
    use std::collections::HashMap;
    use std::fs::File;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(backup: &TempDir, working: &TempDir, config: PipelineConfig) -> StageContext {
        let mut dirs = HashMap::new();
        dirs.insert("backup", backup.path().to_path_buf());
        StageContext::new(
            SubjectId::new("sub01"),
            TaskId::new("preparation"),
            working.path().to_path_buf(),
            dirs,
            Arc::new(config),
        )
    }

    fn no_restride_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.force_realign_strides = false;
        config
    }

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn test_meet_requirement_accepts_b_only() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        touch(backup.path(), "sub01_grad.b");
        let ctx = context(&backup, &working, no_restride_config());

        assert!(Preparation.meet_requirement(&ctx));
    }

    #[test]
    fn test_meet_requirement_accepts_fsl_pair_only() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        touch(backup.path(), "sub01_grad.bvals");
        touch(backup.path(), "sub01_grad.bvecs");
        let ctx = context(&backup, &working, no_restride_config());

        assert!(Preparation.meet_requirement(&ctx));
    }

    #[test]
    fn test_meet_requirement_rejects_half_a_pair() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        touch(backup.path(), "sub01_grad.bvals");
        let ctx = context(&backup, &working, no_restride_config());

        assert!(!Preparation.meet_requirement(&ctx));
    }

    #[test]
    fn test_meet_requirement_rejects_missing_anat() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_dwi.nii.gz");
        touch(backup.path(), "sub01_grad.b");
        let ctx = context(&backup, &working, no_restride_config());

        assert!(!Preparation.meet_requirement(&ctx));
    }

    #[tokio::test]
    async fn test_synthesizes_b_from_fsl_pair() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        std::fs::write(backup.path().join("sub01_grad.bvecs"), "0 1 0\n0 0 1\n0 0 0\n").unwrap();
        std::fs::write(backup.path().join("sub01_grad.bvals"), "0 1000 1000\n").unwrap();
        let ctx = context(&backup, &working, no_restride_config());

        Preparation.implement(&ctx).await.unwrap();

        // the .b file is synthesized, the pair is linked unchanged
        let b = working.path().join("sub01_grad.b");
        assert!(b.is_file());
        assert!(!b.symlink_metadata().unwrap().file_type().is_symlink());
        let bvals = working.path().join("sub01_grad.bvals");
        assert!(bvals.symlink_metadata().unwrap().file_type().is_symlink());
        let bvecs = working.path().join("sub01_grad.bvecs");
        assert!(bvecs.symlink_metadata().unwrap().file_type().is_symlink());

        let table = GradientTable::read_mrtrix(&b).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn test_synthesizes_fsl_pair_from_b() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        std::fs::write(
            backup.path().join("sub01_grad.b"),
            "0 0 0 0\n1 0 0 1000\n0 1 0 1000\n",
        )
        .unwrap();
        let ctx = context(&backup, &working, no_restride_config());

        Preparation.implement(&ctx).await.unwrap();

        let b = working.path().join("sub01_grad.b");
        assert!(b.symlink_metadata().unwrap().file_type().is_symlink());
        let bvals = working.path().join("sub01_grad.bvals");
        let bvecs = working.path().join("sub01_grad.bvecs");
        assert!(bvals.is_file());
        assert!(bvecs.is_file());

        let table = GradientTable::read_fsl(&bvecs, &bvals).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn test_implement_links_images_and_satisfies_is_dirty() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        touch(backup.path(), "sub01_b0_pa.nii.gz");
        std::fs::write(
            backup.path().join("sub01_grad.b"),
            "0 0 0 0\n1 0 0 1000\n",
        )
        .unwrap();
        let ctx = context(&backup, &working, no_restride_config());

        assert!(Preparation.is_dirty(&ctx));
        Preparation.implement(&ctx).await.unwrap();
        assert!(!Preparation.is_dirty(&ctx));

        assert!(working.path().join("sub01_anat.nii.gz").exists());
        assert!(working.path().join("sub01_dwi.nii.gz").exists());
        assert!(working.path().join("sub01_b0_pa.nii.gz").exists());
    }

    #[tokio::test]
    async fn test_implement_is_safe_to_re_invoke() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        std::fs::write(
            backup.path().join("sub01_grad.b"),
            "0 0 0 0\n1 0 0 1000\n",
        )
        .unwrap();
        let ctx = context(&backup, &working, no_restride_config());

        Preparation.implement(&ctx).await.unwrap();
        Preparation.implement(&ctx).await.unwrap();

        assert!(!Preparation.is_dirty(&ctx));
    }

    #[test]
    fn test_is_dirty_accepts_stride_tagged_outputs() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        let ctx = context(&backup, &working, PipelineConfig::default());

        // state after a restriding run: no bare dwi/anat, only "stride"
        // tagged copies next to the canonical gradient files
        touch(working.path(), "sub01_dwi_stride.nii.gz");
        touch(working.path(), "sub01_anat_stride.nii.gz");
        touch(working.path(), "sub01_grad.b");
        touch(working.path(), "sub01_grad.bvals");
        touch(working.path(), "sub01_grad.bvecs");

        assert!(!Preparation.is_dirty(&ctx));
        assert!(!working.path().join("sub01_dwi.nii.gz").exists());
    }

    #[tokio::test]
    async fn test_qa_supplier_after_implement() {
        let backup = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        touch(backup.path(), "sub01_anat.nii.gz");
        touch(backup.path(), "sub01_dwi.nii.gz");
        std::fs::write(
            backup.path().join("sub01_grad.b"),
            "0 0 0 0\n1 0 0 1000\n",
        )
        .unwrap();
        let ctx = context(&backup, &working, no_restride_config());

        assert!(Preparation.qa_supplier(&ctx).is_none());
        Preparation.implement(&ctx).await.unwrap();

        let items = Preparation.qa_supplier(&ctx).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].caption, "High resolution anatomical image");
    }
}
