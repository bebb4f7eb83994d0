//! Registration stage: align the anatomical space onto the diffusion space.
//!
//! Computes the b0-to-anatomical transform with flirt, inverts it, and
//! applies it (through flirt for resampling, through mrtransform after
//! matrix import for mrtrix-space registration) to the anatomical volumes,
//! the parcellation, the hemisphere ribbons and the brodmann atlas.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::context::StageContext;
use crate::core::task::{Requirement, Task, TaskError};

/// The registration stage.
pub struct Registration;

#[async_trait]
impl Task for Registration {
    fn name(&self) -> &'static str {
        "registration"
    }

    fn order(&self) -> u32 {
        6
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["preprocessing", "parcellation"]
    }

    fn description(&self) -> &'static str {
        "register anatomical and parcellation volumes onto the diffusion space"
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        vec![
            ctx.requirement("parcellation", "high resolution", "anat", &["freesurfer"], None),
            ctx.requirement(
                "preprocessing",
                "freesurfer anatomical brain extracted",
                "anat",
                &["brain"],
                None,
            ),
            ctx.requirement(
                "preprocessing",
                "white matter segmented anatomical brain",
                "anat",
                &["brain", "wm"],
                None,
            ),
            ctx.requirement("preprocessing", "b0 upsampled", "b0", &["upsample"], None),
            ctx.requirement("preprocessing", "b0 2x2x2", "b0", &["2x2x2"], None),
            ctx.requirement("parcellation", "parcellation", "aparc_aseg", &[], None),
            ctx.requirement("parcellation", "right hemisphere ribbon", "rh_ribbon", &[], None),
            ctx.requirement("parcellation", "left hemisphere ribbon", "lh_ribbon", &[], None),
            ctx.requirement("parcellation", "brodmann", "brodmann", &[], None),
        ]
    }

    fn expected_outputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        vec![
            ctx.output("anatomical brain resampled", "anat", &["brain", "resample"], None),
            ctx.output("anatomical resampled", "anat", &["resample"], None),
            ctx.output(
                "white matter segmented anatomical brain resampled",
                "anat",
                &["brain", "wm", "resample"],
                None,
            ),
            ctx.output("anatomical 2x2x2 brain for dtifit", "anat", &["brain", "2x2x2"], None),
            ctx.output("parcellation 2x2x2 for dtifit", "aparc_aseg", &["2x2x2"], None),
            ctx.output("parcellation resample", "aparc_aseg", &["resample"], None),
            ctx.output("parcellation register", "aparc_aseg", &["register"], None),
            ctx.output(
                "brodmann register left hemisphere",
                "brodmann",
                &["register", "left_hemisphere"],
                None,
            ),
            ctx.output(
                "brodmann register right hemisphere",
                "brodmann",
                &["register", "right_hemisphere"],
                None,
            ),
        ]
    }

    async fn implement(&self, ctx: &StageContext) -> Result<(), TaskError> {
        let b0 = self.input(ctx, "preprocessing", "b0 upsampled", "b0", &["upsample"])?;
        let b0_2x2x2 = self.input(ctx, "preprocessing", "b0 2x2x2", "b0", &["2x2x2"])?;
        let anat = self.input(ctx, "parcellation", "high resolution", "anat", &["freesurfer"])?;
        let anat_brain = self.input(
            ctx,
            "preprocessing",
            "freesurfer anatomical brain extracted",
            "anat",
            &["brain"],
        )?;
        let anat_brain_wm = self.input(
            ctx,
            "preprocessing",
            "white matter segmented anatomical brain",
            "anat",
            &["brain", "wm"],
        )?;
        let aparc_aseg = self.input(ctx, "parcellation", "parcellation", "aparc_aseg", &[])?;
        let rh_ribbon = self.input(ctx, "parcellation", "right hemisphere ribbon", "rh_ribbon", &[])?;
        let lh_ribbon = self.input(ctx, "parcellation", "left hemisphere ribbon", "lh_ribbon", &[])?;
        let brodmann = self.input(ctx, "parcellation", "brodmann", "brodmann", &[])?;

        let b0_to_anat = self.compute_transform(ctx, &b0, &anat).await?;
        let b0_to_anat_inverse = self.invert_matrix(ctx, &b0_to_anat).await?;

        self.resample(ctx, &anat, &b0, &b0_to_anat_inverse).await?;
        let mrtrix_matrix = self
            .import_matrix_for_mrtrix(ctx, &anat, &b0, &b0_to_anat_inverse)
            .await?;

        self.resample(ctx, &anat_brain, &b0, &b0_to_anat_inverse).await?;
        self.resample(ctx, &anat_brain_wm, &b0, &b0_to_anat_inverse).await?;
        self.register(ctx, &aparc_aseg, &mrtrix_matrix).await?;
        self.resample(ctx, &aparc_aseg, &b0, &b0_to_anat_inverse).await?;

        let b0_2x2x2_to_anat = self.compute_transform(ctx, &b0_2x2x2, &anat).await?;
        let b0_2x2x2_to_anat_inverse = self.invert_matrix(ctx, &b0_2x2x2_to_anat).await?;
        self.apply_transform(
            ctx,
            &aparc_aseg,
            &b0_2x2x2,
            &b0_2x2x2_to_anat_inverse,
            &ctx.target_from(&aparc_aseg, &["2x2x2"], None),
        )
        .await?;
        self.apply_transform(
            ctx,
            &anat_brain,
            &b0_2x2x2,
            &b0_2x2x2_to_anat_inverse,
            &ctx.target_from(&anat_brain, &["2x2x2"], None),
        )
        .await?;

        let brodmann_register = self.register(ctx, &brodmann, &mrtrix_matrix).await?;
        self.resample(ctx, &brodmann, &b0, &b0_to_anat_inverse).await?;

        let lh_ribbon_register = self.register(ctx, &lh_ribbon, &mrtrix_matrix).await?;
        let rh_ribbon_register = self.register(ctx, &rh_ribbon, &mrtrix_matrix).await?;
        self.resample(ctx, &lh_ribbon, &b0, &b0_to_anat_inverse).await?;
        self.resample(ctx, &rh_ribbon, &b0, &b0_to_anat_inverse).await?;

        self.multiply(
            ctx,
            &brodmann_register,
            &lh_ribbon_register,
            &ctx.target_from(&brodmann_register, &["left_hemisphere"], None),
        )
        .await?;
        self.multiply(
            ctx,
            &brodmann_register,
            &rh_ribbon_register,
            &ctx.target_from(&brodmann_register, &["right_hemisphere"], None),
        )
        .await?;

        Ok(())
    }
}

impl Registration {
    fn input(
        &self,
        ctx: &StageContext,
        depend: &str,
        description: &str,
        role: &'static str,
        tags: &[&str],
    ) -> Result<PathBuf, TaskError> {
        ctx.find_in(depend, role, tags, None)
            .ok_or_else(|| TaskError::MissingInput(description.to_string()))
    }

    /// Estimate the source-to-reference transform with flirt, leaving a
    /// `.mat` matrix and a resampled check image tagged "transformation".
    async fn compute_transform(
        &self,
        ctx: &StageContext,
        source: &Path,
        reference: &Path,
    ) -> Result<PathBuf, TaskError> {
        info!("starting flirt registration of {}", source.display());
        let matrix = ctx.target_from(source, &["transformation"], Some("mat"));
        let out = ctx.target_from(source, &["transformation"], None);
        let matrix_scratch = ctx.temp_target(&matrix);
        let out_scratch = ctx.temp_target(&out);

        ctx.command("flirt")
            .arg("-in")
            .arg_path(source)
            .arg("-ref")
            .arg_path(reference)
            .arg("-cost")
            .arg(ctx.config().registration.cost.as_flag())
            .arg("-omat")
            .arg_path(&matrix_scratch)
            .arg("-out")
            .arg_path(&out_scratch)
            .run()
            .await?;

        ctx.promote(&matrix_scratch, &matrix).await?;
        ctx.promote(&out_scratch, &out).await?;
        Ok(matrix)
    }

    /// Invert an FSL transform matrix.
    async fn invert_matrix(&self, ctx: &StageContext, matrix: &Path) -> Result<PathBuf, TaskError> {
        let target = ctx.target_from(matrix, &["inverse"], Some("mat"));
        let scratch = ctx.temp_target(&target);

        ctx.command("convert_xfm")
            .arg("-omat")
            .arg_path(&scratch)
            .arg("-inverse")
            .arg_path(matrix)
            .run()
            .await?;

        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }

    /// Apply an FSL matrix to resample `source` into the reference grid.
    async fn apply_transform(
        &self,
        ctx: &StageContext,
        source: &Path,
        reference: &Path,
        matrix: &Path,
        target: &Path,
    ) -> Result<(), TaskError> {
        let scratch = ctx.temp_target(target);
        ctx.command("flirt")
            .arg("-in")
            .arg_path(source)
            .arg("-ref")
            .arg_path(reference)
            .arg("-applyxfm")
            .arg("-init")
            .arg_path(matrix)
            .arg("-out")
            .arg_path(&scratch)
            .run()
            .await?;
        ctx.promote(&scratch, target).await
    }

    /// Resample `source` against the reference, tagging the output
    /// "resample".
    async fn resample(
        &self,
        ctx: &StageContext,
        source: &Path,
        reference: &Path,
        matrix: &Path,
    ) -> Result<(), TaskError> {
        let target = ctx.target_from(source, &["resample"], None);
        self.apply_transform(ctx, source, reference, matrix, &target)
            .await
    }

    /// Convert an FSL matrix into mrtrix convention.
    async fn import_matrix_for_mrtrix(
        &self,
        ctx: &StageContext,
        source: &Path,
        reference: &Path,
        matrix: &Path,
    ) -> Result<PathBuf, TaskError> {
        let target = ctx.target_from(matrix, &["mrtrix"], Some("mat"));
        let scratch = ctx.temp_target(&target);

        ctx.command("transformcalc")
            .arg("-flirt_import")
            .arg_path(source)
            .arg_path(reference)
            .arg_path(matrix)
            .arg_path(&scratch)
            .arg("-quiet")
            .run()
            .await?;

        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }

    /// Apply a mrtrix linear transform, tagging the output "register".
    async fn register(
        &self,
        ctx: &StageContext,
        source: &Path,
        matrix: &Path,
    ) -> Result<PathBuf, TaskError> {
        let target = ctx.target_from(source, &["register"], None);
        let scratch = ctx.temp_target(&target);

        ctx.command("mrtransform")
            .arg_path(source)
            .arg("-linear")
            .arg_path(matrix)
            .arg_path(&scratch)
            .arg("-quiet")
            .run()
            .await?;

        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }

    /// Voxelwise product of two volumes.
    async fn multiply(
        &self,
        ctx: &StageContext,
        source: &Path,
        ribbon: &Path,
        target: &Path,
    ) -> Result<(), TaskError> {
        let scratch = ctx.temp_target(target);
        ctx.command("mrcalc")
            .arg_path(source)
            .arg_path(ribbon)
            .arg("-mult")
            .arg_path(&scratch)
            .arg("-quiet")
            .run()
            .await?;
        ctx.promote(&scratch, target).await
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

    fn populate_inputs(preprocessing: &Path, parcellation: &Path) {
        for name in [
            "sub01_anat_brain.nii.gz",
            "sub01_anat_brain_wm.nii.gz",
            "sub01_b0_upsample.nii.gz",
            "sub01_b0_2x2x2.nii.gz",
        ] {
            File::create(preprocessing.join(name)).unwrap();
        }
        for name in [
            "sub01_anat_freesurfer.nii.gz",
            "sub01_aparc_aseg.nii.gz",
            "sub01_rh_ribbon.nii.gz",
            "sub01_lh_ribbon.nii.gz",
            "sub01_brodmann.nii.gz",
        ] {
            File::create(parcellation.join(name)).unwrap();
        }
    }

    fn context(
        preprocessing: &TempDir,
        parcellation: &TempDir,
        working: &TempDir,
    ) -> StageContext {
        let mut dirs = HashMap::new();
        dirs.insert("preprocessing", preprocessing.path().to_path_buf());
        dirs.insert("parcellation", parcellation.path().to_path_buf());
        StageContext::new(
            SubjectId::new("sub01"),
            TaskId::new("registration"),
            working.path().to_path_buf(),
            dirs,
            Arc::new(PipelineConfig::default()),
        )
    }

    #[test]
    fn test_meet_requirement_with_all_inputs() {
        let preprocessing = TempDir::new().unwrap();
        let parcellation = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        populate_inputs(preprocessing.path(), parcellation.path());
        let ctx = context(&preprocessing, &parcellation, &working);

        assert!(Registration.meet_requirement(&ctx));
    }

    #[test]
    fn test_meet_requirement_missing_ribbon() {
        let preprocessing = TempDir::new().unwrap();
        let parcellation = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        populate_inputs(preprocessing.path(), parcellation.path());
        std::fs::remove_file(parcellation.path().join("sub01_lh_ribbon.nii.gz")).unwrap();
        let ctx = context(&preprocessing, &parcellation, &working);

        assert!(!Registration.meet_requirement(&ctx));
    }

    #[test]
    fn test_is_dirty_tracks_each_output() {
        let preprocessing = TempDir::new().unwrap();
        let parcellation = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        let ctx = context(&preprocessing, &parcellation, &working);

        assert!(Registration.is_dirty(&ctx));

        for name in [
            "sub01_anat_brain_resample.nii.gz",
            "sub01_anat_freesurfer_resample.nii.gz",
            "sub01_anat_brain_wm_resample.nii.gz",
            "sub01_anat_brain_2x2x2.nii.gz",
            "sub01_aparc_aseg_2x2x2.nii.gz",
            "sub01_aparc_aseg_resample.nii.gz",
            "sub01_aparc_aseg_register.nii.gz",
            "sub01_brodmann_register_left_hemisphere.nii.gz",
        ] {
            File::create(working.path().join(name)).unwrap();
        }
        // one output still missing
        assert!(Registration.is_dirty(&ctx));

        File::create(
            working
                .path()
                .join("sub01_brodmann_register_right_hemisphere.nii.gz"),
        )
        .unwrap();
        assert!(!Registration.is_dirty(&ctx));
    }

    #[tokio::test]
    async fn test_failed_command_leaves_no_canonical_output() {
        let preprocessing = TempDir::new().unwrap();
        let parcellation = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        populate_inputs(preprocessing.path(), parcellation.path());
        let ctx = context(&preprocessing, &parcellation, &working);

        // flirt is not installed in the test environment, so the first
        // command fails to launch; the stage must surface the error and
        // leave nothing under a canonical name
        let err = Registration.implement(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::CommandLaunch { .. } | TaskError::CommandFailed { .. }
        ));

        assert!(ctx.find_output("anat", &["resample"], None).is_none());
        assert!(ctx.find_output("aparc_aseg", &["register"], None).is_none());
        assert!(Registration.is_dirty(&ctx));
    }
}
