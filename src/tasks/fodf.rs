//! fODF reconstruction stage.
//!
//! Fits fiber orientation distribution functions on the upsampled diffusion
//! data and derives scalar metrics from them. The numerical work is
//! delegated to the dipy-backed scilpy command line: one call reconstructs
//! the spherical-harmonic coefficient volume, a second derives the GFA and
//! NUFO maps. Gradient encodings prefer the eddy-corrected tables and fall
//! back to the preparation stage's.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use crate::core::context::StageContext;
use crate::core::task::{all_present, Requirement, Task, TaskError};

/// The fODF reconstruction stage.
pub struct FodfReconstruction;

#[async_trait]
impl Task for FodfReconstruction {
    fn name(&self) -> &'static str {
        "fodf"
    }

    fn order(&self) -> u32 {
        12
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["upsampling", "eddy", "preparation", "masking"]
    }

    fn description(&self) -> &'static str {
        "reconstruct fiber orientation distribution functions and their metrics"
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        vec![
            ctx.requirement("upsampling", "upsampled diffusion weighted", "dwi", &["upsample"], None),
            ctx.requirement("masking", "extended mask", "anat", &["extended", "mask"], None),
        ]
    }

    fn meet_requirement(&self, ctx: &StageContext) -> bool {
        let mut ok = all_present(self.name(), &self.required_inputs(ctx));
        if self.gradient_file(ctx, "bvals").is_none() || self.gradient_file(ctx, "bvecs").is_none()
        {
            tracing::warn!(
                stage = self.name(),
                "no gradient encoding pair found in the eddy or preparation directories"
            );
            ok = false;
        }
        ok
    }

    fn expected_outputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        vec![
            ctx.output("spherical harmonic coefficients", "dwi", &["fodf"], None),
            ctx.output("generalized fractional anisotropy", "dwi", &["gfa"], None),
            ctx.output("number of fiber orientations", "dwi", &["nufo"], None),
        ]
    }

    async fn implement(&self, ctx: &StageContext) -> Result<(), TaskError> {
        let dwi = ctx
            .find_in("upsampling", "dwi", &["upsample"], None)
            .ok_or_else(|| TaskError::MissingInput("upsampled diffusion weighted".to_string()))?;
        let mask = ctx
            .find_in("masking", "anat", &["extended", "mask"], None)
            .ok_or_else(|| TaskError::MissingInput("extended mask".to_string()))?;
        let bvals = self
            .gradient_file(ctx, "bvals")
            .ok_or_else(|| TaskError::MissingInput("gradient .bvals encoding file".to_string()))?;
        let bvecs = self
            .gradient_file(ctx, "bvecs")
            .ok_or_else(|| TaskError::MissingInput("gradient .bvecs encoding file".to_string()))?;

        let fodf = self.reconstruct_fodf(ctx, &dwi, &bvals, &bvecs, &mask).await?;
        self.compute_metrics(ctx, &dwi, &fodf, &mask).await?;
        Ok(())
    }
}

impl FodfReconstruction {
    /// Locate a gradient encoding file, preferring the eddy-corrected table
    /// over the preparation stage's.
    fn gradient_file(&self, ctx: &StageContext, extension: &'static str) -> Option<PathBuf> {
        ctx.find_in("eddy", "grad", &[], Some(extension))
            .or_else(|| ctx.find_in("preparation", "grad", &[], Some(extension)))
    }

    /// Reconstruct the spherical-harmonic coefficient volume.
    async fn reconstruct_fodf(
        &self,
        ctx: &StageContext,
        dwi: &std::path::Path,
        bvals: &std::path::Path,
        bvecs: &std::path::Path,
        mask: &std::path::Path,
    ) -> Result<PathBuf, TaskError> {
        info!("starting fODF reconstruction on {}", dwi.display());
        let target = ctx.target_from(dwi, &["fodf"], None);
        let scratch = ctx.temp_target(&target);

        let mut cmd = ctx
            .command("scil_compute_ssst_fodf.py")
            .arg_path(dwi)
            .arg_path(bvals)
            .arg_path(bvecs)
            .arg_path(&scratch)
            .arg("--mask")
            .arg_path(mask)
            .arg("--sh_order")
            .arg(ctx.config().fodf.sh_order.to_string())
            .arg("-f");
        if let Some(n) = ctx.config().nthreads {
            cmd = cmd.arg("--processes").arg(n.to_string());
        }
        cmd.run().await?;

        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }

    /// Derive the GFA and NUFO maps from the coefficient volume.
    async fn compute_metrics(
        &self,
        ctx: &StageContext,
        dwi: &std::path::Path,
        fodf: &std::path::Path,
        mask: &std::path::Path,
    ) -> Result<(), TaskError> {
        info!("computing fODF metrics from {}", fodf.display());
        let gfa = ctx.target_from(dwi, &["gfa"], None);
        let nufo = ctx.target_from(dwi, &["nufo"], None);
        let gfa_scratch = ctx.temp_target(&gfa);
        let nufo_scratch = ctx.temp_target(&nufo);

        ctx.command("scil_compute_fodf_metrics.py")
            .arg_path(fodf)
            .arg("--mask")
            .arg_path(mask)
            .arg("--not_all")
            .arg("--gfa")
            .arg_path(&gfa_scratch)
            .arg("--nufo")
            .arg_path(&nufo_scratch)
            .arg("-f")
            .run()
            .await?;

        ctx.promote(&gfa_scratch, &gfa).await?;
        ctx.promote(&nufo_scratch, &nufo).await?;
        Ok(())
    }
}
