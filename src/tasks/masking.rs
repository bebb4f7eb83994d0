//! Masking stage: derive the binary masks used for tractography seeding.
//!
//! Produces binary masks of the registered volumes, the "extended" sum of
//! anatomy and parcellation, optional per-region seed masks, the
//! five-tissue-type (act) segmentation, its white-matter volume, and the
//! grey-matter/white-matter interface seeding mask.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{SeedKind, SeedList};
use crate::core::context::StageContext;
use crate::core::task::{Requirement, Task, TaskError};
use crate::execution::command::ShellCommand;

/// The masking stage.
pub struct Masking;

#[async_trait]
impl Task for Masking {
    fn name(&self) -> &'static str {
        "masking"
    }

    fn order(&self) -> u32 {
        7
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["registration"]
    }

    fn description(&self) -> &'static str {
        "create tractography masks from the registered volumes"
    }

    fn required_inputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        vec![
            ctx.requirement(
                "registration",
                "resampled parcellation",
                "aparc_aseg",
                &["resample"],
                None,
            ),
            ctx.requirement(
                "registration",
                "brain extracted, white matter segmented, resampled high resolution",
                "anat",
                &["brain", "wm", "resample"],
                None,
            ),
            ctx.requirement(
                "registration",
                "brain extracted, resampled high resolution",
                "anat",
                &["brain", "resample"],
                None,
            ),
        ]
    }

    fn expected_outputs(&self, ctx: &StageContext) -> Vec<Requirement> {
        let mut outputs = vec![
            ctx.output(
                "parcellation resample mask",
                "aparc_aseg",
                &["resample", "mask"],
                None,
            ),
            ctx.output(
                "anatomically constrained tractography 5tt volume",
                "aparc_aseg",
                &["act"],
                None,
            ),
            ctx.output(
                "white matter mask from act",
                "aparc_aseg",
                &["act", "wm", "mask"],
                None,
            ),
            ctx.output(
                "seeding streamlines 5tt2gmwmi mask",
                "aparc_aseg",
                &["5tt2gmwmi"],
                None,
            ),
            ctx.output(
                "white matter segmented, resampled mask",
                "anat",
                &["brain", "wm", "resample", "mask"],
                None,
            ),
            ctx.output("extended mask", "anat", &["extended", "mask"], None),
        ];

        // seed-derived outputs are only expected when their option is set
        for kind in SeedKind::ALL {
            if ctx.config().masking.seeds(kind).is_empty() {
                continue;
            }
            outputs.push(ctx.output(
                &format!("{} seed regions", kind.tag()),
                "aparc_aseg",
                match kind {
                    SeedKind::Start => &["resample", "start", "extract"],
                    SeedKind::Stop => &["resample", "stop", "extract"],
                    SeedKind::Exclude => &["resample", "exclude", "extract"],
                },
                None,
            ));
            outputs.push(ctx.output(
                &format!("{} seed regions mask", kind.tag()),
                "aparc_aseg",
                match kind {
                    SeedKind::Start => &["resample", "start", "extract", "mask"],
                    SeedKind::Stop => &["resample", "stop", "extract", "mask"],
                    SeedKind::Exclude => &["resample", "exclude", "extract", "mask"],
                },
                None,
            ));
        }

        outputs
    }

    async fn implement(&self, ctx: &StageContext) -> Result<(), TaskError> {
        let aparc_aseg = ctx
            .find_in("registration", "aparc_aseg", &["resample"], None)
            .ok_or_else(|| TaskError::MissingInput("resampled parcellation".to_string()))?;
        let anat_brain_resample = ctx
            .find_in("registration", "anat", &["brain", "resample"], None)
            .ok_or_else(|| {
                TaskError::MissingInput("brain extracted, resampled high resolution".to_string())
            })?;
        let anat_brain_wm_resample = ctx
            .find_in("registration", "anat", &["brain", "wm", "resample"], None)
            .ok_or_else(|| {
                TaskError::MissingInput(
                    "brain extracted, white matter segmented, resampled high resolution"
                        .to_string(),
                )
            })?;

        self.binary_mask(ctx, &anat_brain_wm_resample).await?;

        let extended = ctx.role_target("anat", &["extended"], None);
        info!(
            "add {} and {} images together into the extended volume",
            anat_brain_resample.display(),
            aparc_aseg.display()
        );
        self.add_volumes(ctx, &anat_brain_resample, &aparc_aseg, &extended)
            .await?;
        self.binary_mask(ctx, &extended).await?;

        self.binary_mask(ctx, &aparc_aseg).await?;

        // optional per-region seed masks
        for kind in SeedKind::ALL {
            let seeds = ctx.config().masking.seeds(kind).clone();
            if !seeds.is_empty() {
                self.region_mask(ctx, &aparc_aseg, kind, &seeds).await?;
            }
        }

        let act = self.prepare_act(ctx, &aparc_aseg).await?;
        self.extract_white_matter(ctx, &act).await?;
        self.seeding_interface(ctx, &act).await?;

        Ok(())
    }
}

impl Masking {
    /// Append the configured thread-count hint, for the mrtrix tools that
    /// accept one.
    fn with_threads(&self, ctx: &StageContext, cmd: ShellCommand) -> ShellCommand {
        match ctx.config().nthreads {
            Some(n) => cmd.arg("-nthreads").arg(n.to_string()),
            None => cmd,
        }
    }

    /// Binarize a volume into a mask tagged "mask".
    async fn binary_mask(&self, ctx: &StageContext, source: &Path) -> Result<PathBuf, TaskError> {
        info!("create mask from {}", source.display());
        let target = ctx.target_from(source, &["mask"], None);
        let scratch = ctx.temp_target(&target);
        ctx.command("fslmaths")
            .arg_path(source)
            .arg("-bin")
            .arg_path(&scratch)
            .run()
            .await?;
        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }

    /// Voxelwise sum of two volumes.
    async fn add_volumes(
        &self,
        ctx: &StageContext,
        first: &Path,
        second: &Path,
        target: &Path,
    ) -> Result<(), TaskError> {
        let scratch = ctx.temp_target(target);
        ctx.command("fslmaths")
            .arg_path(first)
            .arg("-add")
            .arg_path(second)
            .arg_path(&scratch)
            .run()
            .await?;
        ctx.promote(&scratch, target).await
    }

    /// Extract the configured regions from the parcellation into a volume
    /// tagged with the seed kind, then binarize it.
    async fn region_mask(
        &self,
        ctx: &StageContext,
        source: &Path,
        kind: SeedKind,
        seeds: &SeedList,
    ) -> Result<(), TaskError> {
        info!(
            "extract {} regions {:?} from {}",
            kind.tag(),
            seeds.regions(),
            source.display()
        );
        let target = ctx.target_from(source, &[kind.tag(), "extract"], None);
        let scratch = ctx.temp_target(&target);

        // mrcalc equality against each label, summed into one volume
        let mut cmd = ctx.command("mrcalc");
        for (i, region) in seeds.regions().iter().enumerate() {
            cmd = cmd.arg_path(source).arg(region.to_string()).arg("-eq");
            if i > 0 {
                cmd = cmd.arg("-add");
            }
        }
        cmd.arg_path(&scratch).arg("-quiet").run().await?;
        ctx.promote(&scratch, &target).await?;

        self.binary_mask(ctx, &target).await?;
        Ok(())
    }

    /// Create the five-tissue-type segmented volume suitable for
    /// anatomically constrained tractography.
    async fn prepare_act(&self, ctx: &StageContext, source: &Path) -> Result<PathBuf, TaskError> {
        info!(
            "starting act_anat_prepare_freesurfer creation on {}",
            source.display()
        );
        let target = ctx.target_from(source, &["act"], None);
        let scratch = ctx.temp_target(&target);

        ctx.command("act_anat_prepare_freesurfer")
            .arg_path(source)
            .arg_path(&scratch)
            .run()
            .await?;

        info!("renaming {} to {}", scratch.display(), target.display());
        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }

    /// Cut the white-matter volume out of the act image along the
    /// configured axis.
    async fn extract_white_matter(
        &self,
        ctx: &StageContext,
        act: &Path,
    ) -> Result<PathBuf, TaskError> {
        let target = ctx.target_from(act, &["wm", "mask"], None);
        let scratch = ctx.temp_target(&target);
        let options = &ctx.config().masking;

        let cmd = ctx
            .command("mrconvert")
            .arg_path(act)
            .arg_path(&scratch)
            .arg("-coord")
            .arg(options.act_extract_at_axis.to_string())
            .arg(options.act_extract_at_coordinate.to_string())
            .arg("-quiet");
        self.with_threads(ctx, cmd).run().await?;

        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }

    /// Generate the grey-matter/white-matter interface seeding mask.
    async fn seeding_interface(
        &self,
        ctx: &StageContext,
        act: &Path,
    ) -> Result<PathBuf, TaskError> {
        info!("starting 5tt2gmwmi creation on {}", act.display());
        let target = ctx.target_from(act, &["5tt2gmwmi"], None);
        let scratch = ctx.temp_target(&target);

        let cmd = ctx
            .command("5tt2gmwmi")
            .arg_path(act)
            .arg_path(&scratch)
            .arg("-quiet");
        self.with_threads(ctx, cmd).run().await?;

        info!("renaming {} to {}", scratch.display(), target.display());
        ctx.promote(&scratch, &target).await?;
        Ok(target)
    }
}
