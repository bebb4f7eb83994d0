//! Configuration type definitions.
//!
//! Configuration is deserialized from YAML into the raw [`ConfigFile`]
//! shape, then validated once into the typed [`PipelineConfig`] before any
//! stage runs. Malformed option values are load-time errors carrying the
//! offending option name, never mid-run failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ConfigError;
use crate::mri::strides::StrideLayout;

/// Raw configuration as written in `toad.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Expected data stride layout, e.g. `"1,2,3"`.
    pub stride_orientation: String,
    /// Restride inputs whose layout differs from `stride_orientation`.
    pub force_realign_strides: bool,
    /// Thread-count hint passed through to tools that accept one.
    pub nthreads: Option<u32>,
    /// Upper bound on any single external command, in seconds.
    pub command_timeout_secs: Option<u64>,
    /// Registration stage options.
    pub registration: RegistrationSection,
    /// Masking stage options.
    pub masking: MaskingSection,
    /// fODF reconstruction stage options.
    pub fodf: FodfSection,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            stride_orientation: "1,2,3".to_string(),
            force_realign_strides: true,
            nthreads: None,
            command_timeout_secs: Some(14_400),
            registration: RegistrationSection::default(),
            masking: MaskingSection::default(),
            fodf: FodfSection::default(),
        }
    }
}

/// Raw `registration:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSection {
    /// flirt cost function name.
    pub cost: String,
}

impl Default for RegistrationSection {
    fn default() -> Self {
        Self {
            cost: "corratio".to_string(),
        }
    }
}

/// Raw `masking:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingSection {
    /// Comma-separated region labels to extract as tracking start seeds.
    pub start_seeds: String,
    /// Comma-separated region labels to extract as tracking stop seeds.
    pub stop_seeds: String,
    /// Comma-separated region labels to extract as exclusion seeds.
    pub exclude_seeds: String,
    /// Axis along which the white-matter volume is cut out of the
    /// five-tissue-type image.
    pub act_extract_at_axis: Option<u32>,
    /// Coordinate of the white-matter volume along that axis.
    pub act_extract_at_coordinate: Option<u32>,
}

/// Raw `fodf:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FodfSection {
    /// Spherical harmonic order of the reconstruction.
    pub sh_order: u32,
}

impl Default for FodfSection {
    fn default() -> Self {
        Self { sh_order: 8 }
    }
}

impl ConfigFile {
    /// Validate the raw file into a typed [`PipelineConfig`].
    pub fn validate(self) -> Result<PipelineConfig, ConfigError> {
        let stride_orientation: StrideLayout =
            self.stride_orientation
                .parse()
                .map_err(|reason| ConfigError::InvalidOption {
                    option: "stride_orientation".to_string(),
                    value: self.stride_orientation.clone(),
                    reason,
                })?;

        let cost = CostFunction::parse(&self.registration.cost)?;

        let masking = MaskingOptions {
            start_seeds: SeedList::parse("masking.start_seeds", &self.masking.start_seeds)?,
            stop_seeds: SeedList::parse("masking.stop_seeds", &self.masking.stop_seeds)?,
            exclude_seeds: SeedList::parse("masking.exclude_seeds", &self.masking.exclude_seeds)?,
            act_extract_at_axis: self.masking.act_extract_at_axis.unwrap_or(3),
            act_extract_at_coordinate: self.masking.act_extract_at_coordinate.unwrap_or(2),
        };
        if masking.act_extract_at_axis > 3 {
            return Err(ConfigError::InvalidOption {
                option: "masking.act_extract_at_axis".to_string(),
                value: masking.act_extract_at_axis.to_string(),
                reason: "expected an axis in 0..=3".to_string(),
            });
        }

        Ok(PipelineConfig {
            stride_orientation,
            force_realign_strides: self.force_realign_strides,
            nthreads: self.nthreads,
            command_timeout: self.command_timeout_secs.map(Duration::from_secs),
            registration: RegistrationOptions { cost },
            masking,
            fodf: FodfOptions {
                sh_order: self.fodf.sh_order,
            },
        })
    }
}

/// Validated pipeline configuration, shared by every stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Expected data stride layout.
    pub stride_orientation: StrideLayout,
    /// Restride inputs whose layout differs from the expected one.
    pub force_realign_strides: bool,
    /// Thread-count hint passed through to tools that accept one.
    pub nthreads: Option<u32>,
    /// Upper bound on any single external command.
    pub command_timeout: Option<Duration>,
    /// Registration stage options.
    pub registration: RegistrationOptions,
    /// Masking stage options.
    pub masking: MaskingOptions,
    /// fODF reconstruction stage options.
    pub fodf: FodfOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // The raw defaults always validate.
        match ConfigFile::default().validate() {
            Ok(config) => config,
            Err(_) => unreachable!("default configuration is valid"),
        }
    }
}

/// Validated registration options.
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// flirt cost function.
    pub cost: CostFunction,
}

/// Validated masking options.
#[derive(Debug, Clone)]
pub struct MaskingOptions {
    pub start_seeds: SeedList,
    pub stop_seeds: SeedList,
    pub exclude_seeds: SeedList,
    pub act_extract_at_axis: u32,
    pub act_extract_at_coordinate: u32,
}

impl MaskingOptions {
    /// The seed list configured for a given seed kind.
    pub fn seeds(&self, kind: SeedKind) -> &SeedList {
        match kind {
            SeedKind::Start => &self.start_seeds,
            SeedKind::Stop => &self.stop_seeds,
            SeedKind::Exclude => &self.exclude_seeds,
        }
    }
}

/// Validated fODF options.
#[derive(Debug, Clone)]
pub struct FodfOptions {
    pub sh_order: u32,
}

/// The three kinds of tracking seed masks a configuration may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    Start,
    Stop,
    Exclude,
}

impl SeedKind {
    pub const ALL: [SeedKind; 3] = [SeedKind::Start, SeedKind::Stop, SeedKind::Exclude];

    /// The filename tag used for volumes derived from this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            SeedKind::Start => "start",
            SeedKind::Stop => "stop",
            SeedKind::Exclude => "exclude",
        }
    }
}

/// A parsed comma-separated list of parcellation region labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedList {
    regions: Vec<u32>,
}

impl SeedList {
    /// Parse a comma-separated label list. Empty and whitespace-only input
    /// yields an empty list; anything non-integer is a load-time error
    /// naming the option.
    pub fn parse(option: &str, value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let regions = trimmed
            .split(',')
            .map(|tok| {
                tok.trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidOption {
                        option: option.to_string(),
                        value: value.to_string(),
                        reason: format!("'{}' is not an integer region label", tok.trim()),
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { regions })
    }

    /// Region labels in the order given.
    pub fn regions(&self) -> &[u32] {
        &self.regions
    }

    /// Check whether no regions were configured.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// flirt registration cost functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostFunction {
    MutualInfo,
    CorRatio,
    NormCorr,
    NormMi,
    LeastSq,
    BoundaryBased,
}

impl CostFunction {
    /// Parse a cost function name as accepted by flirt's `-cost` flag.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "mutualinfo" => Ok(Self::MutualInfo),
            "corratio" => Ok(Self::CorRatio),
            "normcorr" => Ok(Self::NormCorr),
            "normmi" => Ok(Self::NormMi),
            "leastsq" => Ok(Self::LeastSq),
            "bbr" => Ok(Self::BoundaryBased),
            other => Err(ConfigError::InvalidOption {
                option: "registration.cost".to_string(),
                value: other.to_string(),
                reason: "expected one of mutualinfo, corratio, normcorr, normmi, leastsq, bbr"
                    .to_string(),
            }),
        }
    }

    /// The flag value passed to flirt.
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::MutualInfo => "mutualinfo",
            Self::CorRatio => "corratio",
            Self::NormCorr => "normcorr",
            Self::NormMi => "normmi",
            Self::LeastSq => "leastsq",
            Self::BoundaryBased => "bbr",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = ConfigFile::default().validate().unwrap();
        assert_eq!(config.stride_orientation.as_arg(), "1,2,3");
        assert!(config.force_realign_strides);
        assert_eq!(config.registration.cost, CostFunction::CorRatio);
        assert!(config.masking.start_seeds.is_empty());
        assert_eq!(config.masking.act_extract_at_axis, 3);
        assert_eq!(config.fodf.sh_order, 8);
    }

    #[test]
    fn test_seed_list_parses_regions() {
        let seeds = SeedList::parse("masking.start_seeds", " 2, 12,251 ").unwrap();
        assert_eq!(seeds.regions(), &[2, 12, 251]);
        assert!(!seeds.is_empty());
    }

    #[test]
    fn test_seed_list_empty_input() {
        assert!(SeedList::parse("masking.stop_seeds", "").unwrap().is_empty());
        assert!(SeedList::parse("masking.stop_seeds", "   ").unwrap().is_empty());
    }

    #[test]
    fn test_seed_list_error_names_the_option() {
        let err = SeedList::parse("masking.exclude_seeds", "2,abc").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("masking.exclude_seeds"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn test_bad_stride_orientation_is_a_load_error() {
        let file = ConfigFile {
            stride_orientation: "1,2".to_string(),
            ..ConfigFile::default()
        };
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("stride_orientation"));
    }

    #[test]
    fn test_bad_cost_function_is_a_load_error() {
        let file = ConfigFile {
            registration: RegistrationSection {
                cost: "fancy".to_string(),
            },
            ..ConfigFile::default()
        };
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("registration.cost"));
    }

    #[test]
    fn test_act_axis_out_of_range() {
        let file = ConfigFile {
            masking: MaskingSection {
                act_extract_at_axis: Some(7),
                ..MaskingSection::default()
            },
            ..ConfigFile::default()
        };
        assert!(file.validate().is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let yaml = r#"
stride_orientation: "1,2,3"
force_realign_strides: false
nthreads: 4
masking:
  start_seeds: "2,12"
  act_extract_at_axis: 3
  act_extract_at_coordinate: 2
registration:
  cost: mutualinfo
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let config = file.validate().unwrap();
        assert!(!config.force_realign_strides);
        assert_eq!(config.nthreads, Some(4));
        assert_eq!(config.masking.start_seeds.regions(), &[2, 12]);
        assert_eq!(config.registration.cost, CostFunction::MutualInfo);
    }
}
