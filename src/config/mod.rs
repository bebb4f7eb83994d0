//! Pipeline configuration.
//!
//! Configuration is loaded from a single YAML file and validated eagerly:
//! by the time a pipeline starts, every option value has already been
//! parsed into its typed form.

pub mod error;
pub mod types;

pub use error::ConfigError;
pub use types::{
    ConfigFile, CostFunction, FodfOptions, FodfSection, MaskingOptions, MaskingSection,
    PipelineConfig, RegistrationOptions, RegistrationSection, SeedKind, SeedList,
};

use std::path::Path;

/// Load and validate a configuration file.
pub fn load(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ConfigFile =
        serde_yaml::from_str(&text).map_err(|source| ConfigError::YamlFileError {
            path: path.to_path_buf(),
            source,
        })?;
    file.validate()
}
