//! Environment variables for external command execution.
//!
//! The neuroimaging tool chains read part of their configuration from the
//! process environment (FSL's output format, FreeSurfer's home directory).
//! Commands built by a stage carry an [`Environment`] that is applied to the
//! subprocess before launch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Environment variables passed to an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Environment variables as key-value pairs.
    vars: HashMap<String, String>,
}

impl Environment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an environment from a HashMap.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    /// Builder: add an environment variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Add an environment variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Get an environment variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// Check if a variable exists.
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Check if the environment is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Get the number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Merge another environment into this one.
    /// Variables from `other` override existing variables.
    pub fn merge(&mut self, other: &Environment) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Iterate over the environment variables.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_var_builder() {
        let env = Environment::new()
            .with_var("FSLOUTPUTTYPE", "NIFTI_GZ")
            .with_var("SUBJECTS_DIR", "/data/freesurfer");

        assert_eq!(env.len(), 2);
        assert_eq!(env.get("FSLOUTPUTTYPE"), Some("NIFTI_GZ"));
        assert!(env.contains("SUBJECTS_DIR"));
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = Environment::new().with_var("FSLOUTPUTTYPE", "NIFTI");
        let other = Environment::new().with_var("FSLOUTPUTTYPE", "NIFTI_GZ");

        base.merge(&other);

        assert_eq!(base.get("FSLOUTPUTTYPE"), Some("NIFTI_GZ"));
        assert_eq!(base.len(), 1);
    }

    #[test]
    fn test_empty_environment() {
        let env = Environment::new();
        assert!(env.is_empty());
        assert_eq!(env.get("ANYTHING"), None);
    }
}
