//! Data stride layouts.
//!
//! mrtrix images carry a stride vector describing the on-disk axis order.
//! The pipeline is configured with an expected layout (e.g. `1,2,3`) and the
//! preparation stage restrides any input whose actual layout differs, so
//! every downstream tool sees the same memory order.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::core::context::StageContext;
use crate::core::task::TaskError;

/// An expected stride layout for the three spatial axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrideLayout([i32; 3]);

impl StrideLayout {
    /// The layout as configured, e.g. `[1, 2, 3]`.
    pub fn axes(&self) -> &[i32; 3] {
        &self.0
    }

    /// Render the layout as a mrtrix `-stride` argument for a 3-D image.
    pub fn as_arg(&self) -> String {
        format!("{},{},{}", self.0[0], self.0[1], self.0[2])
    }

    /// Render the layout as a mrtrix `-stride` argument for a 4-D image,
    /// keeping the volume axis last.
    pub fn as_arg_4d(&self) -> String {
        format!("{},4", self.as_arg())
    }

    /// Check whether an actual stride vector matches this layout on the
    /// spatial axes.
    pub fn matches(&self, actual: &[i32]) -> bool {
        actual.len() >= 3 && actual[..3] == self.0
    }
}

impl Default for StrideLayout {
    fn default() -> Self {
        Self([1, 2, 3])
    }
}

impl fmt::Display for StrideLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_arg())
    }
}

impl FromStr for StrideLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values: Vec<i32> = s
            .split(',')
            .map(|tok| {
                tok.trim()
                    .parse::<i32>()
                    .map_err(|_| format!("'{}' is not an integer", tok.trim()))
            })
            .collect::<Result<_, _>>()?;

        if values.len() != 3 {
            return Err(format!("expected 3 comma-separated axes, found {}", values.len()));
        }
        let mut seen = [false; 3];
        for v in &values {
            let axis = v.unsigned_abs() as usize;
            if *v == 0 || axis > 3 {
                return Err(format!("axis '{}' out of range (expected ±1..=3)", v));
            }
            if seen[axis - 1] {
                return Err(format!("axis {} given twice", axis));
            }
            seen[axis - 1] = true;
        }

        Ok(Self([values[0], values[1], values[2]]))
    }
}

/// Query the actual data strides of an image via `mrinfo`.
pub async fn image_strides(image: &Path, ctx: &StageContext) -> Result<Vec<i32>, TaskError> {
    let output = ctx
        .command("mrinfo")
        .arg_path(image)
        .arg("-strides")
        .run()
        .await?;

    let strides: Vec<i32> = output
        .stdout
        .split_whitespace()
        .filter_map(|tok| tok.parse().ok())
        .collect();

    if strides.len() < 3 {
        return Err(TaskError::UnexpectedOutput {
            program: "mrinfo".to_string(),
            detail: format!("could not parse strides from '{}'", output.stdout.trim()),
        });
    }
    Ok(strides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_layout() {
        let layout: StrideLayout = "1,2,3".parse().unwrap();
        assert_eq!(layout.axes(), &[1, 2, 3]);
        assert_eq!(layout.as_arg(), "1,2,3");
        assert_eq!(layout.as_arg_4d(), "1,2,3,4");
    }

    #[test]
    fn test_parse_accepts_negative_axes() {
        let layout: StrideLayout = "-1,2,3".parse().unwrap();
        assert_eq!(layout.axes(), &[-1, 2, 3]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("1,2".parse::<StrideLayout>().is_err());
        assert!("1,2,x".parse::<StrideLayout>().is_err());
        assert!("1,1,2".parse::<StrideLayout>().is_err());
        assert!("0,2,3".parse::<StrideLayout>().is_err());
        assert!("1,2,4".parse::<StrideLayout>().is_err());
    }

    #[test]
    fn test_matches_ignores_volume_axis() {
        let layout = StrideLayout::default();
        assert!(layout.matches(&[1, 2, 3]));
        assert!(layout.matches(&[1, 2, 3, 4]));
        assert!(!layout.matches(&[3, 1, 2]));
        assert!(!layout.matches(&[1, 2]));
    }
}
