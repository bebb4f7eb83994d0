//! Gradient encoding tables in mrtrix and FSL formats.
//!
//! The mrtrix `.b` format stores one row per volume: `x y z b`. The FSL
//! format splits the same table into a `.bvecs` file holding three row
//! vectors (all x components, all y, all z) and a `.bvals` file holding the
//! b-values on a single row. The preparation stage synthesizes whichever
//! representation the raw data set is missing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or writing gradient encoding files.
#[derive(Debug, Error)]
pub enum GradientError {
    /// Could not read an encoding file.
    #[error("failed to read gradient file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write an encoding file.
    #[error("failed to write gradient file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value in an encoding file did not parse as a number.
    #[error("malformed value '{value}' in gradient file '{path}'")]
    Malformed { path: PathBuf, value: String },

    /// An encoding file had an unexpected shape.
    #[error("gradient file '{path}': {detail}")]
    Shape { path: PathBuf, detail: String },
}

/// A diffusion gradient table: one direction and b-value per volume.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    directions: Vec<[f64; 3]>,
    bvalues: Vec<f64>,
}

impl GradientTable {
    /// Number of volumes described by the table.
    pub fn len(&self) -> usize {
        self.bvalues.len()
    }

    /// Check whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.bvalues.is_empty()
    }

    /// Read a table from a mrtrix `.b` file (one `x y z b` row per volume).
    ///
    /// Blank lines and `#` comments are skipped.
    pub fn read_mrtrix(path: &Path) -> Result<Self, GradientError> {
        let text = fs::read_to_string(path).map_err(|source| GradientError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut directions = Vec::new();
        let mut bvalues = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = parse_row(path, line)?;
            if row.len() != 4 {
                return Err(GradientError::Shape {
                    path: path.to_path_buf(),
                    detail: format!("expected 4 columns per row, found {}", row.len()),
                });
            }
            directions.push([row[0], row[1], row[2]]);
            bvalues.push(row[3]);
        }

        if bvalues.is_empty() {
            return Err(GradientError::Shape {
                path: path.to_path_buf(),
                detail: "no gradient rows found".to_string(),
            });
        }

        Ok(Self {
            directions,
            bvalues,
        })
    }

    /// Read a table from an FSL `.bvecs`/`.bvals` pair.
    pub fn read_fsl(bvecs: &Path, bvals: &Path) -> Result<Self, GradientError> {
        let vec_rows = read_rows(bvecs)?;
        if vec_rows.len() != 3 {
            return Err(GradientError::Shape {
                path: bvecs.to_path_buf(),
                detail: format!("expected 3 rows, found {}", vec_rows.len()),
            });
        }

        let val_rows = read_rows(bvals)?;
        if val_rows.len() != 1 {
            return Err(GradientError::Shape {
                path: bvals.to_path_buf(),
                detail: format!("expected a single row, found {}", val_rows.len()),
            });
        }
        let bvalues = val_rows.into_iter().next().unwrap_or_default();

        let count = bvalues.len();
        for (i, row) in vec_rows.iter().enumerate() {
            if row.len() != count {
                return Err(GradientError::Shape {
                    path: bvecs.to_path_buf(),
                    detail: format!(
                        "row {} has {} entries but {} b-values were given",
                        i,
                        row.len(),
                        count
                    ),
                });
            }
        }

        let directions = (0..count)
            .map(|i| [vec_rows[0][i], vec_rows[1][i], vec_rows[2][i]])
            .collect();

        Ok(Self {
            directions,
            bvalues,
        })
    }

    /// Write the table as a mrtrix `.b` file.
    pub fn write_mrtrix(&self, path: &Path) -> Result<(), GradientError> {
        let mut out = String::new();
        for (dir, b) in self.directions.iter().zip(&self.bvalues) {
            out.push_str(&format!("{} {} {} {}\n", dir[0], dir[1], dir[2], b));
        }
        write_text(path, &out)
    }

    /// Write the direction rows as an FSL `.bvecs` file.
    pub fn write_bvecs(&self, path: &Path) -> Result<(), GradientError> {
        let mut vecs = String::new();
        for axis in 0..3 {
            let row: Vec<String> = self
                .directions
                .iter()
                .map(|d| d[axis].to_string())
                .collect();
            vecs.push_str(&row.join(" "));
            vecs.push('\n');
        }
        write_text(path, &vecs)
    }

    /// Write the b-values as an FSL `.bvals` file.
    pub fn write_bvals(&self, path: &Path) -> Result<(), GradientError> {
        let vals: Vec<String> = self.bvalues.iter().map(|b| b.to_string()).collect();
        write_text(path, &format!("{}\n", vals.join(" ")))
    }

    /// Write the table as an FSL `.bvecs`/`.bvals` pair.
    pub fn write_fsl(&self, bvecs: &Path, bvals: &Path) -> Result<(), GradientError> {
        self.write_bvecs(bvecs)?;
        self.write_bvals(bvals)
    }
}

fn parse_row(path: &Path, line: &str) -> Result<Vec<f64>, GradientError> {
    line.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| GradientError::Malformed {
                path: path.to_path_buf(),
                value: tok.to_string(),
            })
        })
        .collect()
}

fn read_rows(path: &Path) -> Result<Vec<Vec<f64>>, GradientError> {
    let text = fs::read_to_string(path).map_err(|source| GradientError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| parse_row(path, l))
        .collect()
}

/// Write a file atomically: the content lands under a scratch name first and
/// is renamed over the target, so a crash never leaves a truncated file
/// under a canonical name.
fn write_text(path: &Path, content: &str) -> Result<(), GradientError> {
    let scratch = scratch_path(path);
    let write = |p: &Path| -> std::io::Result<()> {
        let mut f = fs::File::create(p)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()
    };
    write(&scratch).map_err(|source| GradientError::Write {
        path: scratch.clone(),
        source,
    })?;
    fs::rename(&scratch, path).map_err(|source| GradientError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn scratch_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("gradient");
    path.with_file_name(crate::core::naming::temp_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> GradientTable {
        GradientTable {
            directions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            bvalues: vec![0.0, 1000.0, 1000.0],
        }
    }

    #[test]
    fn test_mrtrix_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub_grad.b");

        sample().write_mrtrix(&path).unwrap();
        let read = GradientTable::read_mrtrix(&path).unwrap();

        assert_eq!(read, sample());
    }

    #[test]
    fn test_fsl_round_trip() {
        let dir = TempDir::new().unwrap();
        let bvecs = dir.path().join("sub_grad.bvecs");
        let bvals = dir.path().join("sub_grad.bvals");

        sample().write_fsl(&bvecs, &bvals).unwrap();
        let read = GradientTable::read_fsl(&bvecs, &bvals).unwrap();

        assert_eq!(read, sample());
    }

    #[test]
    fn test_fsl_to_mrtrix_conversion() {
        let dir = TempDir::new().unwrap();
        let bvecs = dir.path().join("sub_grad.bvecs");
        let bvals = dir.path().join("sub_grad.bvals");
        std::fs::write(&bvecs, "0 1 0\n0 0 1\n0 0 0\n").unwrap();
        std::fs::write(&bvals, "0 1000 1000\n").unwrap();

        let table = GradientTable::read_fsl(&bvecs, &bvals).unwrap();
        let b = dir.path().join("sub_grad.b");
        table.write_mrtrix(&b).unwrap();

        let text = std::fs::read_to_string(&b).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], "1 0 0 1000");
    }

    #[test]
    fn test_bvecs_wrong_row_count_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bvecs = dir.path().join("sub_grad.bvecs");
        let bvals = dir.path().join("sub_grad.bvals");
        std::fs::write(&bvecs, "0 1\n0 0\n").unwrap();
        std::fs::write(&bvals, "0 1000\n").unwrap();

        let err = GradientTable::read_fsl(&bvecs, &bvals).unwrap_err();
        assert!(matches!(err, GradientError::Shape { .. }));
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bvecs = dir.path().join("sub_grad.bvecs");
        let bvals = dir.path().join("sub_grad.bvals");
        std::fs::write(&bvecs, "0 1 0\n0 0 1\n0 0 0\n").unwrap();
        std::fs::write(&bvals, "0 1000\n").unwrap();

        let err = GradientTable::read_fsl(&bvecs, &bvals).unwrap_err();
        assert!(matches!(err, GradientError::Shape { .. }));
    }

    #[test]
    fn test_malformed_value_names_the_token() {
        let dir = TempDir::new().unwrap();
        let b = dir.path().join("sub_grad.b");
        std::fs::write(&b, "0 0 zero 0\n").unwrap();

        let err = GradientTable::read_mrtrix(&b).unwrap_err();
        assert!(err.to_string().contains("zero"));
    }

    #[test]
    fn test_no_scratch_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub_grad.b");
        sample().write_mrtrix(&path).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["sub_grad.b".to_string()]);
    }
}
