//! Image naming and lookup convention.
//!
//! Every image produced by the pipeline is named
//! `{prefix}_{role}[_{tag}...].{ext}` where `prefix` is usually the subject
//! identifier, `role` is one of a fixed set of semantic roles ("dwi", "anat",
//! "b0", "grad", "aparc_aseg", ...) and the ordered tag list records the
//! transformations applied ("brain", "resample", "stride", ...).
//!
//! Lookup ([`find_image`]) matches a file when its name carries the role and
//! at least the requested tags, order-insensitive; candidates are visited in
//! lexicographic filename order, so a bare `sub_anat.nii.gz` wins over its
//! derivative `sub_anat_brain.nii.gz`. Absence is a normal condition and is
//! reported as `None`, never as an error.
//!
//! Construction ([`build_name`]) is deterministic: tags accumulate in
//! application order and an explicit extension override always wins.

use std::fs;
use std::path::{Path, PathBuf};

/// Extensions accepted when a lookup does not name one explicitly.
pub const VOLUME_EXTENSIONS: &[&str] = &["nii.gz", "nii"];

/// All filename extensions the convention knows how to strip.
///
/// Ordered longest-first so that `nii.gz` is preferred over `gz`-less
/// single-dot parsing.
pub const KNOWN_EXTENSIONS: &[&str] = &["nii.gz", "nii", "bvals", "bvecs", "mat", "txt", "b"];

/// Split a filename into its stem and known extension.
///
/// Returns `(stem, None)` when no known extension matches.
pub fn split_extension(file_name: &str) -> (&str, Option<&str>) {
    for ext in KNOWN_EXTENSIONS {
        if let Some(stem) = file_name.strip_suffix(ext) {
            if let Some(stem) = stem.strip_suffix('.') {
                if !stem.is_empty() {
                    return (stem, Some(ext));
                }
            }
        }
    }
    (file_name, None)
}

/// Extract the tag list from a stem, given the role it should carry.
///
/// The role must appear delimited by `_` (or the stem boundary) so that
/// `b0` never matches inside `b0_ap`-like prefixes of longer roles, and a
/// subject prefix containing the role as a substring is skipped over.
/// Returns `None` when the stem does not carry the role.
pub fn stem_tags<'a>(stem: &'a str, role: &str) -> Option<Vec<&'a str>> {
    if role.is_empty() {
        return None;
    }
    let bytes = stem.as_bytes();
    let mut search = 0;
    while let Some(found) = stem[search..].find(role) {
        let start = search + found;
        let end = start + role.len();
        let before_ok = start == 0 || bytes[start - 1] == b'_';
        let after_ok = end == stem.len() || bytes[end] == b'_';
        if before_ok && after_ok {
            let tags = stem[end..].split('_').filter(|t| !t.is_empty()).collect();
            return Some(tags);
        }
        search = start + 1;
    }
    None
}

/// Check whether a filename matches a (role, tags, extension) query.
///
/// Tag matching is a multiset-superset test: the file must carry every
/// requested tag (duplicates included) but may carry more. With no explicit
/// extension, only volume extensions are considered.
pub fn matches(file_name: &str, role: &str, tags: &[&str], extension: Option<&str>) -> bool {
    let (stem, ext) = split_extension(file_name);
    match (extension, ext) {
        (Some(want), Some(have)) if want == have => {}
        (None, Some(have)) if VOLUME_EXTENSIONS.contains(&have) => {}
        _ => return false,
    }
    let Some(mut found) = stem_tags(stem, role) else {
        return false;
    };
    for tag in tags {
        match found.iter().position(|f| f == tag) {
            Some(idx) => {
                found.swap_remove(idx);
            }
            None => return false,
        }
    }
    true
}

/// Find the first image in `directory` matching the query, or `None`.
///
/// Candidates are visited in lexicographic filename order, which makes the
/// result deterministic and prefers bare names over tagged derivatives.
/// A missing or unreadable directory is treated as containing no images.
pub fn find_image(
    directory: &Path,
    role: &str,
    tags: &[&str],
    extension: Option<&str>,
) -> Option<PathBuf> {
    let entries = fs::read_dir(directory).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
        .into_iter()
        .find(|name| matches(name, role, tags, extension))
        .map(|name| directory.join(name))
}

/// Derive an output filename from a source filename.
///
/// Appends each tag to the stem in order; the extension override wins over
/// the source's extension. Deterministic: identical inputs always yield the
/// identical name.
pub fn build_name(source_name: &str, tags: &[&str], extension: Option<&str>) -> String {
    let (stem, ext) = split_extension(source_name);
    let mut name = stem.to_string();
    for tag in tags {
        name.push('_');
        name.push_str(tag);
    }
    match extension.or(ext) {
        Some(ext) => format!("{}.{}", name, ext),
        None => name,
    }
}

/// Mint a filename from scratch for a (prefix, role, tags) triple.
///
/// Used when an output has no single source image to derive its name from,
/// e.g. the extended anatomical volume summed out of two inputs.
pub fn role_name(prefix: &str, role: &str, tags: &[&str], extension: Option<&str>) -> String {
    let mut name = format!("{}_{}", prefix, role);
    for tag in tags {
        name.push('_');
        name.push_str(tag);
    }
    format!("{}.{}", name, extension.unwrap_or("nii.gz"))
}

/// Derive a scratch filename for `target` inside the same directory.
///
/// The temporary name keeps the image extension (external tools infer the
/// output format from it) but mangles the underscores out of the stem so
/// that no lookup ever mistakes an in-progress file for a canonical one.
pub fn temp_name(target_name: &str) -> String {
    let (stem, ext) = split_extension(target_name);
    let mangled = stem.replace('_', "-");
    match ext {
        Some(ext) => format!("tmp-{}.{}", mangled, ext),
        None => format!("tmp-{}", mangled),
    }
}
