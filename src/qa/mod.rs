//! Quality-assessment supplier interface.
//!
//! Stages that can illustrate their result expose an ordered list of
//! (image, caption) pairs; a downstream report generator renders them. The
//! pipeline core only carries the manifest.

use serde::Serialize;
use std::path::PathBuf;

/// One image for the quality-assessment report.
#[derive(Debug, Clone, Serialize)]
pub struct QaItem {
    /// Path to the rendered or renderable image.
    pub image: PathBuf,
    /// Human-readable caption.
    pub caption: String,
}

impl QaItem {
    /// Create a QA item.
    pub fn new(image: impl Into<PathBuf>, caption: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            caption: caption.into(),
        }
    }
}

/// All QA items supplied by one stage, in display order.
#[derive(Debug, Clone, Serialize)]
pub struct QaSection {
    /// Stage name.
    pub stage: String,
    /// Items in display order.
    pub items: Vec<QaItem>,
}
