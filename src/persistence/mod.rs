//! Where label files, the done list, and the review scan live.
//!
//! The session only talks to [`LabelRepository`]; it is backed either by the
//! local filesystem or by the engine's own file methods.

mod engine;
mod fs;
mod validation;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use engine::EngineLabelRepository;
pub use fs::FsLabelRepository;
pub use validation::{
    strip_hdf5_extension, validate_directory, validate_filename, validate_labeler_name,
    validate_version, MAX_LABELER_NAME_LEN, MAX_VERSION_LEN,
};

pub const DONE_FILES_NAME: &str = "done_files.json";

/// Result of flipping a file's done marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneToggle {
    pub is_done: bool,
    pub done_files: Vec<String>,
}

/// All operations are scoped to one labeler and one labels directory,
/// fixed when the repository is built.
#[async_trait]
pub trait LabelRepository: Send + Sync {
    /// Raw persisted labels for `filename`, or an empty object if none.
    async fn load_labels(&self, filename: &str) -> Result<Value>;

    async fn save_labels(&self, filename: &str, labels: &Value) -> Result<()>;

    async fn load_done_files(&self) -> Result<Vec<String>>;

    async fn toggle_done_file(&self, filename: &str) -> Result<DoneToggle>;

    /// Label-file base names with at least one segment flagged for review.
    async fn load_review_files(&self) -> Result<Vec<String>>;
}

/// True when any segment object in a persisted label file has `review`.
pub fn has_review_segment(labels: &Value) -> bool {
    labels.as_object().is_some_and(|segments| {
        segments
            .values()
            .any(|segment| segment.get("review").and_then(Value::as_bool) == Some(true))
    })
}
