use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{validate_filename, validate_labeler_name, DoneToggle, LabelRepository};
use crate::engine::EngineClient;

/// Delegates file access to the engine process, which owns the disk.
pub struct EngineLabelRepository {
    engine: EngineClient,
    labeler_name: String,
    labels_directory: String,
}

impl EngineLabelRepository {
    pub fn new(engine: EngineClient, labeler_name: &str, labels_directory: &str) -> Result<Self> {
        validate_labeler_name(labeler_name)?;
        Ok(Self {
            engine,
            labeler_name: labeler_name.to_string(),
            labels_directory: labels_directory.to_string(),
        })
    }
}

#[async_trait]
impl LabelRepository for EngineLabelRepository {
    async fn load_labels(&self, filename: &str) -> Result<Value> {
        validate_filename(filename)?;
        self.engine
            .load_labels(filename, &self.labeler_name, &self.labels_directory)
            .await
            .with_context(|| format!("Failed to load labels for {filename}"))
    }

    async fn save_labels(&self, filename: &str, labels: &Value) -> Result<()> {
        validate_filename(filename)?;
        self.engine
            .save_labels(filename, &self.labeler_name, &self.labels_directory, labels)
            .await
            .with_context(|| format!("Failed to save labels for {filename}"))
    }

    async fn load_done_files(&self) -> Result<Vec<String>> {
        self.engine
            .load_done_files(&self.labeler_name, &self.labels_directory)
            .await
            .context("Failed to load done files")
    }

    async fn toggle_done_file(&self, filename: &str) -> Result<DoneToggle> {
        validate_filename(filename)?;
        self.engine
            .toggle_done_file(filename, &self.labeler_name, &self.labels_directory)
            .await
            .with_context(|| format!("Failed to toggle done for {filename}"))
    }

    async fn load_review_files(&self) -> Result<Vec<String>> {
        self.engine
            .load_review_files(&self.labeler_name, &self.labels_directory)
            .await
            .context("Failed to load review files")
    }
}
