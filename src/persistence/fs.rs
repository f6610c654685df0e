use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;

use super::{
    has_review_segment, strip_hdf5_extension, validate_filename, validate_labeler_name,
    DoneToggle, LabelRepository, DONE_FILES_NAME,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Label files under `<labels_dir>/<labeler>/<base>.json`.
pub struct FsLabelRepository {
    labeler_dir: PathBuf,
}

impl FsLabelRepository {
    pub fn new(labels_dir: impl Into<PathBuf>, labeler_name: &str) -> Result<Self> {
        validate_labeler_name(labeler_name)?;
        Ok(Self {
            labeler_dir: labels_dir.into().join(labeler_name),
        })
    }

    pub fn labeler_dir(&self) -> &Path {
        &self.labeler_dir
    }

    pub fn label_path(&self, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self
            .labeler_dir
            .join(format!("{}.json", strip_hdf5_extension(filename))))
    }

    fn done_path(&self) -> PathBuf {
        self.labeler_dir.join(DONE_FILES_NAME)
    }

    async fn read_json(path: &Path) -> Result<Option<Value>> {
        match fs::read_to_string(path).await {
            Ok(contents) => {
                let value = serde_json::from_str(&contents)
                    .with_context(|| format!("Invalid JSON in {}", path.display()))?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        }
    }

    async fn write_json(&self, path: &Path, value: &Value) -> Result<()> {
        fs::create_dir_all(&self.labeler_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.labeler_dir.display()))?;
        let serialized = serde_json::to_string_pretty(value)?;
        fs::write(path, serialized)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn read_done_list(&self) -> Result<Vec<String>> {
        let Some(value) = Self::read_json(&self.done_path()).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_value(value).context("done_files.json is not a list of names")
    }
}

#[async_trait]
impl LabelRepository for FsLabelRepository {
    async fn load_labels(&self, filename: &str) -> Result<Value> {
        let path = self.label_path(filename)?;
        Ok(Self::read_json(&path)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    async fn save_labels(&self, filename: &str, labels: &Value) -> Result<()> {
        if !labels.is_object() {
            bail!("labels for '{filename}' must be a JSON object");
        }
        let path = self.label_path(filename)?;
        self.write_json(&path, labels).await?;
        log_info!("Saved labels to {}", path.display());
        Ok(())
    }

    async fn load_done_files(&self) -> Result<Vec<String>> {
        self.read_done_list().await
    }

    async fn toggle_done_file(&self, filename: &str) -> Result<DoneToggle> {
        validate_filename(filename)?;
        let mut done_files = self.read_done_list().await?;

        let is_done = match done_files.iter().position(|name| name == filename) {
            Some(index) => {
                done_files.remove(index);
                false
            }
            None => {
                done_files.push(filename.to_string());
                true
            }
        };

        let value = serde_json::to_value(&done_files)?;
        self.write_json(&self.done_path(), &value).await?;
        Ok(DoneToggle {
            is_done,
            done_files,
        })
    }

    async fn load_review_files(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.labeler_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to list {}", self.labeler_dir.display()))
            }
        };

        let mut review_files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(base) = name.strip_suffix(".json") else {
                continue;
            };
            if name == DONE_FILES_NAME {
                continue;
            }

            match Self::read_json(&entry.path()).await {
                Ok(Some(labels)) if has_review_segment(&labels) => {
                    review_files.push(base.to_string())
                }
                Ok(_) => {}
                Err(err) => log_warn!("Skipping unreadable label file {name}: {err:#}"),
            }
        }
        review_files.sort();
        Ok(review_files)
    }
}
