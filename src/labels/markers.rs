//! File-level done / review markers.
//!
//! A file is in review when any of its segments has `review = true`. A file
//! in review cannot be marked done, and a done file cannot be flagged for
//! review. Clearing either marker is always allowed.

use std::collections::BTreeSet;

use anyhow::{bail, Result};

use crate::persistence::strip_hdf5_extension;

#[derive(Debug, Clone, Default)]
pub struct FileMarkers {
    done: BTreeSet<String>,
    review: BTreeSet<String>,
}

impl FileMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_done(&mut self, files: impl IntoIterator<Item = String>) {
        self.done = files.into_iter().collect();
    }

    /// Review files are tracked by label-file base name (no `.h5`/`.hdf5`).
    pub fn replace_review(&mut self, files: impl IntoIterator<Item = String>) {
        self.review = files
            .into_iter()
            .map(|file| strip_hdf5_extension(&file).to_string())
            .collect();
    }

    pub fn is_done(&self, file: &str) -> bool {
        self.done.contains(file)
    }

    pub fn in_review(&self, file: &str) -> bool {
        self.review.contains(strip_hdf5_extension(file))
    }

    pub fn done_files(&self) -> impl Iterator<Item = &str> {
        self.done.iter().map(String::as_str)
    }

    pub fn review_files(&self) -> impl Iterator<Item = &str> {
        self.review.iter().map(String::as_str)
    }

    pub fn check_toggle_done(&self, file: &str) -> Result<()> {
        if !self.is_done(file) && self.in_review(file) {
            bail!("'{file}' has segments flagged for review; clear them before marking it done");
        }
        Ok(())
    }

    pub fn check_set_review(&self, file: &str, value: bool) -> Result<()> {
        if value && self.is_done(file) {
            bail!("'{file}' is marked done; unmark it before flagging segments for review");
        }
        Ok(())
    }

    pub fn set_in_review(&mut self, file: &str, in_review: bool) {
        let key = strip_hdf5_extension(file).to_string();
        if in_review {
            self.review.insert(key);
        } else {
            self.review.remove(&key);
        }
    }

    pub fn set_done(&mut self, file: &str, done: bool) {
        if done {
            self.done.insert(file.to_string());
        } else {
            self.done.remove(file);
        }
    }
}
