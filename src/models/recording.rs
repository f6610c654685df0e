//! Recording payloads returned by the engine's `load_patient_file` and the
//! fixed-length segment layout derived from their metadata.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::labels::LabelFamily;

const DEFAULT_CHUNK_SIZE: u32 = 2000;
const DEFAULT_SAMPLING_RATE: f64 = 250.0;

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

fn default_sampling_rate() -> f64 {
    DEFAULT_SAMPLING_RATE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default)]
    pub skip_size: Option<u32>,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default)]
    pub drop_incomplete: Option<bool>,
}

impl Default for RecordingMetadata {
    fn default() -> Self {
        Self {
            patient_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_size: None,
            sampling_rate: DEFAULT_SAMPLING_RATE,
            drop_incomplete: None,
        }
    }
}

/// A whole multi-channel recording, row-major (`data[sample][column]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub columns: Vec<String>,
    pub data: Vec<Vec<Option<f64>>>,
    #[serde(default)]
    pub metadata: RecordingMetadata,
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
    #[serde(default)]
    pub cpr_labels: Option<Vec<i64>>,
}

impl Recording {
    pub fn layout(&self) -> SegmentLayout {
        SegmentLayout::new(
            self.metadata.chunk_size,
            self.metadata.sampling_rate,
            self.data.len(),
        )
    }

    /// Column used for detection: the first whose name contains "ABP"
    /// (case-insensitive), else the first column.
    pub fn detection_column(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|name| name.to_uppercase().contains("ABP"))
            .or(if self.columns.is_empty() { None } else { Some(0) })
    }

    pub fn segment_signal(&self, segment: u32) -> Option<Vec<f64>> {
        let column = self.detection_column()?;
        let range = self.layout().bounds(segment)?;
        Some(
            self.data[range]
                .iter()
                .map(|row| row.get(column).copied().flatten().unwrap_or(f64::NAN))
                .collect(),
        )
    }

    pub fn family_for_segment(&self, segment: u32) -> LabelFamily {
        let flag = self
            .cpr_labels
            .as_ref()
            .and_then(|labels| labels.get(segment as usize).copied());
        LabelFamily::from_cpr_label(flag)
    }
}

/// Contiguous, non-overlapping, 0-based segments. A trailing partial
/// segment is not addressable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentLayout {
    pub segment_length: u32,
    pub sampling_rate: f64,
    pub total_samples: usize,
}

impl SegmentLayout {
    pub fn new(segment_length: u32, sampling_rate: f64, total_samples: usize) -> Self {
        Self {
            segment_length,
            sampling_rate,
            total_samples,
        }
    }

    pub fn segment_count(&self) -> u32 {
        if self.segment_length == 0 {
            return 0;
        }
        let count = self.total_samples / self.segment_length as usize;
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn contains_segment(&self, segment: u32) -> bool {
        segment < self.segment_count()
    }

    pub fn bounds(&self, segment: u32) -> Option<Range<usize>> {
        if !self.contains_segment(segment) {
            return None;
        }
        let start = segment as usize * self.segment_length as usize;
        Some(start..start + self.segment_length as usize)
    }

    /// Maps a possibly out-of-range sample index to an in-segment offset.
    pub fn offset(&self, sample: i64) -> Option<u32> {
        u32::try_from(sample)
            .ok()
            .filter(|offset| *offset < self.segment_length)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sampling_rate > 0.0 {
            self.segment_length as f64 / self.sampling_rate
        } else {
            0.0
        }
    }
}
