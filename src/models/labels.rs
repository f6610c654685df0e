//! Per-segment annotation records and the load-boundary normalization that
//! turns any accepted on-disk shape into a fully populated `SegmentLabels`.
//!
//! Persisted form (one JSON object per file and labeler):
//! `{"0": SegmentLabels, "1": SegmentLabels, ..., "_metadata": {..}}`

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const METADATA_KEY: &str = "_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    CompressionSystolic,
    CompressionDiastolic,
    SpontaneousSystolic,
    SpontaneousDiastolic,
}

impl LabelType {
    /// Fixed scan order. Removal tie-breaks always follow this order.
    pub const ALL: [LabelType; 4] = [
        LabelType::CompressionSystolic,
        LabelType::CompressionDiastolic,
        LabelType::SpontaneousSystolic,
        LabelType::SpontaneousDiastolic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::CompressionSystolic => "compression_systolic",
            LabelType::CompressionDiastolic => "compression_diastolic",
            LabelType::SpontaneousSystolic => "spontaneous_systolic",
            LabelType::SpontaneousDiastolic => "spontaneous_diastolic",
        }
    }

    pub fn family(&self) -> LabelFamily {
        match self {
            LabelType::CompressionSystolic | LabelType::CompressionDiastolic => {
                LabelFamily::Compression
            }
            LabelType::SpontaneousSystolic | LabelType::SpontaneousDiastolic => {
                LabelFamily::Spontaneous
            }
        }
    }
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabelType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        LabelType::ALL
            .into_iter()
            .find(|label_type| label_type.as_str() == value)
            .ok_or_else(|| anyhow!("unknown label type '{value}'"))
    }
}

/// Compression (CPR) versus spontaneous beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelFamily {
    Compression,
    Spontaneous,
}

impl LabelFamily {
    pub fn systolic(&self) -> LabelType {
        match self {
            LabelFamily::Compression => LabelType::CompressionSystolic,
            LabelFamily::Spontaneous => LabelType::SpontaneousSystolic,
        }
    }

    pub fn diastolic(&self) -> LabelType {
        match self {
            LabelFamily::Compression => LabelType::CompressionDiastolic,
            LabelFamily::Spontaneous => LabelType::SpontaneousDiastolic,
        }
    }

    /// Recordings carry one CPR flag per chunk: 1 = compression, anything else
    /// (or no flag at all) = spontaneous.
    pub fn from_cpr_label(label: Option<i64>) -> Self {
        match label {
            Some(1) => LabelFamily::Compression,
            _ => LabelFamily::Spontaneous,
        }
    }
}

/// Which free-text note a `set_note` call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteField {
    Review,
    Region,
}

/// A `[start, end)` span of sample offsets within one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start: u32,
    pub end: u32,
}

impl Region {
    /// Orders the endpoints. Zero-length spans are not regions.
    pub fn normalized(a: u32, b: u32) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { start: a, end: b }),
            std::cmp::Ordering::Greater => Some(Self { start: b, end: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// Point offsets keyed by label type. All four keys are always present, and
/// each set is sorted ascending and unique by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<LabelType, BTreeSet<u32>>",
    into = "BTreeMap<LabelType, BTreeSet<u32>>"
)]
pub struct LabelIndexes(BTreeMap<LabelType, BTreeSet<u32>>);

impl LabelIndexes {
    pub fn new() -> Self {
        Self(
            LabelType::ALL
                .into_iter()
                .map(|label_type| (label_type, BTreeSet::new()))
                .collect(),
        )
    }

    pub fn get(&self, label_type: LabelType) -> &BTreeSet<u32> {
        // Every key is inserted in `new`/`from`; the map is never shrunk.
        &self.0[&label_type]
    }

    pub fn get_mut(&mut self, label_type: LabelType) -> &mut BTreeSet<u32> {
        self.0.entry(label_type).or_default()
    }

    /// Iterates label types in the fixed scan order.
    pub fn iter(&self) -> impl Iterator<Item = (LabelType, &BTreeSet<u32>)> {
        self.0.iter().map(|(label_type, set)| (*label_type, set))
    }

    pub fn total(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl Default for LabelIndexes {
    fn default() -> Self {
        Self::new()
    }
}

impl From<BTreeMap<LabelType, BTreeSet<u32>>> for LabelIndexes {
    fn from(mut map: BTreeMap<LabelType, BTreeSet<u32>>) -> Self {
        for label_type in LabelType::ALL {
            map.entry(label_type).or_default();
        }
        Self(map)
    }
}

impl From<LabelIndexes> for BTreeMap<LabelType, BTreeSet<u32>> {
    fn from(indexes: LabelIndexes) -> Self {
        indexes.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentLabels {
    pub labeled: bool,
    pub label_indexes: LabelIndexes,
    pub review: bool,
    pub review_note: String,
    pub highlighted_regions: Vec<Region>,
    pub region_note: String,
}

impl SegmentLabels {
    pub fn has_content(&self) -> bool {
        !self.label_indexes.is_empty() || !self.highlighted_regions.is_empty()
    }
}

/// Counts of what normalization had to discard or rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub dropped_points: usize,
    pub dropped_regions: usize,
    pub skipped_entries: usize,
    pub legacy_segments: usize,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.dropped_points == 0 && self.dropped_regions == 0 && self.skipped_entries == 0
    }
}

/// All labels for one file, plus the reserved audit object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileAnnotationState {
    pub segments: BTreeMap<u32, SegmentLabels>,
    pub metadata: Option<Value>,
}

impl FileAnnotationState {
    /// Validates and normalizes a persisted label document.
    ///
    /// A top-level value that is not an object is rejected outright. Inside
    /// an accepted document, bad entries are dropped and counted in the
    /// returned report instead of failing the whole load.
    pub fn from_json(value: &Value, segment_length: u32) -> Result<(Self, LoadReport)> {
        let object = match value {
            Value::Object(object) => object,
            Value::Null => return Ok((Self::default(), LoadReport::default())),
            other => bail!(
                "label document must be a JSON object, found {}",
                json_kind(other)
            ),
        };

        let mut report = LoadReport::default();
        let mut state = Self::default();

        for (key, entry) in object {
            if key == METADATA_KEY {
                state.metadata = Some(entry.clone());
                continue;
            }

            let Ok(segment_id) = key.parse::<u32>() else {
                log::warn!("Skipping label entry with non-numeric key '{key}'");
                report.skipped_entries += 1;
                continue;
            };

            let Value::Object(fields) = entry else {
                log::warn!("Skipping segment {segment_id}: expected object, found {}", json_kind(entry));
                report.skipped_entries += 1;
                continue;
            };

            let labels = normalize_segment(fields, segment_length, &mut report);
            state.segments.insert(segment_id, labels);
        }

        Ok((state, report))
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for (segment_id, labels) in &self.segments {
            // SegmentLabels holds only strings, bools and integers.
            let value = serde_json::to_value(labels).unwrap_or(Value::Null);
            object.insert(segment_id.to_string(), value);
        }
        if let Some(metadata) = &self.metadata {
            object.insert(METADATA_KEY.to_string(), metadata.clone());
        }
        Value::Object(object)
    }

    pub fn has_review(&self) -> bool {
        self.segments.values().any(|labels| labels.review)
    }
}

fn normalize_segment(
    fields: &Map<String, Value>,
    segment_length: u32,
    report: &mut LoadReport,
) -> SegmentLabels {
    let mut labels = SegmentLabels::default();

    let sources = point_sources(fields);
    if !matches!(fields.get("label_indexes"), Some(Value::Object(_))) {
        report.legacy_segments += 1;
    }

    for source in sources {
        for label_type in LabelType::ALL {
            let Some(raw) = source.get(label_type.as_str()) else {
                continue;
            };
            let Value::Array(items) = raw else {
                report.dropped_points += 1;
                continue;
            };
            let set = labels.label_indexes.get_mut(label_type);
            for item in items {
                match as_offset(item) {
                    Some(offset) if offset < segment_length => {
                        set.insert(offset);
                    }
                    _ => report.dropped_points += 1,
                }
            }
        }
    }

    if let Some(Value::Array(regions)) = fields.get("highlighted_regions") {
        for raw in regions {
            let start = raw.get("start").and_then(as_offset);
            let end = raw.get("end").and_then(as_offset);
            let region = match (start, end) {
                (Some(start), Some(end)) => Region::normalized(start, end),
                _ => None,
            };
            match region {
                Some(region) if region.end <= segment_length => {
                    labels.highlighted_regions.push(region)
                }
                _ => report.dropped_regions += 1,
            }
        }
    }

    labels.review = fields.get("review").and_then(Value::as_bool).unwrap_or(false);
    labels.review_note = string_field(fields, "review_note");
    labels.region_note = string_field(fields, "region_note");

    let stored_labeled = fields.get("labeled").and_then(Value::as_bool).unwrap_or(false);
    labels.labeled = stored_labeled || labels.has_content();

    labels
}

/// Where a segment's point arrays live: the current `label_indexes` wrapper,
/// a legacy `signals` object (either holding the arrays directly or one level
/// down per signal name), or inline on the segment itself.
fn point_sources(fields: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    if let Some(Value::Object(indexes)) = fields.get("label_indexes") {
        return vec![indexes];
    }

    if let Some(Value::Object(signals)) = fields.get("signals") {
        let mut sources = vec![signals];
        sources.extend(signals.values().filter_map(Value::as_object));
        return sources;
    }

    vec![fields]
}

fn as_offset(value: &Value) -> Option<u32> {
    if let Some(int) = value.as_u64() {
        return u32::try_from(int).ok();
    }
    // Older files were written by tools that emit integral floats.
    let float = value.as_f64()?;
    if float.is_finite() && float >= 0.0 && float.fract() == 0.0 && float <= u32::MAX as f64 {
        Some(float as u32)
    } else {
        None
    }
}

fn string_field(fields: &Map<String, Value>, key: &str) -> String {
    fields
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn label_type_round_trips_through_its_key() {
        for label_type in LabelType::ALL {
            assert_eq!(label_type.as_str().parse::<LabelType>().unwrap(), label_type);
        }
        assert!("systolic".parse::<LabelType>().is_err());
    }

    #[test]
    fn default_segment_serializes_all_four_types() {
        let value = serde_json::to_value(SegmentLabels::default()).unwrap();
        let indexes = value["label_indexes"].as_object().unwrap();
        assert_eq!(indexes.len(), 4);
        for label_type in LabelType::ALL {
            assert_eq!(indexes[label_type.as_str()], json!([]));
        }
        assert_eq!(value["labeled"], json!(false));
    }

    #[test]
    fn current_shape_loads_unchanged() {
        let doc = json!({
            "3": {
                "labeled": true,
                "label_indexes": {
                    "compression_systolic": [40, 10],
                    "compression_diastolic": [],
                    "spontaneous_systolic": [],
                    "spontaneous_diastolic": [25]
                },
                "review": true,
                "review_note": "noisy",
                "highlighted_regions": [{"start": 100, "end": 200}],
                "region_note": "artifact"
            },
            "_metadata": {"labeler": "labeler1"}
        });

        let (state, report) = FileAnnotationState::from_json(&doc, 2000).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.legacy_segments, 0);

        let labels = &state.segments[&3];
        assert_eq!(
            labels.label_indexes.get(LabelType::CompressionSystolic).iter().copied().collect::<Vec<_>>(),
            vec![10, 40]
        );
        assert!(labels.review);
        assert_eq!(labels.review_note, "noisy");
        assert_eq!(labels.highlighted_regions, vec![Region { start: 100, end: 200 }]);
        assert_eq!(state.metadata, Some(json!({"labeler": "labeler1"})));
        assert!(state.has_review());
    }

    #[test]
    fn legacy_inline_points_are_wrapped() {
        let doc = json!({
            "0": {
                "compression_systolic": [5, 7],
                "spontaneous_diastolic": [9]
            }
        });

        let (state, report) = FileAnnotationState::from_json(&doc, 2000).unwrap();
        assert_eq!(report.legacy_segments, 1);
        assert!(report.is_clean());

        let labels = &state.segments[&0];
        assert!(labels.labeled);
        assert_eq!(labels.label_indexes.get(LabelType::CompressionSystolic).len(), 2);
        assert_eq!(labels.label_indexes.get(LabelType::SpontaneousDiastolic).len(), 1);
        assert!(labels.label_indexes.get(LabelType::CompressionDiastolic).is_empty());

        let persisted = state.to_json();
        assert_eq!(persisted["0"]["label_indexes"]["compression_systolic"], json!([5, 7]));
        assert!(persisted["0"].get("compression_systolic").is_none());
    }

    #[test]
    fn legacy_signals_object_is_flattened() {
        let doc = json!({
            "1": {
                "signals": {
                    "ABP": {"compression_systolic": [12], "compression_diastolic": [30]},
                    "spontaneous_systolic": [50]
                },
                "review": false
            }
        });

        let (state, _) = FileAnnotationState::from_json(&doc, 2000).unwrap();
        let labels = &state.segments[&1];
        assert!(labels.label_indexes.get(LabelType::CompressionSystolic).contains(&12));
        assert!(labels.label_indexes.get(LabelType::CompressionDiastolic).contains(&30));
        assert!(labels.label_indexes.get(LabelType::SpontaneousSystolic).contains(&50));
    }

    #[test]
    fn out_of_range_entries_are_dropped_not_fatal() {
        let doc = json!({
            "0": {
                "label_indexes": {"compression_systolic": [1, 2000, -4, "x", 3.0]},
                "highlighted_regions": [
                    {"start": 10, "end": 10},
                    {"start": 50, "end": 20},
                    {"start": 1900, "end": 2500}
                ]
            },
            "abc": {},
            "2": [1, 2, 3]
        });

        let (state, report) = FileAnnotationState::from_json(&doc, 2000).unwrap();
        let labels = &state.segments[&0];
        assert_eq!(
            labels.label_indexes.get(LabelType::CompressionSystolic).iter().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(labels.highlighted_regions, vec![Region { start: 20, end: 50 }]);
        assert_eq!(report.dropped_points, 3);
        assert_eq!(report.dropped_regions, 2);
        assert_eq!(report.skipped_entries, 2);
        assert!(!state.segments.contains_key(&2));
    }

    #[test]
    fn non_object_document_is_rejected() {
        assert!(FileAnnotationState::from_json(&json!([1, 2]), 2000).is_err());
        let (empty, _) = FileAnnotationState::from_json(&Value::Null, 2000).unwrap();
        assert!(empty.segments.is_empty());
    }

    #[test]
    fn cpr_flag_selects_family() {
        assert_eq!(LabelFamily::from_cpr_label(Some(1)), LabelFamily::Compression);
        assert_eq!(LabelFamily::from_cpr_label(Some(0)), LabelFamily::Spontaneous);
        assert_eq!(LabelFamily::from_cpr_label(None), LabelFamily::Spontaneous);
        assert_eq!(LabelFamily::Compression.diastolic(), LabelType::CompressionDiastolic);
    }
}
