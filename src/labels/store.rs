use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{FileAnnotationState, LabelType, NoteField, Region, SegmentLabels};

/// Result of a single-point toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ToggleOutcome {
    Added { label_type: LabelType, index: u32 },
    Removed { label_type: LabelType, index: u32 },
}

impl ToggleOutcome {
    pub fn removed(&self) -> bool {
        matches!(self, ToggleOutcome::Removed { .. })
    }
}

/// Annotation data for the file currently open in the session.
///
/// Every per-segment operation creates the segment record on demand, so
/// there is no "segment not found" failure. Callers validate label types and
/// offsets before they reach the store.
#[derive(Debug, Default)]
pub struct LabelStore {
    file: Option<String>,
    state: FileAnnotationState,
}

impl LabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents with a freshly loaded file.
    pub fn hydrate(&mut self, file: impl Into<String>, state: FileAnnotationState) {
        self.file = Some(file.into());
        self.state = state;
    }

    pub fn clear(&mut self) {
        self.file = None;
        self.state = FileAnnotationState::default();
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn state(&self) -> &FileAnnotationState {
        &self.state
    }

    pub fn segment(&self, segment: u32) -> Option<&SegmentLabels> {
        self.state.segments.get(&segment)
    }

    pub fn points(&self, segment: u32, label_type: LabelType) -> Vec<u32> {
        self.segment(segment)
            .map(|labels| labels.label_indexes.get(label_type).iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_review(&self) -> bool {
        self.state.has_review()
    }

    pub fn ensure_segment(&mut self, segment: u32) -> &mut SegmentLabels {
        self.state.segments.entry(segment).or_default()
    }

    /// Removes one existing point of any type within `tolerance` of `index`,
    /// or inserts `index` into `preferred` when nothing is that close.
    ///
    /// Types are scanned in `LabelType::ALL` order and the first type holding
    /// a nearby point wins; within that type the closest point is removed.
    pub fn toggle_point(
        &mut self,
        segment: u32,
        index: u32,
        preferred: LabelType,
        tolerance: u32,
    ) -> ToggleOutcome {
        let labels = self.ensure_segment(segment);
        labels.labeled = true;

        for label_type in LabelType::ALL {
            let set = labels.label_indexes.get_mut(label_type);
            if let Some(existing) = closest_within(set.iter().copied(), index, tolerance) {
                set.remove(&existing);
                return ToggleOutcome::Removed {
                    label_type,
                    index: existing,
                };
            }
        }

        labels.label_indexes.get_mut(preferred).insert(index);
        ToggleOutcome::Added {
            label_type: preferred,
            index,
        }
    }

    /// Removes every point of every type within `tolerance`. Returns how many
    /// were removed.
    pub fn erase_near(&mut self, segment: u32, index: u32, tolerance: u32) -> usize {
        let labels = self.ensure_segment(segment);
        let mut removed = 0;

        for label_type in LabelType::ALL {
            let set = labels.label_indexes.get_mut(label_type);
            let before = set.len();
            set.retain(|existing| existing.abs_diff(index) > tolerance);
            removed += before - set.len();
        }

        if removed > 0 {
            labels.labeled = true;
        }
        removed
    }

    /// Removes the single point closest to `index` across all types. Ties go
    /// to the type that comes first in scan order.
    pub fn remove_nearest(
        &mut self,
        segment: u32,
        index: u32,
        tolerance: u32,
    ) -> Option<(LabelType, u32)> {
        let labels = self.ensure_segment(segment);

        let mut best: Option<(LabelType, u32, u32)> = None;
        for (label_type, set) in labels.label_indexes.iter() {
            if let Some(existing) = closest_within(set.iter().copied(), index, tolerance) {
                let distance = existing.abs_diff(index);
                if best.map_or(true, |(_, _, best_distance)| distance < best_distance) {
                    best = Some((label_type, existing, distance));
                }
            }
        }

        let (label_type, existing, _) = best?;
        labels.label_indexes.get_mut(label_type).remove(&existing);
        labels.labeled = true;
        Some((label_type, existing))
    }

    pub fn set_points_for_type(
        &mut self,
        segment: u32,
        label_type: LabelType,
        indices: impl IntoIterator<Item = u32>,
    ) {
        let labels = self.ensure_segment(segment);
        let set = labels.label_indexes.get_mut(label_type);
        set.clear();
        set.extend(indices);
        labels.labeled = true;
    }

    /// Appends a region, ordering the endpoints. Zero-length spans are
    /// ignored and return `None`.
    pub fn add_region(&mut self, segment: u32, start: u32, end: u32) -> Option<Region> {
        let region = Region::normalized(start, end)?;
        let labels = self.ensure_segment(segment);
        labels.highlighted_regions.push(region);
        labels.labeled = true;
        Some(region)
    }

    pub fn clear_regions(&mut self, segment: u32) -> usize {
        let labels = self.ensure_segment(segment);
        let cleared = labels.highlighted_regions.len();
        labels.highlighted_regions.clear();
        labels.labeled = true;
        cleared
    }

    pub fn set_review(&mut self, segment: u32, value: bool) {
        let labels = self.ensure_segment(segment);
        labels.review = value;
        labels.labeled = true;
    }

    pub fn set_note(&mut self, segment: u32, field: NoteField, text: impl Into<String>) {
        let labels = self.ensure_segment(segment);
        match field {
            NoteField::Review => labels.review_note = text.into(),
            NoteField::Region => labels.region_note = text.into(),
        }
        labels.labeled = true;
    }

    /// Snapshot for persistence with the audit object merged into
    /// `_metadata`. Fields already present in the loaded metadata and not
    /// named in `audit` are kept.
    pub fn export(&self, audit: &Map<String, Value>) -> Option<(String, Value)> {
        let file = self.file.clone()?;
        let mut state = self.state.clone();

        let mut metadata = match state.metadata.take() {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        for (key, value) in audit {
            metadata.insert(key.clone(), value.clone());
        }
        state.metadata = Some(Value::Object(metadata));

        Some((file, state.to_json()))
    }
}

fn closest_within(
    candidates: impl Iterator<Item = u32>,
    index: u32,
    tolerance: u32,
) -> Option<u32> {
    candidates
        .filter(|existing| existing.abs_diff(index) <= tolerance)
        .min_by_key(|existing| existing.abs_diff(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_sorted_unique(store: &LabelStore, segment: u32) {
        for label_type in LabelType::ALL {
            let points = store.points(segment, label_type);
            assert!(points.windows(2).all(|w| w[0] < w[1]), "{label_type} not sorted: {points:?}");
        }
    }

    #[test]
    fn ensure_segment_never_overwrites() {
        let mut store = LabelStore::new();
        store.set_review(4, true);
        store.ensure_segment(4);
        assert!(store.segment(4).unwrap().review);

        let fresh = store.ensure_segment(9).clone();
        assert!(!fresh.labeled);
        assert_eq!(fresh.label_indexes.iter().count(), 4);
    }

    #[test]
    fn toggle_adds_then_removes() {
        let mut store = LabelStore::new();
        let first = store.toggle_point(0, 120, LabelType::CompressionSystolic, 5);
        let second = store.toggle_point(0, 120, LabelType::CompressionSystolic, 5);

        assert_eq!(
            first,
            ToggleOutcome::Added { label_type: LabelType::CompressionSystolic, index: 120 }
        );
        assert!(second.removed());
        assert!(store.points(0, LabelType::CompressionSystolic).is_empty());
        assert!(store.segment(0).unwrap().labeled);
    }

    #[test]
    fn toggle_removes_nearby_point_of_another_type() {
        let mut store = LabelStore::new();
        store.set_points_for_type(0, LabelType::SpontaneousDiastolic, [300]);

        let outcome = store.toggle_point(0, 303, LabelType::CompressionSystolic, 5);
        assert_eq!(
            outcome,
            ToggleOutcome::Removed { label_type: LabelType::SpontaneousDiastolic, index: 300 }
        );
        assert!(store.points(0, LabelType::CompressionSystolic).is_empty());
    }

    #[test]
    fn toggle_prefers_first_type_in_scan_order() {
        let mut store = LabelStore::new();
        store.set_points_for_type(0, LabelType::CompressionSystolic, [50]);
        store.set_points_for_type(0, LabelType::CompressionDiastolic, [50]);

        let outcome = store.toggle_point(0, 51, LabelType::SpontaneousSystolic, 3);
        assert_eq!(
            outcome,
            ToggleOutcome::Removed { label_type: LabelType::CompressionSystolic, index: 50 }
        );
        assert_eq!(store.points(0, LabelType::CompressionDiastolic), vec![50]);
    }

    #[test]
    fn toggled_points_stay_sorted_and_unique() {
        let mut store = LabelStore::new();
        for index in [900, 10, 450, 10, 1200, 30, 451, 5] {
            store.toggle_point(2, index, LabelType::CompressionSystolic, 0);
        }
        assert_sorted_unique(&store, 2);
        assert_eq!(
            store.points(2, LabelType::CompressionSystolic),
            vec![5, 30, 450, 451, 900, 1200]
        );
    }

    #[test]
    fn erase_near_counts_across_types() {
        let mut store = LabelStore::new();
        store.set_points_for_type(1, LabelType::CompressionSystolic, [100, 110, 200]);
        store.set_points_for_type(1, LabelType::SpontaneousDiastolic, [95, 400]);

        assert_eq!(store.erase_near(1, 102, 8), 3);
        assert_eq!(store.erase_near(1, 102, 8), 0);
        assert_eq!(store.points(1, LabelType::CompressionSystolic), vec![200]);
        assert_eq!(store.points(1, LabelType::SpontaneousDiastolic), vec![400]);
    }

    #[test]
    fn remove_nearest_picks_closest_over_scan_order() {
        let mut store = LabelStore::new();
        store.set_points_for_type(0, LabelType::CompressionSystolic, [90]);
        store.set_points_for_type(0, LabelType::SpontaneousSystolic, [99]);

        assert_eq!(
            store.remove_nearest(0, 100, 10),
            Some((LabelType::SpontaneousSystolic, 99))
        );
        assert_eq!(store.remove_nearest(0, 100, 5), None);
        assert_eq!(store.points(0, LabelType::CompressionSystolic), vec![90]);
    }

    #[test]
    fn regions_are_order_normalized() {
        let mut store = LabelStore::new();
        assert_eq!(store.add_region(3, 10, 5), Some(Region { start: 5, end: 10 }));
        assert_eq!(store.add_region(3, 7, 7), None);
        assert_eq!(store.segment(3).unwrap().highlighted_regions.len(), 1);
        assert_eq!(store.clear_regions(3), 1);
        assert!(store.segment(3).unwrap().highlighted_regions.is_empty());
    }

    #[test]
    fn notes_and_review_flags() {
        let mut store = LabelStore::new();
        store.set_note(0, NoteField::Review, "check baseline");
        store.set_note(0, NoteField::Region, "motion");
        store.set_review(0, true);

        let labels = store.segment(0).unwrap();
        assert_eq!(labels.review_note, "check baseline");
        assert_eq!(labels.region_note, "motion");
        assert!(store.has_review());
    }

    #[test]
    fn export_merges_audit_metadata() {
        let mut store = LabelStore::new();
        assert!(store.export(&Map::new()).is_none());

        let state = FileAnnotationState {
            metadata: Some(json!({"source": "import", "labeler": "old"})),
            ..FileAnnotationState::default()
        };
        store.hydrate("patient_7.h5", state);
        store.toggle_point(0, 12, LabelType::CompressionDiastolic, 5);

        let mut audit = Map::new();
        audit.insert("labeler".into(), json!("labeler2"));
        let (file, payload) = store.export(&audit).unwrap();

        assert_eq!(file, "patient_7.h5");
        assert_eq!(payload["_metadata"], json!({"source": "import", "labeler": "labeler2"}));
        assert_eq!(payload["0"]["label_indexes"]["compression_diastolic"], json!([12]));
    }
}
