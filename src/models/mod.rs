pub mod labels;
pub mod recording;

pub use labels::{
    FileAnnotationState, LabelFamily, LabelIndexes, LabelType, LoadReport, NoteField, Region,
    SegmentLabels, METADATA_KEY,
};
pub use recording::{Recording, RecordingMetadata, SegmentLayout};
