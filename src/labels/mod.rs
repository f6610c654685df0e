pub mod commands;
pub mod markers;
pub mod store;

pub use markers::FileMarkers;
pub use store::{LabelStore, ToggleOutcome};
