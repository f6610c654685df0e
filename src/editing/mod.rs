pub mod commands;
pub mod config;
pub mod controller;
pub mod coords;
pub mod state;

pub use config::EditingConfig;
pub use controller::{EditOutcome, EditingController, PointerContext};
pub use coords::{CoordinateMapper, ViewWindow};
pub use state::{EditMode, PointerButton, RegionPhase};
