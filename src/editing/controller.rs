use log::debug;
use serde::Serialize;

use crate::labels::{LabelStore, ToggleOutcome};
use crate::models::{LabelType, Region, SegmentLayout};

use super::{CoordinateMapper, EditMode, EditingConfig, PointerButton, RegionPhase, ViewWindow};

/// Everything a pointer event needs to resolve to an in-segment offset.
#[derive(Debug, Clone, Copy)]
pub struct PointerContext {
    pub segment: u32,
    pub layout: SegmentLayout,
    pub view: ViewWindow,
}

impl PointerContext {
    fn offset_at(&self, pixel_x: f64) -> Option<u32> {
        let mapper = CoordinateMapper::new(self.view, self.layout.sampling_rate);
        let sample = mapper.to_sample_index(pixel_x)?;
        self.layout.offset(sample)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EditOutcome {
    Ignored,
    PointAdded { label_type: LabelType, index: u32 },
    PointRemoved { label_type: LabelType, index: u32 },
    Erased { count: usize },
    RegionStarted { start: u32 },
    RegionCommitted { region: Region },
}

impl EditOutcome {
    /// Whether the label data changed and needs saving.
    pub fn mutated(&self) -> bool {
        match self {
            EditOutcome::Ignored | EditOutcome::RegionStarted { .. } => false,
            EditOutcome::Erased { count } => *count > 0,
            EditOutcome::PointAdded { .. }
            | EditOutcome::PointRemoved { .. }
            | EditOutcome::RegionCommitted { .. } => true,
        }
    }
}

impl From<ToggleOutcome> for EditOutcome {
    fn from(outcome: ToggleOutcome) -> Self {
        match outcome {
            ToggleOutcome::Added { label_type, index } => {
                EditOutcome::PointAdded { label_type, index }
            }
            ToggleOutcome::Removed { label_type, index } => {
                EditOutcome::PointRemoved { label_type, index }
            }
        }
    }
}

/// Routes pointer and keyboard input to `LabelStore` mutations.
///
/// All mode transitions live here. The store is borrowed per event so the
/// mutation for each event is applied before the call returns.
#[derive(Debug)]
pub struct EditingController {
    mode: EditMode,
    label_type: LabelType,
    modifier_held: bool,
    config: EditingConfig,
}

impl EditingController {
    pub fn new(config: EditingConfig) -> Self {
        Self {
            mode: EditMode::Normal,
            label_type: LabelType::CompressionSystolic,
            modifier_held: false,
            config,
        }
    }

    pub fn mode(&self) -> EditMode {
        self.mode
    }

    pub fn label_type(&self) -> LabelType {
        self.label_type
    }

    pub fn set_label_type(&mut self, label_type: LabelType) {
        self.label_type = label_type;
    }

    pub fn config(&self) -> EditingConfig {
        self.config
    }

    /// Normal <-> RegionSelect. Entering starts with no pending endpoint;
    /// leaving discards a half-formed region. An active eraser sweep ends
    /// and region selection starts.
    pub fn toggle_region_select(&mut self) -> EditMode {
        self.mode = match self.mode {
            EditMode::RegionSelect { phase } => {
                if let RegionPhase::AwaitingEnd { start } = phase {
                    debug!("Discarding pending region start at {start}");
                }
                EditMode::Normal
            }
            EditMode::Normal | EditMode::Eraser => EditMode::RegionSelect {
                phase: RegionPhase::AwaitingStart,
            },
        };
        self.mode
    }

    /// Releasing the modifier ends an eraser sweep.
    pub fn set_modifier(&mut self, held: bool) {
        self.modifier_held = held;
        if !held && self.mode.is_eraser() {
            self.mode = EditMode::Normal;
        }
    }

    pub fn pointer_down(
        &mut self,
        store: &mut LabelStore,
        ctx: &PointerContext,
        pixel_x: f64,
        button: PointerButton,
    ) -> EditOutcome {
        if button == PointerButton::Secondary {
            return self.remove_nearest(store, ctx, pixel_x);
        }

        if self.modifier_held {
            if self.mode.is_region_select() {
                return EditOutcome::Ignored;
            }
            self.mode = EditMode::Eraser;
        }

        let Some(offset) = ctx.offset_at(pixel_x) else {
            return EditOutcome::Ignored;
        };

        match self.mode {
            EditMode::Normal => store
                .toggle_point(ctx.segment, offset, self.label_type, self.config.point_tolerance)
                .into(),
            EditMode::Eraser => EditOutcome::Erased {
                count: store.erase_near(ctx.segment, offset, self.config.erase_tolerance),
            },
            EditMode::RegionSelect { phase } => self.region_click(store, ctx.segment, offset, phase),
        }
    }

    /// Only the eraser reacts to motion; each move erases immediately.
    pub fn pointer_move(
        &mut self,
        store: &mut LabelStore,
        ctx: &PointerContext,
        pixel_x: f64,
    ) -> EditOutcome {
        if !self.mode.is_eraser() {
            return EditOutcome::Ignored;
        }
        match ctx.offset_at(pixel_x) {
            Some(offset) => EditOutcome::Erased {
                count: store.erase_near(ctx.segment, offset, self.config.erase_tolerance),
            },
            None => EditOutcome::Ignored,
        }
    }

    /// Pointer released or left the plot.
    pub fn pointer_up(&mut self) {
        if self.mode.is_eraser() {
            self.mode = EditMode::Normal;
        }
    }

    /// Called when the visible segment or file changes. A pending region
    /// endpoint belongs to the old segment and is dropped; region selection
    /// itself stays on.
    pub fn reset_for_navigation(&mut self) {
        self.mode = match self.mode {
            EditMode::RegionSelect { .. } => EditMode::RegionSelect {
                phase: RegionPhase::AwaitingStart,
            },
            EditMode::Normal | EditMode::Eraser => EditMode::Normal,
        };
    }

    fn region_click(
        &mut self,
        store: &mut LabelStore,
        segment: u32,
        offset: u32,
        phase: RegionPhase,
    ) -> EditOutcome {
        match phase {
            RegionPhase::AwaitingStart => {
                self.mode = EditMode::RegionSelect {
                    phase: RegionPhase::AwaitingEnd { start: offset },
                };
                EditOutcome::RegionStarted { start: offset }
            }
            RegionPhase::AwaitingEnd { start } => {
                self.mode = EditMode::RegionSelect {
                    phase: RegionPhase::AwaitingStart,
                };
                match store.add_region(segment, start, offset) {
                    Some(region) => EditOutcome::RegionCommitted { region },
                    None => EditOutcome::Ignored,
                }
            }
        }
    }

    fn remove_nearest(
        &self,
        store: &mut LabelStore,
        ctx: &PointerContext,
        pixel_x: f64,
    ) -> EditOutcome {
        let Some(offset) = ctx.offset_at(pixel_x) else {
            return EditOutcome::Ignored;
        };
        match store.remove_nearest(ctx.segment, offset, self.config.point_tolerance) {
            Some((label_type, index)) => EditOutcome::PointRemoved { label_type, index },
            None => EditOutcome::Ignored,
        }
    }
}

impl Default for EditingController {
    fn default() -> Self {
        Self::new(EditingConfig::default())
    }
}
