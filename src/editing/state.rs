use serde::Serialize;

/// Progress of a two-click region definition.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum RegionPhase {
    AwaitingStart,
    AwaitingEnd { start: u32 },
}

impl Default for RegionPhase {
    fn default() -> Self {
        RegionPhase::AwaitingStart
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum EditMode {
    Normal,
    /// Drag-erase; lasts while the modifier and the pointer are both held.
    Eraser,
    RegionSelect { phase: RegionPhase },
}

impl Default for EditMode {
    fn default() -> Self {
        EditMode::Normal
    }
}

impl EditMode {
    pub fn is_region_select(&self) -> bool {
        matches!(self, EditMode::RegionSelect { .. })
    }

    pub fn is_eraser(&self) -> bool {
        matches!(self, EditMode::Eraser)
    }

    /// Start of a half-formed region, if one is pending.
    pub fn pending_region_start(&self) -> Option<u32> {
        match self {
            EditMode::RegionSelect {
                phase: RegionPhase::AwaitingEnd { start },
            } => Some(*start),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    Primary,
    /// Right-click / long-press: always removes the nearest point.
    Secondary,
}
