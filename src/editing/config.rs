/// Tolerances for pointer editing, in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditingConfig {
    /// Click-to-toggle and secondary-click removal radius
    pub point_tolerance: u32,

    /// Eraser sweep radius; kept at least as wide as `point_tolerance`
    pub erase_tolerance: u32,
}

impl EditingConfig {
    pub fn new(point_tolerance: u32, erase_tolerance: u32) -> Self {
        Self {
            point_tolerance,
            erase_tolerance: erase_tolerance.max(point_tolerance),
        }
    }
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self::new(5, 15)
    }
}
