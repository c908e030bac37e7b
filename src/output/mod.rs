//! Output management
//!
//! An [`Output`] represents one physical or virtual display sink. Outputs
//! are owned by the pipeline fleet and referenced everywhere else through
//! their [`OutputId`], so no component but the fleet holds them alive.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Rect, Size, Transform};

bitflags::bitflags! {
    /// Hardware capabilities reported for an output
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputCapabilities: u32 {
        /// Display power management (power off/on)
        const DPMS = 1 << 0;
        /// Overscan compensation
        const OVERSCAN = 1 << 1;
        /// Variable refresh rate
        const VRR = 1 << 2;
        /// Selectable full/limited RGB range
        const RGB_RANGE = 1 << 3;
    }
}

/// RGB quantization range sent to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RgbRange {
    #[default]
    Automatic,
    Full,
    Limited,
}

/// Type-safe identifier for outputs
///
/// Uses NonZeroU32 so IDs are never zero and can be stored in Option
/// without overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(NonZeroU32);

impl OutputId {
    /// Create a new OutputId from a raw value
    /// Returns None if the value is zero
    pub fn from_raw(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(OutputId)
    }

    /// Get the raw value
    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One display mode: pixel size plus refresh rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mode {
    pub size: Size,
    /// Refresh rate in millihertz (60_000 == 60 Hz)
    pub refresh_mhz: u32,
    /// Whether the hardware flags this mode as preferred
    pub preferred: bool,
}

impl Mode {
    pub fn new(size: Size, refresh_mhz: u32, preferred: bool) -> Self {
        Self {
            size,
            refresh_mhz,
            preferred,
        }
    }
}

/// One physical or virtual display sink
#[derive(Debug, Clone)]
pub struct Output {
    id: OutputId,
    name: String,
    /// Stable identity derived from EDID, or the connector name when the
    /// sink reports no EDID; used to key persisted layout records
    identity: String,
    position: Point,
    scale: f64,
    transform: Transform,
    modes: Vec<Mode>,
    current_mode: usize,
    enabled: bool,
    capabilities: OutputCapabilities,
    /// Placeholder outputs keep the fleet non-empty when every real output
    /// is disabled; they carry no hardware
    placeholder: bool,
}

impl Output {
    pub fn new(
        id: OutputId,
        name: impl Into<String>,
        identity: impl Into<String>,
        modes: Vec<Mode>,
        capabilities: OutputCapabilities,
    ) -> Self {
        debug_assert!(!modes.is_empty(), "an output must expose at least one mode");
        Self {
            id,
            name: name.into(),
            identity: identity.into(),
            position: Point::new(0, 0),
            scale: 1.0,
            transform: Transform::Normal,
            modes,
            current_mode: 0,
            enabled: true,
            capabilities,
            placeholder: false,
        }
    }

    /// A zero-footprint placeholder output
    pub fn placeholder(id: OutputId) -> Self {
        let mut output = Self::new(
            id,
            format!("placeholder-{id}"),
            format!("placeholder-{id}"),
            vec![Mode::new(Size::new(1920, 1080), 60_000, true)],
            OutputCapabilities::empty(),
        );
        output.placeholder = true;
        output
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn capabilities(&self) -> OutputCapabilities {
        self.capabilities
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn set_position(&mut self, position: Point) {
        self.position = position;
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: f64) {
        debug_assert!(scale > 0.0, "output scale must be positive");
        self.scale = scale;
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn current_mode_index(&self) -> usize {
        self.current_mode
    }

    pub fn current_mode(&self) -> Mode {
        self.modes[self.current_mode]
    }

    /// Index of the mode the hardware flags as preferred, falling back to
    /// the first mode
    pub fn preferred_mode_index(&self) -> usize {
        self.modes.iter().position(|mode| mode.preferred).unwrap_or(0)
    }

    pub fn set_current_mode(&mut self, index: usize) -> bool {
        if index >= self.modes.len() {
            tracing::warn!(
                "Output {}: mode index {index} out of range ({} modes)",
                self.name,
                self.modes.len()
            );
            return false;
        }
        self.current_mode = index;
        true
    }

    pub fn refresh_mhz(&self) -> u32 {
        self.current_mode().refresh_mhz
    }

    /// Size in logical coordinates: the pixel size mapped through the
    /// output transform and divided by the scale factor
    pub fn logical_size(&self) -> Size {
        let pixel = self.transform.map_size(self.current_mode().size);
        Size::new(
            (pixel.w as f64 / self.scale).round() as i32,
            (pixel.h as f64 / self.scale).round() as i32,
        )
    }

    /// The output's rectangle in the global logical plane
    pub fn geometry(&self) -> Rect {
        Rect::new(self.position, self.logical_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_output() -> Output {
        Output::new(
            OutputId::from_raw(1).unwrap(),
            "DP-1",
            "edid-test",
            vec![
                Mode::new(Size::new(3840, 2160), 144_000, false),
                Mode::new(Size::new(1920, 1080), 60_000, true),
            ],
            OutputCapabilities::DPMS | OutputCapabilities::VRR,
        )
    }

    #[test]
    fn geometry_respects_scale_and_transform() {
        let mut output = test_output();
        output.set_position(Point::new(100, 0));
        output.set_scale(2.0);
        assert_eq!(output.geometry(), Rect::from_coords(100, 0, 1920, 1080));

        output.set_transform(Transform::Rotate90);
        assert_eq!(output.geometry(), Rect::from_coords(100, 0, 1080, 1920));
    }

    #[test]
    fn preferred_mode_lookup() {
        let output = test_output();
        assert_eq!(output.preferred_mode_index(), 1);
        assert_eq!(output.current_mode().refresh_mhz, 144_000);
    }

    #[test]
    fn mode_switch_rejects_out_of_range() {
        let mut output = test_output();
        assert!(!output.set_current_mode(5));
        assert_eq!(output.current_mode_index(), 0);
        assert!(output.set_current_mode(1));
        assert_eq!(output.refresh_mhz(), 60_000);
    }
}
