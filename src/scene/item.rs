//! Paintable item contract
//!
//! The scene does not own window content. It consumes a tree of paintable
//! items supplied externally; the only thing it requires of an item is
//! the narrow contract below: where it is, what part of it is opaque, what
//! changed since the last frame, and whether it can be painted at all.

use std::rc::Rc;
use std::time::Instant;

use crate::geometry::Rect;
use crate::output::Output;
use crate::region::Region;

/// Shared handle to a paintable item
///
/// Items live on the single compositor thread; the scene's stacking
/// snapshot downgrades these to `Weak` so an item closed mid-frame is
/// simply skipped instead of kept alive or crashed on.
pub type ItemHandle = Rc<dyn SceneItem>;

/// One paintable item (a window, a drag icon, a lock surface)
///
/// All coordinates are global logical coordinates. Implementations use
/// interior mutability where the contract consumes state (`take_damage`).
pub trait SceneItem {
    /// Bounding/clip rectangle
    fn bounding_rect(&self) -> Rect;

    /// The sub-region guaranteed fully opaque
    fn opaque_region(&self) -> Region;

    /// Damage accumulated since it was last consumed; calling this resets
    /// the item's damage
    fn take_damage(&self) -> Region;

    /// Whether the item is ready to be painted at all
    fn is_ready(&self) -> bool;

    /// Whether the item belongs on the given output
    fn is_on_output(&self, output: &Output) -> bool;

    fn opacity(&self) -> f64 {
        1.0
    }

    /// Whether the item covers the given output exactly, fullscreen
    fn is_fullscreen_on(&self, output: &Output) -> bool {
        self.bounding_rect() == output.geometry()
    }

    /// Whether the item's buffer has no alpha channel (or is known fully
    /// opaque); gates direct scanout
    fn buffer_is_opaque(&self) -> bool {
        false
    }

    /// Whether the content requested variable refresh timing
    fn wants_vrr(&self) -> bool {
        false
    }

    /// Lock-screen and input-method surfaces stay visible while the
    /// session is locked
    fn is_lock_surface(&self) -> bool {
        false
    }

    /// The frame containing this item was consumed; used by clients for
    /// frame-callback timing
    fn frame_rendered(&self, timestamp: Instant);
}

/// Rasterization sink for one paint pass
///
/// The scene decides *what* to paint and with which clip region; how the
/// pixels are produced (GL, software, nothing at all in tests) is behind
/// this trait.
pub trait ItemRenderer {
    /// Fill the background for the region not covered by any opaque item
    fn render_background(&mut self, region: &Region);

    /// Paint one item clipped to `region`
    fn render_item(&mut self, item: &ItemHandle, region: &Region);
}
