//! Scene and damage tracking
//!
//! The scene decides the minimal set of regions and items to redraw for
//! one output, each frame. There are three phases per paint, always in
//! order for a given output: `pre_paint` snapshots the stacking order and
//! accumulates damage, `paint` executes the plan against an
//! [`ItemRenderer`], and `post_paint` notifies items and discards the
//! snapshot. Paint passes for different outputs may interleave freely.
//!
//! Two damage strategies exist. The generic path gives up on clipping
//! whenever a screen transform is active and repaints every visible item
//! over the full output. The simple path (default) accumulates per-item
//! damage and then culls occluded regions top-to-bottom: an item below a
//! fully opaque item is never repainted for a region it cannot show
//! through.

mod item;

pub use item::{ItemHandle, ItemRenderer, SceneItem};

use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::geometry::Point;
use crate::output::{Output, OutputId};
use crate::region::Region;
use crate::render_loop::{FullscreenSurface, RenderLoop};

bitflags::bitflags! {
    /// Paint pass flags, set during pre-paint and consumed during paint
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PaintFlags: u32 {
        /// A whole-screen transform is active; clipping is unreliable
        const SCREEN_TRANSFORMED = 1 << 0;
        /// The item paints with translucency; it does not occlude
        const WINDOW_TRANSLUCENT = 1 << 1;
        /// The item itself is transformed; its clip cannot be trusted
        const WINDOW_TRANSFORMED = 1 << 2;
    }
}

/// Per-item plan entry built during pre-paint
///
/// The item is held weakly: an item that disappears between `pre_paint`
/// and `paint` (closed mid-frame) is treated as already removed.
#[derive(Debug, Clone)]
struct Phase2Data {
    item: Weak<dyn SceneItem>,
    /// Clip region; for the generic path this is the full output rect
    region: Region,
    opaque: Region,
    flags: PaintFlags,
}

/// The executed plan for one frame, exposed for inspection by tests and
/// the presentation layer
#[derive(Debug, Default)]
pub struct PaintPlan {
    /// Region filled with background (not covered by any opaque item)
    pub background: Region,
    /// Per-item painted regions, bottom to top, already clipped
    pub painted: Vec<Region>,
    /// Total damage handed to the hardware for this frame
    pub damage: Region,
}

/// In-flight paint state for one output, created by `pre_paint` and
/// discarded by `post_paint`
#[derive(Debug)]
struct PaintContext {
    flags: PaintFlags,
    damage: Region,
    phase2: Vec<Phase2Data>,
    snapshot: Vec<Weak<dyn SceneItem>>,
    expected_present: Option<Instant>,
    painted: bool,
}

/// Damage engine and paint planner for all outputs
pub struct Scene {
    /// All attached items, bottom to top stacking order
    items: Vec<ItemHandle>,
    /// Items temporarily elevated above everything else
    elevated: Vec<Weak<dyn SceneItem>>,
    /// Damage accumulated between frames, per output, in output-local
    /// coordinates. Folded into a paint pass by `pre_paint` and only
    /// cleared there, so damage is never lost.
    pending_damage: HashMap<OutputId, Region>,
    /// In-flight paint state per output
    contexts: HashMap<OutputId, PaintContext>,
    /// While locked, only lock-screen/input-method surfaces are painted
    session_locked: bool,
    /// Set by the embedder when a whole-screen transform effect is active
    screen_transform_active: bool,
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("items", &self.items.len())
            .field("pending_damage", &self.pending_damage)
            .field("session_locked", &self.session_locked)
            .finish()
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            elevated: Vec::new(),
            pending_damage: HashMap::new(),
            contexts: HashMap::new(),
            session_locked: false,
            screen_transform_active: false,
        }
    }

    /// Attach an item at the top of the stacking order
    pub fn add_item(&mut self, item: ItemHandle) {
        self.items.push(item);
    }

    /// Detach an item; its already-recorded damage stays pending
    pub fn remove_item(&mut self, item: &ItemHandle) {
        self.items.retain(|existing| !Rc::ptr_eq(existing, item));
        self.elevated.retain(|weak| weak.upgrade().is_some_and(|e| !Rc::ptr_eq(&e, item)));
    }

    /// Detach every item (compositor shutdown)
    pub fn clear_items(&mut self) -> Vec<ItemHandle> {
        self.elevated.clear();
        std::mem::take(&mut self.items)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Restack an item to the top
    pub fn raise_item(&mut self, item: &ItemHandle) {
        if let Some(pos) = self.items.iter().position(|existing| Rc::ptr_eq(existing, item)) {
            let item = self.items.remove(pos);
            self.items.push(item);
        }
    }

    /// Temporarily paint an item above everything else
    pub fn elevate_item(&mut self, item: &ItemHandle) {
        self.elevated.push(Rc::downgrade(item));
    }

    pub fn clear_elevated(&mut self) {
        self.elevated.clear();
    }

    pub fn set_session_locked(&mut self, locked: bool) {
        self.session_locked = locked;
    }

    pub fn set_screen_transform_active(&mut self, active: bool) {
        self.screen_transform_active = active;
    }

    /// Record damage for an output, in output-local coordinates
    ///
    /// Damage accumulated between two `pre_paint` calls is never lost; it
    /// is only cleared after being folded into a paint pass.
    pub fn add_repaint(&mut self, output: &Output, region: &Region) {
        let entry = self.pending_damage.entry(output.id()).or_default();
        let clipped = region.intersected(&crate::geometry::Rect::from_size(output.logical_size()));
        entry.add_region(&clipped);
    }

    /// Damage the whole output
    pub fn add_repaint_full(&mut self, output: &Output) {
        self.add_repaint(output, &Region::from_rect(crate::geometry::Rect::from_size(output.logical_size())));
    }

    /// Pending damage for an output (test/inspection hook)
    pub fn pending_damage(&self, output: OutputId) -> Region {
        self.pending_damage.get(&output).cloned().unwrap_or_default()
    }

    /// Single item eligible for direct scanout on this output, if any
    ///
    /// A pure query, recomputed every frame: stacking and opacity can
    /// change between frames, so the result is never cached.
    pub fn scanout_candidate(&self, output: &Output) -> Option<ItemHandle> {
        let order = self.visible_items(output);
        let top = order.last()?;
        if top.opacity() != 1.0 || !top.is_fullscreen_on(output) {
            return None;
        }
        // pixel-aligned at the output origin
        if top.bounding_rect().loc != output.position() {
            return None;
        }
        let full = output.geometry();
        if !top.buffer_is_opaque() && !top.opaque_region().contains_rect(&full) {
            return None;
        }
        Some(top.clone())
    }

    /// The fullscreen cadence description for the loop, when a scanout
    /// candidate exists
    pub fn fullscreen_surface(&self, output: &Output) -> Option<FullscreenSurface> {
        self.scanout_candidate(output).map(|item| FullscreenSurface {
            refresh_mhz: output.refresh_mhz(),
            wants_vrr: item.wants_vrr(),
        })
    }

    /// Stacking snapshot for one output: ready items on this output, lock
    /// filtering applied, elevated items hoisted to the top
    fn visible_items(&self, output: &Output) -> Vec<ItemHandle> {
        let mut order: Vec<ItemHandle> = self
            .items
            .iter()
            .filter(|item| item.is_ready() && item.is_on_output(output))
            .filter(|item| !self.session_locked || item.is_lock_surface())
            .cloned()
            .collect();
        for weak in &self.elevated {
            let Some(elevated) = weak.upgrade() else {
                continue;
            };
            if let Some(pos) = order.iter().position(|item| Rc::ptr_eq(item, &elevated)) {
                let item = order.remove(pos);
                order.push(item);
            }
        }
        order
    }

    /// First paint phase: snapshot stacking, pick a damage strategy and
    /// build the phase-2 plan.
    #[profiling::function]
    pub fn pre_paint(&mut self, output: &Output, render_loop: &RenderLoop) {
        assert!(
            !self.contexts.contains_key(&output.id()),
            "re-entrant pre_paint for output {} before post_paint",
            output.id()
        );

        let order = self.visible_items(output);
        let mut context = PaintContext {
            flags: if self.screen_transform_active || !output.transform().is_identity() {
                PaintFlags::SCREEN_TRANSFORMED
            } else {
                PaintFlags::empty()
            },
            damage: Region::new(),
            phase2: Vec::with_capacity(order.len()),
            snapshot: order.iter().map(Rc::downgrade).collect(),
            expected_present: render_loop.next_presentation_timestamp(),
            painted: false,
        };

        let output_rect = crate::geometry::Rect::from_size(output.logical_size());
        let to_local = Point::new(-output.position().x, -output.position().y);

        if context.flags.contains(PaintFlags::SCREEN_TRANSFORMED) {
            // Generic path: no clipping, every visible item is painted and
            // the whole output is damaged. Item damage is still consumed.
            for item in &order {
                let _ = item.take_damage();
                context.phase2.push(Phase2Data {
                    item: Rc::downgrade(item),
                    region: Region::from_rect(output_rect),
                    opaque: Region::new(),
                    flags: context.flags,
                });
            }
            context.damage = Region::from_rect(output_rect);
            // the accumulated repaint region is subsumed by the full rect
            self.pending_damage.remove(&output.id());
        } else {
            // Simple path: accumulate item damage, then cull occluded
            // damage from topmost to bottommost.
            for item in &order {
                let damage = item.take_damage().translated(to_local).intersected(&output_rect);
                let mut flags = PaintFlags::empty();
                let mut opaque = Region::new();
                if item.opacity() == 1.0 {
                    opaque = item.opaque_region().translated(to_local).intersected(&output_rect);
                } else {
                    flags |= PaintFlags::WINDOW_TRANSLUCENT;
                }
                context.phase2.push(Phase2Data {
                    item: Rc::downgrade(item),
                    region: damage,
                    opaque,
                    flags,
                });
            }

            // occlusion cull: damage hidden under opaque items is dropped
            let mut opaque = Region::new();
            for data in context.phase2.iter().rev() {
                let mut visible_damage = data.region.clone();
                visible_damage.subtract_region(&opaque);
                context.damage.add_region(&visible_damage);
                if !data.flags.intersects(PaintFlags::WINDOW_TRANSLUCENT | PaintFlags::WINDOW_TRANSFORMED) {
                    opaque.add_region(&data.opaque);
                }
            }

            // fold in externally requested repaints; cleared only here
            if let Some(pending) = self.pending_damage.remove(&output.id()) {
                context.damage.add_region(&pending);
            }
            context.damage.intersect_rect(&output_rect);
        }

        self.contexts.insert(output.id(), context);
    }

    /// Expected presentation timestamp snapshotted at `pre_paint`
    pub fn expected_present(&self, output: OutputId) -> Option<Instant> {
        self.contexts.get(&output).and_then(|context| context.expected_present)
    }

    /// Second paint phase: execute the plan against the renderer.
    ///
    /// For the simple path this is the occlusion culling pass: each item is
    /// painted only where `(visible region) ∩ (item clip)` is non-empty,
    /// and the background fill covers only the region no opaque item
    /// covers. Items that vanished since `pre_paint` are skipped.
    #[profiling::function]
    pub fn paint(&mut self, output: &Output, renderer: &mut dyn ItemRenderer) -> PaintPlan {
        let Some(context) = self.contexts.get_mut(&output.id()) else {
            tracing::error!("Scene::paint without pre_paint for output {}", output.id());
            return PaintPlan::default();
        };
        context.painted = true;

        let output_rect = crate::geometry::Rect::from_size(output.logical_size());
        let mut plan = PaintPlan {
            damage: context.damage.clone(),
            ..PaintPlan::default()
        };

        if context.flags.contains(PaintFlags::SCREEN_TRANSFORMED) {
            // generic: background first, then every item unclipped
            plan.background = Region::from_rect(output_rect);
            renderer.render_background(&plan.background);
            for data in &context.phase2 {
                let Some(item) = data.item.upgrade() else {
                    continue;
                };
                renderer.render_item(&item, &data.region);
                plan.painted.push(data.region.clone());
            }
            return plan;
        }

        // top-to-bottom visibility pass over the damaged region
        let mut visible = context.damage.clone();
        let mut clipped: Vec<Region> = vec![Region::new(); context.phase2.len()];
        for (index, data) in context.phase2.iter().enumerate().rev() {
            let Some(item) = data.item.upgrade() else {
                // closed mid-frame; treat as already removed
                continue;
            };
            let mut region = visible.clone();
            if !data.flags.contains(PaintFlags::WINDOW_TRANSFORMED) {
                let local_bounds = item
                    .bounding_rect()
                    .translated(Point::new(-output.position().x, -output.position().y));
                region.intersect_rect(&local_bounds);
                if !data.flags.contains(PaintFlags::WINDOW_TRANSLUCENT) {
                    visible.subtract_region(&data.opaque);
                }
            }
            clipped[index] = region;
        }

        // whatever stayed visible under every opaque item is background
        plan.background = visible;
        renderer.render_background(&plan.background);

        for (data, region) in context.phase2.iter().zip(clipped) {
            if region.is_empty() {
                // completely clipped
                continue;
            }
            let Some(item) = data.item.upgrade() else {
                continue;
            };
            renderer.render_item(&item, &region);
            plan.painted.push(region);
        }
        plan
    }

    /// Final paint phase: notify every previously-visible item that its
    /// frame was consumed and drop the stacking snapshot. Damage recorded
    /// for future frames during paint survives.
    #[profiling::function]
    pub fn post_paint(&mut self, output: &Output, frame_time: Instant) {
        let Some(context) = self.contexts.remove(&output.id()) else {
            tracing::error!("Scene::post_paint without pre_paint for output {}", output.id());
            return;
        };
        if !context.painted {
            tracing::debug!("Scene: frame for output {} dropped before paint", output.id());
        }
        for weak in &context.snapshot {
            if let Some(item) = weak.upgrade() {
                if item.is_on_output(output) {
                    item.frame_rendered(frame_time);
                }
            }
        }
    }
}
