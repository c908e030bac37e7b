//! Compositor orchestration
//!
//! The [`Compositor`] ties the pieces together: it owns the [`Scene`],
//! the [`PipelineFleet`] and the active [`HardwareDevice`], drives the
//! per-output frame cycle, and mediates lifecycle transitions (start,
//! stop, suspend, session switches).
//!
//! The core owns no event loop. The embedder drains [`CompositorEvent`]s
//! from the bus, calls [`Compositor::handle_frame_requested`] when a
//! `FrameRequested` event arrives, submits the returned [`PaintPlan`] to
//! its renderer and hardware, and reports the outcome back through
//! [`Compositor::notify_presented`] or [`Compositor::notify_frame_failed`].

use std::time::Instant;

use crate::backend::{BackendKind, HardwareDevice};
use crate::error::{VesperError, VesperResult};
use crate::event::{CompositorEvent, EventBus};
use crate::output::{Output, OutputId};
use crate::pipeline::PipelineFleet;
use crate::region::Region;
use crate::render_loop::{FrameSink, FrameState};
use crate::scene::{ItemRenderer, PaintPlan, Scene};

/// Lifecycle of the compositor as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositorState {
    #[default]
    Off,
    Starting,
    On,
    Stopping,
}

bitflags::bitflags! {
    /// Why compositing is suspended; it restarts only when every reason
    /// has been cleared
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SuspendReason: u32 {
        const USER_REQUESTED = 1 << 0;
        const WINDOW_RULE = 1 << 1;
        const SCRIPT = 1 << 2;
    }
}

/// Forwards render loop notifications onto the event bus
struct BusSink<'a> {
    bus: &'a mut EventBus,
}

impl FrameSink for BusSink<'_> {
    fn frame_requested(&mut self, output: OutputId) {
        self.bus.emit(CompositorEvent::FrameRequested { output });
    }

    fn frame_presented(&mut self, output: OutputId, timestamp: Instant) {
        self.bus.emit(CompositorEvent::FramePresented { output, timestamp });
    }

    fn refresh_rate_changed(&mut self, output: OutputId, refresh_mhz: u32) {
        self.bus
            .emit(CompositorEvent::RefreshRateChanged { output, refresh_mhz });
    }
}

pub struct Compositor {
    state: CompositorState,
    scene: Scene,
    fleet: PipelineFleet,
    device: Option<Box<dyn HardwareDevice>>,
    events: EventBus,
    suspend_reasons: SuspendReason,
    session_active: bool,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compositor {
    pub fn new() -> Self {
        Self {
            state: CompositorState::Off,
            scene: Scene::new(),
            fleet: PipelineFleet::new(),
            device: None,
            events: EventBus::new(),
            suspend_reasons: SuspendReason::empty(),
            session_active: true,
        }
    }

    pub fn state(&self) -> CompositorState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == CompositorState::On
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn fleet(&self) -> &PipelineFleet {
        &self.fleet
    }

    pub fn fleet_mut(&mut self) -> &mut PipelineFleet {
        &mut self.fleet
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn device(&self) -> Option<&dyn HardwareDevice> {
        self.device.as_deref()
    }

    /// Start compositing. The user-configured backend kind is taken first
    /// when a candidate of that kind is available; otherwise candidates are
    /// tried in fallback priority order. Fatal only when no candidate at
    /// all is usable.
    pub fn start(
        &mut self,
        mut candidates: Vec<Box<dyn HardwareDevice>>,
        preferred: Option<BackendKind>,
        now: Instant,
    ) -> VesperResult<()> {
        if self.state != CompositorState::Off {
            tracing::debug!("Compositing already running, ignoring start");
            return Ok(());
        }
        self.state = CompositorState::Starting;

        let mut chosen = preferred.and_then(|kind| {
            candidates
                .iter()
                .position(|d| d.kind() == kind)
                .map(|index| candidates.swap_remove(index))
        });
        if chosen.is_none() {
            for kind in BackendKind::fallback_priority() {
                if let Some(index) = candidates.iter().position(|d| d.kind() == *kind) {
                    chosen = Some(candidates.swap_remove(index));
                    break;
                }
            }
        }
        // an unranked candidate (e.g. NoCompositing) is still better than
        // nothing
        let device = match chosen.or_else(|| candidates.pop()) {
            Some(device) => device,
            None => {
                self.state = CompositorState::Off;
                return Err(VesperError::NoBackend(
                    "no usable compositing backend".into(),
                ));
            }
        };
        tracing::info!("Compositing starts with the {} backend", device.name());
        self.device = Some(device);
        self.begin(now);
        Ok(())
    }

    fn begin(&mut self, now: Instant) {
        self.state = CompositorState::On;
        self.events.emit(CompositorEvent::CompositingToggled { active: true });
        self.prime_all_outputs(now);
    }

    /// Every enabled output starts with a full repaint, so the first frame
    /// never depends on accumulated damage
    fn prime_all_outputs(&mut self, now: Instant) {
        let ids: Vec<OutputId> = self.fleet.iter().map(|p| p.id()).collect();
        for id in ids {
            let Some(pipeline) = self.fleet.get_mut(id) else { continue };
            if !pipeline.output().is_enabled() {
                continue;
            }
            self.scene.add_repaint_full(pipeline.output());
            pipeline
                .render_loop_mut()
                .schedule_repaint(now, &mut BusSink { bus: &mut self.events });
        }
    }

    /// Stop compositing. Scene items survive (their owners keep them
    /// alive), but the scene's item list is cleared; the embedder re-adds
    /// its items when it sees `CompositingToggled { active: true }`.
    /// Re-entrant calls are no-ops.
    pub fn stop(&mut self) {
        if !matches!(self.state, CompositorState::On | CompositorState::Starting) {
            return;
        }
        self.state = CompositorState::Stopping;
        self.scene.clear_items();
        self.state = CompositorState::Off;
        self.events.emit(CompositorEvent::CompositingToggled { active: false });
        tracing::info!("Compositing stopped");
    }

    /// Record a reason to keep compositing off. The first reason stops
    /// compositing; further reasons stack.
    pub fn suspend(&mut self, reason: SuspendReason) {
        let was_empty = self.suspend_reasons.is_empty();
        self.suspend_reasons |= reason;
        if was_empty {
            tracing::info!("Compositing suspended ({reason:?})");
            self.stop();
        }
    }

    /// Clear a suspend reason; compositing restarts only once every reason
    /// is gone and a backend is still available.
    pub fn resume(&mut self, reason: SuspendReason, now: Instant) {
        self.suspend_reasons -= reason;
        if !self.suspend_reasons.is_empty() {
            return;
        }
        if self.device.is_none() {
            tracing::warn!("Cannot resume compositing, no backend");
            return;
        }
        if self.state == CompositorState::Off {
            self.begin(now);
        }
    }

    pub fn suspend_reasons(&self) -> SuspendReason {
        self.suspend_reasons
    }

    /// Session switched to or from this compositor's VT. While away, all
    /// render loops are inhibited; switching back releases them and any
    /// deferred repaints fire.
    pub fn set_session_active(&mut self, active: bool, now: Instant) {
        if self.session_active == active {
            return;
        }
        self.session_active = active;
        if active {
            self.fleet
                .uninhibit_all(now, &mut BusSink { bus: &mut self.events });
        } else {
            self.fleet.inhibit_all();
        }
    }

    /// The session controller paused our GPU access (another compositor
    /// holds the device); stop scheduling frames until resumed
    pub fn device_paused(&mut self) {
        self.fleet.inhibit_all();
    }

    pub fn device_resumed(&mut self, now: Instant) {
        self.fleet
            .uninhibit_all(now, &mut BusSink { bus: &mut self.events });
    }

    /// Register a newly connected output and prime its first frame
    pub fn add_output(&mut self, output: Output, now: Instant) -> OutputId {
        let id = self.fleet.add_output(output);
        self.events.emit(CompositorEvent::OutputAdded { output: id });
        if self.state == CompositorState::On {
            if let Some(pipeline) = self.fleet.get_mut(id) {
                self.scene.add_repaint_full(pipeline.output());
                pipeline
                    .render_loop_mut()
                    .schedule_repaint(now, &mut BusSink { bus: &mut self.events });
            }
        }
        id
    }

    /// An output vanished; its pipeline and render loop are dropped and
    /// placeholder provisioning keeps the fleet non-empty
    pub fn remove_output(&mut self, id: OutputId) {
        if self.fleet.remove_output(id).is_some() {
            self.events.emit(CompositorEvent::OutputRemoved { output: id });
        }
    }

    /// Request a repaint of a region of the global logical plane; fans out
    /// to every enabled output it intersects, translated to output-local
    /// coordinates.
    pub fn add_repaint(&mut self, region: &Region, now: Instant) {
        if self.state != CompositorState::On {
            return;
        }
        let targets: Vec<(OutputId, Region)> = self
            .fleet
            .enabled_outputs()
            .filter_map(|output| {
                let geometry = output.geometry();
                let local = region
                    .intersected(&geometry)
                    .translated(crate::geometry::Point::new(-geometry.loc.x, -geometry.loc.y));
                (!local.is_empty()).then(|| (output.id(), local))
            })
            .collect();
        for (id, local) in targets {
            let Some(pipeline) = self.fleet.get_mut(id) else { continue };
            self.scene.add_repaint(pipeline.output(), &local);
            pipeline
                .render_loop_mut()
                .schedule_repaint(now, &mut BusSink { bus: &mut self.events });
        }
    }

    /// Repaint everything everywhere
    pub fn add_repaint_full(&mut self, now: Instant) {
        if self.state != CompositorState::On {
            return;
        }
        let ids: Vec<OutputId> = self
            .fleet
            .enabled_outputs()
            .map(|output| output.id())
            .collect();
        for id in ids {
            let Some(pipeline) = self.fleet.get_mut(id) else { continue };
            self.scene.add_repaint_full(pipeline.output());
            pipeline
                .render_loop_mut()
                .schedule_repaint(now, &mut BusSink { bus: &mut self.events });
        }
    }

    /// Compose one frame for `output` in response to a `FrameRequested`
    /// event.
    ///
    /// Returns the paint plan the embedder must submit to its renderer and
    /// hardware, or `None` when the request is stale (compositing off, the
    /// output gone or disabled). Presentation feedback comes back through
    /// [`notify_presented`](Self::notify_presented) or
    /// [`notify_frame_failed`](Self::notify_frame_failed).
    #[profiling::function]
    pub fn handle_frame_requested(
        &mut self,
        output: OutputId,
        renderer: &mut dyn ItemRenderer,
        now: Instant,
    ) -> VesperResult<Option<PaintPlan>> {
        if self.state != CompositorState::On {
            // the loop keeps the repaint pending, so the next enablement
            // event (resume, enable) re-fires the request
            if let Some(pipeline) = self.fleet.get_mut(output) {
                pipeline.render_loop_mut().cancel_frame_request();
            }
            return Ok(None);
        }
        let Some(pipeline) = self.fleet.get_mut(output) else {
            // the output raced away between the request and now
            return Ok(None);
        };
        if !pipeline.output().is_enabled() {
            pipeline.render_loop_mut().cancel_frame_request();
            return Ok(None);
        }
        if pipeline.render_loop().state() != FrameState::FrameRequested {
            // the same request served twice; nothing is waiting on a frame
            return Ok(None);
        }

        let output_snapshot = pipeline.output().clone();
        // fullscreen scanout cadence follows the content being presented
        let fullscreen = self.scene.fullscreen_surface(&output_snapshot);
        pipeline.render_loop_mut().set_fullscreen_surface(fullscreen);

        pipeline.render_loop_mut().begin_frame();
        self.scene.pre_paint(&output_snapshot, pipeline.render_loop());
        let plan = self.scene.paint(&output_snapshot, renderer);
        self.scene.post_paint(&output_snapshot, now);
        pipeline.render_loop_mut().end_frame();
        Ok(Some(plan))
    }

    /// The frame composed for `output` reached the screen
    pub fn notify_presented(&mut self, output: OutputId, timestamp: Instant) {
        if let Some(pipeline) = self.fleet.get_mut(output) {
            pipeline
                .render_loop_mut()
                .notify_frame_completed(timestamp, &mut BusSink { bus: &mut self.events });
        }
    }

    /// The frame composed for `output` failed to present; the render loop
    /// retries so the output never stalls
    pub fn notify_frame_failed(&mut self, output: OutputId, now: Instant) {
        if let Some(pipeline) = self.fleet.get_mut(output) {
            tracing::warn!("{}", VesperError::FrameFailed(output));
            // the frame's damage never reached the screen; restore it in
            // full so the retry does not present stale content
            self.scene.add_repaint_full(pipeline.output());
            pipeline
                .render_loop_mut()
                .notify_frame_failed(now, &mut BusSink { bus: &mut self.events });
        }
    }

    /// Poll debounced power-off deadlines across the fleet
    pub fn process_power_off(&mut self, now: Instant) -> VesperResult<()> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        self.fleet.process_power_off(device.as_mut(), now)
    }

    /// Display power management for one output. Power-on commits
    /// immediately; power-off is debounced and completed by
    /// [`process_power_off`](Self::process_power_off).
    pub fn set_dpms(&mut self, id: OutputId, on: bool, now: Instant) -> VesperResult<()> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| VesperError::NoBackend("no active backend".into()))?;
        self.fleet.set_dpms(device.as_mut(), id, on, now)
    }

    /// Disable an output through the fleet's test-then-commit protocol
    pub fn disable_output(&mut self, id: OutputId) -> VesperResult<()> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| VesperError::NoBackend("no active backend".into()))?;
        self.fleet.disable_output(device.as_mut(), id)
    }

    /// Re-enable a previously disabled output
    pub fn enable_output(&mut self, id: OutputId, now: Instant) -> VesperResult<()> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| VesperError::NoBackend("no active backend".into()))?;
        self.fleet.enable_output(device.as_mut(), id)?;
        if self.state == CompositorState::On {
            if let Some(pipeline) = self.fleet.get_mut(id) {
                self.scene.add_repaint_full(pipeline.output());
                pipeline
                    .render_loop_mut()
                    .schedule_repaint(now, &mut BusSink { bus: &mut self.events });
            }
        }
        Ok(())
    }
}
