//! Hardware output pipeline
//!
//! An [`OutputPipeline`] models the hardware configuration of one output
//! as two parallel structs: the *pending* configuration (staged, possibly
//! invalid) and the *committed* configuration (the last state the hardware
//! actually accepted). The only mutation protocol is test-then-commit:
//! stage changes into pending, validate the whole affected set atomically
//! with [`OutputPipeline::test_commit`], then either apply (pending
//! becomes committed) or revert (pending snaps back to committed). There
//! is no direct mutate-without-test path for anything that touches
//! hardware state.
//!
//! [`test_commit`] returns a [`TestedCommit`] token; `apply_pending_changes`
//! requires it, so a commit without a prior passing test does not
//! typecheck at the call site.
//!
//! [`test_commit`]: OutputPipeline::test_commit

pub mod fleet;

pub use fleet::PipelineFleet;

use std::time::{Duration, Instant};

use crate::backend::{GpuBuffer, HardwareDevice, InFlightBuffer, StagedConfig};
use crate::error::{VesperError, VesperResult};
use crate::geometry::{Point, Transform};
use crate::output::{Output, OutputId, RgbRange};
use crate::render_loop::{RenderLoop, VrrPolicy};

/// How long a power-off request is debounced before the hardware commit,
/// so a rapid re-wake does not flicker the display
pub const POWER_OFF_DEBOUNCE: Duration = Duration::from_millis(500);

/// Per-channel gamma lookup table; empty means identity
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GammaRamp {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaRamp {
    pub fn is_identity(&self) -> bool {
        self.red.is_empty() && self.green.is_empty() && self.blue.is_empty()
    }
}

/// Cursor plane state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorState {
    pub buffer: Option<GpuBuffer>,
    pub position: Point,
}

/// One output's hardware configuration
///
/// Held twice by the pipeline: once as pending, once as committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub mode_index: usize,
    pub transform: Transform,
    pub overscan: u32,
    pub gamma: GammaRamp,
    pub rgb_range: RgbRange,
    pub vrr: VrrPolicy,
    /// Powered and scanning out
    pub active: bool,
    pub cursor: CursorState,
}

impl PipelineConfig {
    fn initial(output: &Output) -> Self {
        Self {
            mode_index: output.current_mode_index(),
            transform: output.transform(),
            overscan: 0,
            gamma: GammaRamp::default(),
            rgb_range: RgbRange::default(),
            vrr: VrrPolicy::default(),
            active: output.is_enabled(),
            cursor: CursorState::default(),
        }
    }
}

/// A partial configuration update; fields left `None` keep their staged
/// value. Multiple queued changes coalesce last-writer-wins per field.
#[derive(Debug, Clone, Default)]
pub struct PipelineChange {
    pub mode_index: Option<usize>,
    pub transform: Option<Transform>,
    pub overscan: Option<u32>,
    pub gamma: Option<GammaRamp>,
    pub rgb_range: Option<RgbRange>,
    pub vrr: Option<VrrPolicy>,
    pub active: Option<bool>,
}

/// Proof that a set of pipelines passed an atomic hardware test with their
/// current pending configurations
///
/// The token records the staging generation of every tested pipeline;
/// staging further changes invalidates it.
#[derive(Debug)]
#[must_use = "a passing test is only useful if the changes are then applied"]
pub struct TestedCommit {
    entries: Vec<(OutputId, u64)>,
}

impl TestedCommit {
    pub fn covers(&self, output: OutputId, generation: u64) -> bool {
        self.entries
            .iter()
            .any(|&(id, gen)| id == output && gen == generation)
    }
}

/// Hardware state machine for one output
#[derive(Debug)]
pub struct OutputPipeline {
    output: Output,
    render_loop: RenderLoop,
    pending: PipelineConfig,
    committed: PipelineConfig,
    /// Bumped whenever pending is staged; lets a [`TestedCommit`] detect
    /// staleness
    generation: u64,
    /// Deadline of a debounced power-off, armed by `set_dpms(false)`
    power_off_deadline: Option<Instant>,
    /// The cursor sprite was incompatible with the hardware plane; the
    /// scene composites the cursor instead
    software_cursor: bool,
    /// Replaced cursor sprites the plane may still be scanning out; handed
    /// back through `reclaim_cursor_buffers` once their fences signal
    retired_cursors: Vec<InFlightBuffer>,
    /// A commit failed after a passing test; the output is dead until the
    /// next topology re-scan
    failed: bool,
}

impl OutputPipeline {
    pub fn new(output: Output) -> Self {
        let config = PipelineConfig::initial(&output);
        let render_loop = RenderLoop::new(output.id(), output.refresh_mhz());
        Self {
            output,
            render_loop,
            pending: config.clone(),
            committed: config,
            generation: 0,
            power_off_deadline: None,
            software_cursor: false,
            retired_cursors: Vec::new(),
            failed: false,
        }
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut Output {
        &mut self.output
    }

    pub fn id(&self) -> OutputId {
        self.output.id()
    }

    pub fn render_loop(&self) -> &RenderLoop {
        &self.render_loop
    }

    pub fn render_loop_mut(&mut self) -> &mut RenderLoop {
        &mut self.render_loop
    }

    pub fn pending(&self) -> &PipelineConfig {
        &self.pending
    }

    pub fn committed(&self) -> &PipelineConfig {
        &self.committed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// A commit failed after a passing test; treat the output as disabled
    /// until the next topology re-scan
    fn mark_failed(&mut self) {
        self.failed = true;
        self.output.set_enabled(false);
    }

    pub fn uses_software_cursor(&self) -> bool {
        self.software_cursor
    }

    /// Whether pending differs from committed in a way that needs a full
    /// modeset rather than a page flip
    pub fn needs_modeset(&self) -> bool {
        self.pending.mode_index != self.committed.mode_index
            || self.pending.transform != self.committed.transform
            || self.pending.active != self.committed.active
    }

    /// Stage a change into the pending configuration. Nothing is validated
    /// or made visible; repeated calls coalesce last-writer-wins.
    pub fn queue_change(&mut self, change: PipelineChange) {
        if let Some(mode_index) = change.mode_index {
            self.pending.mode_index = mode_index;
        }
        if let Some(transform) = change.transform {
            self.pending.transform = transform;
        }
        if let Some(overscan) = change.overscan {
            self.pending.overscan = overscan;
        }
        if let Some(gamma) = change.gamma {
            self.pending.gamma = gamma;
        }
        if let Some(rgb_range) = change.rgb_range {
            self.pending.rgb_range = rgb_range;
        }
        if let Some(vrr) = change.vrr {
            self.pending.vrr = vrr;
        }
        if let Some(active) = change.active {
            self.pending.active = active;
        }
        self.generation += 1;
    }

    fn staged(&self) -> StagedConfig {
        StagedConfig {
            output: self.id(),
            config: self.pending.clone(),
        }
    }

    /// Atomically validate the pending configurations of a set of
    /// pipelines against the hardware, without making anything visible.
    ///
    /// Must cover every pipeline affected by a change that could interact
    /// with shared hardware resources. Passes or fails for the whole set.
    pub fn test_commit(
        device: &mut dyn HardwareDevice,
        pipelines: &[&OutputPipeline],
    ) -> VesperResult<TestedCommit> {
        debug_assert!(!pipelines.is_empty(), "testing an empty pipeline set");
        let batch: Vec<StagedConfig> = pipelines.iter().map(|p| p.staged()).collect();
        match device.test(&batch) {
            Ok(()) => Ok(TestedCommit {
                entries: pipelines.iter().map(|p| (p.id(), p.generation)).collect(),
            }),
            Err(reason) => {
                tracing::debug!("Atomic test failed: {reason}");
                Err(VesperError::Validation(reason))
            }
        }
    }

    /// Copy pending into committed and perform the real hardware commit.
    ///
    /// Precondition: `tested` was returned by a `test_commit` covering this
    /// pipeline's current pending configuration. A commit that still fails
    /// leaves the committed struct untouched and marks the output failed.
    pub fn apply_pending_changes(
        &mut self,
        device: &mut dyn HardwareDevice,
        tested: &TestedCommit,
    ) -> VesperResult<()> {
        debug_assert!(
            tested.covers(self.id(), self.generation),
            "apply_pending_changes without a passing test of the current pending config"
        );
        if let Err(reason) = device.commit(&[self.staged()]) {
            tracing::error!("Hardware commit failed on output {}: {reason}", self.output.name());
            self.mark_failed();
            return Err(VesperError::CommitFailed(self.id(), reason));
        }

        let mode_changed = self.pending.mode_index != self.committed.mode_index;
        self.committed = self.pending.clone();
        self.output.set_current_mode(self.committed.mode_index);
        self.output.set_transform(self.committed.transform);
        if mode_changed {
            let refresh = self.output.refresh_mhz();
            // cadence follows the new mode starting with the next frame
            self.render_loop
                .set_refresh_rate(refresh, &mut NullSink);
        }
        Ok(())
    }

    /// Discard the pending configuration, restoring it to the committed
    /// state; used after a failed test.
    pub fn revert_pending_changes(&mut self) {
        self.pending = self.committed.clone();
        self.generation += 1;
    }

    /// Stage and commit a mode/transform change with safe fallback.
    ///
    /// On a failed test the pipeline falls back to the preferred mode and
    /// identity transform and retests once; only then does it give up.
    pub fn set_mode(
        &mut self,
        device: &mut dyn HardwareDevice,
        mode_index: usize,
        transform: Transform,
    ) -> VesperResult<()> {
        self.queue_change(PipelineChange {
            mode_index: Some(mode_index),
            transform: Some(transform),
            ..Default::default()
        });

        match Self::test_commit(device, &[&*self]) {
            Ok(tested) => return self.apply_pending_changes(device, &tested),
            Err(err) => {
                tracing::warn!(
                    "Output {}: mode {} rejected ({err}), falling back to preferred mode",
                    self.output.name(),
                    mode_index
                );
            }
        }

        // safe fallback: preferred mode, identity transform, one retest
        self.revert_pending_changes();
        self.queue_change(PipelineChange {
            mode_index: Some(self.output.preferred_mode_index()),
            transform: Some(Transform::Normal),
            ..Default::default()
        });
        match Self::test_commit(device, &[&*self]) {
            Ok(tested) => self.apply_pending_changes(device, &tested),
            Err(err) => {
                self.revert_pending_changes();
                Err(err)
            }
        }
    }

    /// Power management. Power-on is immediate and cancels any pending
    /// power-off; power-off is debounced by [`POWER_OFF_DEBOUNCE`] so a
    /// rapid re-wake does not flicker.
    pub fn set_dpms(&mut self, device: &mut dyn HardwareDevice, on: bool, now: Instant) -> VesperResult<()> {
        if on {
            self.power_off_deadline = None;
            if self.committed.active {
                return Ok(());
            }
            self.queue_change(PipelineChange {
                active: Some(true),
                ..Default::default()
            });
            match Self::test_commit(device, &[&*self]) {
                Ok(tested) => self.apply_pending_changes(device, &tested),
                Err(err) => {
                    self.revert_pending_changes();
                    Err(err)
                }
            }
        } else {
            if !self.committed.active {
                return Ok(());
            }
            self.power_off_deadline = Some(now + POWER_OFF_DEBOUNCE);
            Ok(())
        }
    }

    /// Deadline the embedder's event loop should wake at to complete a
    /// debounced power-off
    pub fn power_off_deadline(&self) -> Option<Instant> {
        self.power_off_deadline
    }

    /// Complete a debounced power-off once its deadline has passed.
    /// Returns true when the commit happened.
    pub fn process_power_off(&mut self, device: &mut dyn HardwareDevice, now: Instant) -> VesperResult<bool> {
        let Some(deadline) = self.power_off_deadline else {
            return Ok(false);
        };
        if now < deadline {
            return Ok(false);
        }
        self.power_off_deadline = None;
        self.queue_change(PipelineChange {
            active: Some(false),
            ..Default::default()
        });
        match Self::test_commit(device, &[&*self]) {
            Ok(tested) => {
                self.apply_pending_changes(device, &tested)?;
                Ok(true)
            }
            Err(err) => {
                self.revert_pending_changes();
                Err(err)
            }
        }
    }

    /// Replace the cursor sprite. Attempts the lightweight plane path
    /// first; an incompatible sprite falls back to software compositing.
    pub fn set_cursor(&mut self, device: &mut dyn HardwareDevice, buffer: Option<GpuBuffer>) {
        let position = self.pending.cursor.position;
        let fits = buffer.as_ref().map_or(true, |b| {
            let max = device.cursor_constraints().max_size;
            b.size().w <= max.w && b.size().h <= max.h
        });
        let on_plane = fits && device.set_cursor_plane(self.id(), buffer.as_ref(), position);
        if !on_plane && buffer.is_some() {
            tracing::debug!(
                "Output {}: cursor sprite incompatible with plane, using software cursor",
                self.output.name()
            );
        }
        self.software_cursor = !on_plane && buffer.is_some();
        let old = std::mem::replace(&mut self.pending.cursor.buffer, buffer.clone());
        self.committed.cursor.buffer = buffer;
        if let Some(old) = old {
            // the plane may keep scanning out the old sprite until the next
            // flip; hold it until the device releases it
            let fence = device.cursor_release_fence(self.id());
            self.retired_cursors.push(InFlightBuffer::new(old, fence));
        }
    }

    /// Hand back every retired cursor sprite the hardware has released;
    /// sprites still in flight stay held.
    pub fn reclaim_cursor_buffers(&mut self) -> Vec<GpuBuffer> {
        let mut released = Vec::new();
        let mut still_held = Vec::new();
        for in_flight in std::mem::take(&mut self.retired_cursors) {
            match in_flight.reclaim() {
                Ok(buffer) => released.push(buffer),
                Err(in_flight) => still_held.push(in_flight),
            }
        }
        self.retired_cursors = still_held;
        released
    }

    /// Move the cursor; a plane update when possible, otherwise the caller
    /// must damage the cursor area for software compositing.
    pub fn move_cursor(&mut self, device: &mut dyn HardwareDevice, position: Point) {
        self.pending.cursor.position = position;
        self.committed.cursor.position = position;
        if self.software_cursor {
            return;
        }
        if !device.set_cursor_plane(self.id(), self.committed.cursor.buffer.as_ref(), position) {
            self.software_cursor = true;
        }
    }
}

/// Sink for loop notifications triggered from inside the pipeline, where
/// nothing can be scheduled anyway (the refresh-rate change is picked up
/// by the orchestrator on the next cycle)
struct NullSink;

impl crate::render_loop::FrameSink for NullSink {
    fn frame_requested(&mut self, _output: OutputId) {}
}
