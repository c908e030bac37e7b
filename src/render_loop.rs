//! Per-output frame scheduling
//!
//! A [`RenderLoop`] drives the frame cadence for one output. It decides
//! when the orchestrator should be asked to compose a frame, paces those
//! requests to the output's refresh rate (or to the presentation cadence
//! of a directly scanned-out fullscreen surface), and records presentation
//! feedback coming back from the hardware.
//!
//! Notifications are delivered through the [`FrameSink`] trait passed into
//! every operation that can fire one; the loop never stores a reference to
//! its listener.

use std::time::{Duration, Instant};

use crate::output::OutputId;

/// Variable-refresh-rate policy for one output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum VrrPolicy {
    /// Always pace to the fixed refresh interval
    Never,
    /// Present as soon as a frame is ready
    Always,
    /// Fixed pacing unless the fullscreen surface opts into variable timing
    #[default]
    Automatic,
}

/// How aggressively frames are scheduled relative to the vblank deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyPolicy {
    ForceLowest,
    Low,
    #[default]
    Medium,
    High,
    ForceHighest,
}

impl LatencyPolicy {
    /// Scheduling headroom as a fraction of the refresh interval
    fn headroom_factor(&self) -> f64 {
        match self {
            LatencyPolicy::ForceLowest => 0.1,
            LatencyPolicy::Low => 0.25,
            LatencyPolicy::Medium => 0.5,
            LatencyPolicy::High => 0.75,
            LatencyPolicy::ForceHighest => 1.0,
        }
    }
}

/// Presentation cadence of a fullscreen surface being scanned out directly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullscreenSurface {
    /// The surface's own presentation rate in millihertz
    pub refresh_mhz: u32,
    /// Whether the content opted into variable timing (e.g. a game)
    pub wants_vrr: bool,
}

/// Frame progress for one render loop
///
/// `schedule_repaint` moves Idle to FrameRequested, the orchestrator's
/// `begin_frame` moves FrameRequested to FramePending, and completion or
/// failure feedback moves FramePending back to Idle or FrameRequested
/// (retry) respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Idle,
    FrameRequested,
    FramePending,
}

/// Listener for render loop notifications
///
/// One emitter, many possible listeners; the loop knows nothing about the
/// listener's type.
pub trait FrameSink {
    /// The loop wants a frame composed for this output
    fn frame_requested(&mut self, output: OutputId);

    /// A frame reached the screen at `timestamp`
    fn frame_presented(&mut self, _output: OutputId, _timestamp: Instant) {}

    /// The output's refresh rate changed
    fn refresh_rate_changed(&mut self, _output: OutputId, _refresh_mhz: u32) {}
}

/// Per-output frame scheduler
#[derive(Debug)]
pub struct RenderLoop {
    output: OutputId,
    refresh_mhz: u32,
    inhibit_count: u32,
    state: FrameState,
    /// A repaint was requested but could not be served yet (inhibited or a
    /// frame is still in flight); must be honored by the next cycle
    pending_repaint: bool,
    /// begin_frame/end_frame bracket; at most one composition pass at a time
    composing: bool,
    last_presentation: Option<Instant>,
    next_presentation: Option<Instant>,
    /// Extra time budgeted for the hardware commit itself
    safety_margin: Duration,
    latency_policy: LatencyPolicy,
    vrr_policy: VrrPolicy,
    fullscreen_surface: Option<FullscreenSurface>,
}

impl RenderLoop {
    pub fn new(output: OutputId, refresh_mhz: u32) -> Self {
        Self {
            output,
            refresh_mhz: refresh_mhz.max(1),
            inhibit_count: 0,
            state: FrameState::Idle,
            pending_repaint: false,
            composing: false,
            last_presentation: None,
            next_presentation: None,
            safety_margin: Duration::ZERO,
            latency_policy: LatencyPolicy::default(),
            vrr_policy: VrrPolicy::default(),
            fullscreen_surface: None,
        }
    }

    pub fn output(&self) -> OutputId {
        self.output
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn refresh_mhz(&self) -> u32 {
        self.refresh_mhz
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibit_count > 0
    }

    pub fn vrr_policy(&self) -> VrrPolicy {
        self.vrr_policy
    }

    pub fn set_vrr_policy(&mut self, policy: VrrPolicy) {
        self.vrr_policy = policy;
    }

    pub fn set_latency_policy(&mut self, policy: LatencyPolicy) {
        self.latency_policy = policy;
    }

    pub fn set_safety_margin(&mut self, margin: Duration) {
        self.safety_margin = margin;
    }

    pub fn last_presentation_timestamp(&self) -> Option<Instant> {
        self.last_presentation
    }

    pub fn next_presentation_timestamp(&self) -> Option<Instant> {
        self.next_presentation
    }

    /// Pause compositing for this output. While the inhibition ref-count is
    /// above zero, repaint requests are recorded but no frame is requested.
    pub fn inhibit(&mut self) {
        self.inhibit_count += 1;
        tracing::trace!("RenderLoop {}: inhibited ({})", self.output, self.inhibit_count);
    }

    /// Drop one inhibition. On the transition to zero, a repaint recorded
    /// while inhibited fires immediately.
    pub fn uninhibit(&mut self, now: Instant, sink: &mut dyn FrameSink) {
        if self.inhibit_count == 0 {
            tracing::warn!("RenderLoop {}: uninhibit without matching inhibit", self.output);
            return;
        }
        self.inhibit_count -= 1;
        if self.inhibit_count == 0 && self.pending_repaint && self.state == FrameState::Idle {
            // a frame already requested or in flight serves the repaint on
            // its own completion; only an idle loop needs a kick
            self.request_frame(now, sink);
        }
    }

    /// Update the refresh rate in millihertz. Does not retroactively alter
    /// an in-flight frame.
    pub fn set_refresh_rate(&mut self, refresh_mhz: u32, sink: &mut dyn FrameSink) {
        let refresh_mhz = refresh_mhz.max(1);
        if self.refresh_mhz == refresh_mhz {
            return;
        }
        self.refresh_mhz = refresh_mhz;
        sink.refresh_rate_changed(self.output, refresh_mhz);
    }

    /// A fullscreen surface is (or stops being) scanned out directly; the
    /// loop aligns its timing to the surface's own cadence so fullscreen
    /// content avoids double latency.
    pub fn set_fullscreen_surface(&mut self, surface: Option<FullscreenSurface>) {
        self.fullscreen_surface = surface;
    }

    /// Whether the next frame presents with variable timing
    ///
    /// A pure function of the policy and the fullscreen surface, evaluated
    /// at every frame-request decision.
    pub fn uses_variable_timing(&self) -> bool {
        match self.vrr_policy {
            VrrPolicy::Never => false,
            VrrPolicy::Always => true,
            VrrPolicy::Automatic => self.fullscreen_surface.is_some_and(|s| s.wants_vrr),
        }
    }

    /// Mark a repaint pending and, when the loop is idle and uninhibited,
    /// ask the sink to compose a frame.
    pub fn schedule_repaint(&mut self, now: Instant, sink: &mut dyn FrameSink) {
        self.pending_repaint = true;
        if self.is_inhibited() || self.state != FrameState::Idle {
            // remembered; served on uninhibit or by the next cycle
            return;
        }
        self.request_frame(now, sink);
    }

    /// Drop a frame request that will not be served (compositing off, the
    /// output disabled). The repaint stays pending, so the next scheduling
    /// event re-fires it instead of leaving the loop stuck waiting for a
    /// `begin_frame` that never comes.
    pub fn cancel_frame_request(&mut self) {
        if self.state == FrameState::FrameRequested {
            self.state = FrameState::Idle;
            self.pending_repaint = true;
        }
    }

    fn request_frame(&mut self, now: Instant, sink: &mut dyn FrameSink) {
        self.state = FrameState::FrameRequested;
        self.next_presentation = Some(self.compute_next_presentation(now));
        sink.frame_requested(self.output);
    }

    /// Bracket start of one composition pass. At most one frame may be in
    /// flight per loop; a second `begin_frame` without an intervening
    /// `end_frame` is a programming error.
    pub fn begin_frame(&mut self) {
        assert!(!self.composing, "RenderLoop {}: frame already in flight", self.output);
        assert!(
            self.state == FrameState::FrameRequested,
            "RenderLoop {}: begin_frame without a requested frame",
            self.output
        );
        self.composing = true;
        self.state = FrameState::FramePending;
        self.pending_repaint = false;
    }

    /// Bracket end of one composition pass. Presentation feedback arrives
    /// separately through `notify_frame_completed`/`notify_frame_failed`.
    pub fn end_frame(&mut self) {
        assert!(self.composing, "RenderLoop {}: end_frame without begin_frame", self.output);
        self.composing = false;
    }

    /// The frame reached the screen; advances both presentation timestamps
    /// and emits `frame_presented`. A repaint requested while the frame was
    /// in flight is served now.
    pub fn notify_frame_completed(&mut self, timestamp: Instant, sink: &mut dyn FrameSink) {
        if self.state != FrameState::FramePending {
            tracing::debug!(
                "RenderLoop {}: spurious completion in state {:?}",
                self.output,
                self.state
            );
            return;
        }
        if let Some(last) = self.last_presentation {
            if timestamp < last {
                tracing::debug!("RenderLoop {}: presentation timestamp went backwards", self.output);
            }
        }
        self.last_presentation = Some(timestamp);
        // nextPresentationTimestamp >= lastPresentationTimestamp
        if self.next_presentation.is_none_or(|next| next < timestamp) {
            self.next_presentation = Some(timestamp);
        }
        self.state = FrameState::Idle;
        sink.frame_presented(self.output, timestamp);
        if self.pending_repaint && !self.is_inhibited() {
            self.request_frame(timestamp, sink);
        }
    }

    /// The frame failed to present. The last presentation timestamp does
    /// not advance, and the loop re-requests a frame so it never stalls.
    pub fn notify_frame_failed(&mut self, now: Instant, sink: &mut dyn FrameSink) {
        if self.state != FrameState::FramePending {
            tracing::debug!("RenderLoop {}: spurious failure in state {:?}", self.output, self.state);
            return;
        }
        tracing::warn!("RenderLoop {}: frame failed to present, retrying", self.output);
        self.pending_repaint = true;
        self.state = FrameState::FrameRequested;
        if !self.is_inhibited() {
            self.next_presentation = Some(self.compute_next_presentation(now));
            sink.frame_requested(self.output);
        }
    }

    /// Expected presentation time for the frame being scheduled
    fn compute_next_presentation(&self, now: Instant) -> Instant {
        let interval = self.pacing_interval();
        if self.uses_variable_timing() {
            // present as soon as the frame is ready, budgeting only for the
            // commit itself
            return now + self.safety_margin;
        }
        let headroom = interval.mul_f64(self.latency_policy.headroom_factor()) + self.safety_margin;
        let earliest = now + headroom;
        match self.last_presentation {
            Some(last) if last <= earliest => {
                // round up to the next vblank after the earliest possible
                // presentation
                let elapsed = earliest.duration_since(last);
                let intervals = elapsed.as_nanos() / interval.as_nanos().max(1) + 1;
                last + interval * intervals as u32
            }
            _ => earliest + interval,
        }
    }

    /// Fixed pacing interval: the fullscreen surface's cadence when one is
    /// scanned out directly, the output's refresh interval otherwise.
    fn pacing_interval(&self) -> Duration {
        let mhz = match self.fullscreen_surface {
            Some(surface) if surface.refresh_mhz > 0 => surface.refresh_mhz,
            _ => self.refresh_mhz,
        };
        Duration::from_nanos(1_000_000_000_000 / mhz as u64)
    }
}
