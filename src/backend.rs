//! Hardware/backend abstraction
//!
//! The core never talks to real hardware directly. Everything it needs
//! from a device is behind [`HardwareDevice`]: stage a batch of output
//! configurations, test them atomically, commit a previously tested batch,
//! and answer cursor-plane constraints. Backends are distinguished by a
//! capability-tagged [`BackendKind`] rather than an inheritance tree.
//!
//! GPU buffers handed to the hardware for scanout must not be reused or
//! freed until the corresponding release fence has signaled; the
//! [`InFlightBuffer`] type makes that rule an ownership fact instead of a
//! convention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::geometry::{Point, Size};
use crate::output::OutputId;
use crate::pipeline::PipelineConfig;

/// The kind of compositing backend driving a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// DRM/KMS atomic modesetting
    Drm,
    /// Headless/virtual outputs
    Virtual,
    /// Software compositing into a dumb buffer
    Software,
    /// No compositing at all; only acceptable where the platform allows it
    NoCompositing,
}

impl BackendKind {
    /// Fallback priority used when the preferred backend fails to
    /// initialize, best first
    pub fn fallback_priority() -> &'static [BackendKind] {
        &[
            BackendKind::Drm,
            BackendKind::Software,
            BackendKind::Virtual,
        ]
    }
}

/// One output configuration staged for an atomic test or commit
#[derive(Debug, Clone)]
pub struct StagedConfig {
    pub output: OutputId,
    pub config: PipelineConfig,
}

/// Size and format limits of the hardware cursor plane
#[derive(Debug, Clone, Copy)]
pub struct CursorConstraints {
    pub max_size: Size,
}

/// Contract between the core and a display device
///
/// `test` validates a whole batch atomically without making it visible;
/// `commit` applies a batch that was previously validated. Partial
/// application across outputs is the device's job to reject: a batch
/// passes or fails as a unit.
pub trait HardwareDevice {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Atomically validate a batch of staged configurations. Returns a
    /// human-readable reason on rejection; the device state is untouched
    /// either way.
    fn test(&mut self, batch: &[StagedConfig]) -> Result<(), String>;

    /// Apply a previously tested batch. A failure here is fatal for the
    /// affected outputs, not for the process.
    fn commit(&mut self, batch: &[StagedConfig]) -> Result<(), String>;

    /// Fast-path cursor plane update; returns false when the sprite is
    /// incompatible with the plane and the caller must composite the
    /// cursor in software
    fn set_cursor_plane(&mut self, output: OutputId, buffer: Option<&GpuBuffer>, position: Point) -> bool;

    fn cursor_constraints(&self) -> CursorConstraints;

    /// Fence released once the hardware stops scanning out the sprite most
    /// recently handed to `output`'s cursor plane. The default fence is
    /// pre-signaled, for backends that copy the sprite at submission; a
    /// page-flipping backend ties it to the flip that displaces the sprite.
    fn cursor_release_fence(&mut self, _output: OutputId) -> ReleaseFence {
        let fence = ReleaseFence::new();
        fence.signal();
        fence
    }

    /// Current monotonic presentation timestamp of the device clock
    fn presentation_timestamp(&self) -> Instant;
}

/// A GPU buffer usable for scanout or composition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuBuffer {
    id: u64,
    size: Size,
    has_alpha: bool,
}

impl GpuBuffer {
    pub fn new(id: u64, size: Size, has_alpha: bool) -> Self {
        Self { id, size, has_alpha }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }
}

/// Signals that the hardware has released a scanned-out buffer
///
/// Cloneable: the backend holds one end and signals it from its page-flip
/// handling; the [`InFlightBuffer`] holds the other.
#[derive(Debug, Clone, Default)]
pub struct ReleaseFence {
    signaled: Arc<AtomicBool>,
}

impl ReleaseFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

/// A buffer the hardware may still be scanning out
///
/// The wrapped buffer is inaccessible until the release fence signals;
/// `reclaim` is the only way to get it back. Dropping an `InFlightBuffer`
/// before its fence signals is a leak of the buffer, never a corruption.
#[derive(Debug)]
pub struct InFlightBuffer {
    buffer: GpuBuffer,
    fence: ReleaseFence,
}

impl InFlightBuffer {
    pub fn new(buffer: GpuBuffer, fence: ReleaseFence) -> Self {
        Self { buffer, fence }
    }

    /// The buffer comes back only once the hardware released it
    pub fn reclaim(self) -> Result<GpuBuffer, InFlightBuffer> {
        if self.fence.is_signaled() {
            Ok(self.buffer)
        } else {
            Err(self)
        }
    }

    pub fn is_released(&self) -> bool {
        self.fence.is_signaled()
    }
}
