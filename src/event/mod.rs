//! Compositor event bus
//!
//! Decouples the core from its embedder: the compositor pushes domain
//! events onto the bus, and the embedder drains them from its own loop.
//! Unlike the [`FrameSink`](crate::render_loop::FrameSink) fast path,
//! which is delivered synchronously during scheduling, the bus is for
//! everything that can tolerate a loop iteration of latency.

use std::collections::VecDeque;
use std::time::Instant;

use crate::output::OutputId;

/// Events the compositor core emits toward its embedder
#[derive(Debug, Clone, PartialEq)]
pub enum CompositorEvent {
    /// An output wants a frame composed
    FrameRequested { output: OutputId },
    /// A frame reached the screen
    FramePresented { output: OutputId, timestamp: Instant },
    /// An output's refresh rate changed
    RefreshRateChanged { output: OutputId, refresh_mhz: u32 },
    /// An output joined the fleet
    OutputAdded { output: OutputId },
    /// An output left the fleet
    OutputRemoved { output: OutputId },
    /// Compositing started or stopped. Stopping clears the scene's item
    /// list; on `active: true` the embedder must re-add its items before
    /// the next frames compose them.
    CompositingToggled { active: bool },
}

/// Handler for compositor events
pub trait EventHandler {
    fn handle_event(&mut self, event: &CompositorEvent);
}

/// FIFO event queue with optional synchronous handlers
#[derive(Default)]
pub struct EventBus {
    queue: VecDeque<CompositorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: CompositorEvent) {
        tracing::trace!("Event: {event:?}");
        self.queue.push_back(event);
    }

    pub fn poll(&mut self) -> Option<CompositorEvent> {
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> Vec<CompositorEvent> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Deliver all queued events to `handler`, in order
    pub fn dispatch(&mut self, handler: &mut dyn EventHandler) {
        while let Some(event) = self.queue.pop_front() {
            handler.handle_event(&event);
        }
    }
}
