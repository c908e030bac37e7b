//! vesper - display compositing core
//!
//! vesper is the rendering heart of a display server: it decides *when*
//! each output draws (per-output render loops with latency and VRR
//! policies), *what* it draws (a damage-tracked scene with occlusion
//! culling and direct-scanout detection), and *how* configuration reaches
//! the hardware (atomic test-then-commit output pipelines).
//!
//! The core owns no event loop, no window management and no protocol
//! surface. An embedder feeds it outputs, scene items and timestamps,
//! drains [`CompositorEvent`](event::CompositorEvent)s, and submits the
//! returned paint plans to its renderer.
//!
//! # Architecture
//!
//! - [`compositor`]: lifecycle orchestration and the per-frame cycle
//! - [`scene`]: stacking order, damage tracking, occlusion, scanout
//! - [`render_loop`]: per-output frame scheduling and pacing
//! - [`pipeline`]: test-then-commit hardware state machine per output
//! - [`layout`]: persisted output arrangements
//! - [`backend`]: the hardware abstraction the pipelines drive

#![warn(rust_2018_idioms)]

pub mod backend;
pub mod compositor;
pub mod error;
pub mod event;
pub mod geometry;
pub mod layout;
pub mod output;
pub mod pipeline;
pub mod region;
pub mod render_loop;
pub mod scene;

pub use compositor::{Compositor, CompositorState, SuspendReason};
pub use error::{VesperError, VesperResult};
pub use region::Region;
pub use scene::Scene;
