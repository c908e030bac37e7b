//! Shared helpers for integration tests: a scriptable hardware device, a
//! scene item backed by plain cells, and a renderer that records what it
//! was asked to paint.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use vesper::backend::{BackendKind, CursorConstraints, GpuBuffer, HardwareDevice, StagedConfig};
use vesper::geometry::{Point, Rect, Size};
use vesper::output::{Mode, Output, OutputCapabilities, OutputId};
use vesper::scene::{ItemHandle, ItemRenderer, SceneItem};
use vesper::Region;

/// What the test device saw, shared between the test body and the device
/// the compositor owns
#[derive(Default)]
pub struct DeviceLog {
    pub tests: u32,
    pub commits: u32,
    /// Reject this many atomic tests before accepting again
    pub reject_tests: u32,
    /// Make commits fail outright
    pub wedge_commits: bool,
    /// Mode indices the device refuses
    pub rejected_modes: Vec<usize>,
}

pub struct TestDevice {
    pub log: Rc<RefCell<DeviceLog>>,
}

impl TestDevice {
    pub fn new() -> (Self, Rc<RefCell<DeviceLog>>) {
        init_tracing();
        let log = Rc::new(RefCell::new(DeviceLog::default()));
        (Self { log: log.clone() }, log)
    }
}

/// Honor RUST_LOG in test runs; safe to call from every test
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl HardwareDevice for TestDevice {
    fn name(&self) -> &str {
        "test-device"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Virtual
    }

    fn test(&mut self, batch: &[StagedConfig]) -> Result<(), String> {
        let mut log = self.log.borrow_mut();
        log.tests += 1;
        if log.reject_tests > 0 {
            log.reject_tests -= 1;
            return Err("test rejected by harness".into());
        }
        for staged in batch {
            if log.rejected_modes.contains(&staged.config.mode_index) {
                return Err(format!("mode {} unsupported", staged.config.mode_index));
            }
        }
        Ok(())
    }

    fn commit(&mut self, _batch: &[StagedConfig]) -> Result<(), String> {
        let mut log = self.log.borrow_mut();
        if log.wedge_commits {
            return Err("device wedged".into());
        }
        log.commits += 1;
        Ok(())
    }

    fn set_cursor_plane(
        &mut self,
        _output: OutputId,
        _buffer: Option<&GpuBuffer>,
        _position: Point,
    ) -> bool {
        true
    }

    fn cursor_constraints(&self) -> CursorConstraints {
        CursorConstraints {
            max_size: Size::new(256, 256),
        }
    }

    fn presentation_timestamp(&self) -> Instant {
        Instant::now()
    }
}

/// A scene item whose behavior the test scripts directly
pub struct TestWindow {
    pub rect: Cell<Rect>,
    pub damage: RefCell<Region>,
    pub opaque: Cell<bool>,
    pub opacity: Cell<f64>,
    pub ready: Cell<bool>,
    pub vrr: Cell<bool>,
    pub lock_surface: Cell<bool>,
    pub frames_rendered: Cell<u32>,
}

impl TestWindow {
    pub fn new(rect: Rect) -> Rc<Self> {
        Rc::new(Self {
            rect: Cell::new(rect),
            damage: RefCell::new(Region::from_rect(rect)),
            opaque: Cell::new(true),
            opacity: Cell::new(1.0),
            ready: Cell::new(true),
            vrr: Cell::new(false),
            lock_surface: Cell::new(false),
            frames_rendered: Cell::new(0),
        })
    }

    pub fn damage_all(&self) {
        self.damage.borrow_mut().add_rect(self.rect.get());
    }

    pub fn handle(self: &Rc<Self>) -> ItemHandle {
        self.clone()
    }
}

impl SceneItem for TestWindow {
    fn bounding_rect(&self) -> Rect {
        self.rect.get()
    }

    fn opaque_region(&self) -> Region {
        if self.opaque.get() && self.opacity.get() >= 1.0 {
            Region::from_rect(self.rect.get())
        } else {
            Region::new()
        }
    }

    fn take_damage(&self) -> Region {
        std::mem::take(&mut *self.damage.borrow_mut())
    }

    fn is_ready(&self) -> bool {
        self.ready.get()
    }

    fn is_on_output(&self, output: &Output) -> bool {
        self.rect.get().overlaps(&output.geometry())
    }

    fn opacity(&self) -> f64 {
        self.opacity.get()
    }

    fn buffer_is_opaque(&self) -> bool {
        self.opaque.get()
    }

    fn wants_vrr(&self) -> bool {
        self.vrr.get()
    }

    fn is_lock_surface(&self) -> bool {
        self.lock_surface.get()
    }

    fn frame_rendered(&self, _timestamp: Instant) {
        self.frames_rendered.set(self.frames_rendered.get() + 1);
    }
}

/// Records every paint call of one pass
#[derive(Default)]
pub struct RecordingRenderer {
    pub background: Vec<Region>,
    pub items: Vec<Region>,
}

impl ItemRenderer for RecordingRenderer {
    fn render_background(&mut self, region: &Region) {
        self.background.push(region.clone());
    }

    fn render_item(&mut self, _item: &ItemHandle, region: &Region) {
        self.items.push(region.clone());
    }
}

pub fn test_output(id: u32, name: &str, position: Point) -> Output {
    let mut output = Output::new(
        OutputId::from_raw(id).expect("non-zero id"),
        name,
        format!("edid-{name}"),
        vec![
            Mode::new(Size::new(1920, 1080), 60_000, true),
            Mode::new(Size::new(2560, 1440), 144_000, false),
        ],
        OutputCapabilities::DPMS | OutputCapabilities::VRR,
    );
    output.set_position(position);
    output
}
