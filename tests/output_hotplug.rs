//! Output hotplug, placeholder provisioning and layout persistence.

mod common;

use std::time::Instant;

use common::{test_output, TestDevice};
use vesper::event::CompositorEvent;
use vesper::geometry::Point;
use vesper::layout::{setup_key, LayoutRecord, LayoutStore};
use vesper::Compositor;

#[test]
fn fleet_never_ends_up_empty() {
    let (device, log) = TestDevice::new();
    let mut compositor = Compositor::new();
    let now = Instant::now();
    compositor.start(vec![Box::new(device)], None, now).unwrap();

    let a = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);
    let b = compositor.add_output(test_output(2, "DP-2", Point::new(1920, 0)), now);

    compositor.disable_output(a).unwrap();
    assert!(
        compositor.fleet().enabled_outputs().all(|o| !o.is_placeholder()),
        "a real output remains, no placeholder needed"
    );

    compositor.disable_output(b).unwrap();
    let enabled: Vec<_> = compositor.fleet().enabled_outputs().collect();
    assert_eq!(enabled.len(), 1);
    assert!(enabled[0].is_placeholder(), "last disable provisions a placeholder");
    assert!(log.borrow().commits >= 2, "both disables went through the hardware");

    // a real output returning retires the placeholder
    compositor.enable_output(a, now).unwrap();
    assert!(compositor.fleet().enabled_outputs().all(|o| !o.is_placeholder()));
}

#[test]
fn sudden_removal_skips_hardware_validation() {
    let (device, log) = TestDevice::new();
    let mut compositor = Compositor::new();
    let now = Instant::now();
    compositor.start(vec![Box::new(device)], None, now).unwrap();
    let id = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);

    // the cable is gone; any test against the device would fail
    log.borrow_mut().reject_tests = u32::MAX;
    compositor.remove_output(id);

    let events = compositor.events_mut().drain();
    assert!(events.contains(&CompositorEvent::OutputRemoved { output: id }));
    assert!(
        compositor.fleet().enabled_outputs().any(|o| o.is_placeholder()),
        "removal still upholds the non-empty invariant"
    );
}

#[test]
fn replugged_setup_restores_remembered_positions() {
    let now = Instant::now();
    let (device, _log) = TestDevice::new();
    let mut compositor = Compositor::new();
    compositor.start(vec![Box::new(device)], None, now).unwrap();

    let a = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);
    let b = compositor.add_output(test_output(2, "DP-2", Point::new(1920, 0)), now);

    // user puts DP-2 to the left of DP-1
    compositor
        .fleet_mut()
        .get_mut(b)
        .unwrap()
        .output_mut()
        .set_position(Point::new(-1920, 0));

    let mut store = LayoutStore::new();
    let key = setup_key(compositor.fleet().enabled_outputs().map(|o| o.identity()));
    let record = LayoutRecord::capture(compositor.fleet().enabled_outputs(), Some("edid-DP-1"));
    store.remember(key.clone(), record).unwrap();

    // simulate a replug: fresh compositor, same monitors, default positions
    let (device, _log) = TestDevice::new();
    let mut compositor = Compositor::new();
    compositor.start(vec![Box::new(device)], None, now).unwrap();
    let a2 = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);
    let b2 = compositor.add_output(test_output(2, "DP-2", Point::new(0, 0)), now);

    let key2 = setup_key(compositor.fleet().enabled_outputs().map(|o| o.identity()));
    assert_eq!(key, key2, "the same monitor combination resolves to the same record");

    let record = store.lookup(&key2).expect("layout remembered");
    let mut outputs = compositor.fleet_mut().outputs_mut();
    vesper::layout::apply_layout(record, &mut outputs).unwrap();
    drop(outputs);

    let left = compositor.fleet().get(b2).unwrap().output();
    let right = compositor.fleet().get(a2).unwrap().output();
    assert_eq!(left.position(), Point::new(-1920, 0));
    assert_eq!(right.position(), Point::new(0, 0));
}
