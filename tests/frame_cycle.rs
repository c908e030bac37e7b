//! End-to-end frame cycle: schedule, compose, present, repeat.

mod common;

use std::time::{Duration, Instant};

use common::{test_output, RecordingRenderer, TestDevice, TestWindow};
use vesper::event::CompositorEvent;
use vesper::geometry::{Point, Rect};
use vesper::Compositor;
use vesper::Region;

fn started() -> Compositor {
    let (device, _log) = TestDevice::new();
    let mut compositor = Compositor::new();
    compositor
        .start(vec![Box::new(device)], None, Instant::now())
        .expect("virtual backend accepted");
    compositor
}

#[test]
fn second_frame_repaints_only_the_damaged_window() {
    let mut compositor = started();
    let now = Instant::now();
    let id = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);

    let window = TestWindow::new(Rect::from_coords(100, 100, 800, 600));
    compositor.scene_mut().add_item(window.handle());
    compositor.events_mut().drain();

    // first frame: primed with full damage
    let mut renderer = RecordingRenderer::default();
    let plan = compositor
        .handle_frame_requested(id, &mut renderer, now)
        .unwrap()
        .expect("frame composed");
    assert_eq!(
        plan.damage,
        Region::from_rect(Rect::from_coords(0, 0, 1920, 1080)),
        "first frame covers the whole output"
    );
    assert!(!plan.background.is_empty(), "background shows around the window");
    compositor.notify_presented(id, now + Duration::from_millis(16));
    assert_eq!(window.frames_rendered.get(), 1);

    // the window redraws itself
    window.damage_all();
    compositor.add_repaint(&Region::from_rect(window.rect.get()), now);
    let requested = compositor
        .events_mut()
        .drain()
        .into_iter()
        .any(|e| matches!(e, CompositorEvent::FrameRequested { output } if output == id));
    assert!(requested);

    let mut renderer = RecordingRenderer::default();
    let plan = compositor
        .handle_frame_requested(id, &mut renderer, now)
        .unwrap()
        .expect("frame composed");
    assert_eq!(
        plan.damage,
        Region::from_rect(Rect::from_coords(100, 100, 800, 600)),
        "second frame repaints only the window"
    );
    assert_eq!(plan.painted.len(), 1);
    assert!(
        plan.background.is_empty(),
        "damage lies entirely under the opaque window"
    );
}

#[test]
fn fullscreen_vrr_content_switches_timing() {
    let mut compositor = started();
    let now = Instant::now();
    let id = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);

    let game = TestWindow::new(Rect::from_coords(0, 0, 1920, 1080));
    game.vrr.set(true);
    compositor.scene_mut().add_item(game.handle());
    compositor.events_mut().drain();

    let mut renderer = RecordingRenderer::default();
    compositor
        .handle_frame_requested(id, &mut renderer, now)
        .unwrap()
        .expect("frame composed");

    let pipeline = compositor.fleet().get(id).unwrap();
    assert!(
        pipeline.render_loop().uses_variable_timing(),
        "fullscreen VRR content flips the loop to variable timing"
    );

    // a windowed surface does not
    game.rect.set(Rect::from_coords(10, 10, 800, 600));
    compositor.notify_presented(id, now);
    compositor.add_repaint(&Region::from_rect(Rect::from_coords(0, 0, 1920, 1080)), now);
    compositor.events_mut().drain();
    let mut renderer = RecordingRenderer::default();
    compositor
        .handle_frame_requested(id, &mut renderer, now)
        .unwrap()
        .expect("frame composed");
    let pipeline = compositor.fleet().get(id).unwrap();
    assert!(!pipeline.render_loop().uses_variable_timing());
}

#[test]
fn failed_presentation_retries_instead_of_stalling() {
    let mut compositor = started();
    let now = Instant::now();
    let id = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);
    compositor.events_mut().drain();

    let mut renderer = RecordingRenderer::default();
    compositor
        .handle_frame_requested(id, &mut renderer, now)
        .unwrap()
        .expect("frame composed");

    compositor.notify_frame_failed(id, now);
    let events = compositor.events_mut().drain();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, CompositorEvent::FrameRequested { output } if *output == id)),
        "a failed frame immediately requests the next one"
    );
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, CompositorEvent::FramePresented { .. })),
        "no presentation is reported for a failed frame"
    );

    // the retry frame composes normally
    let mut renderer = RecordingRenderer::default();
    let plan = compositor
        .handle_frame_requested(id, &mut renderer, now)
        .unwrap()
        .expect("retry composes");
    assert!(!plan.damage.is_empty(), "retry repaints the failed content");
}

#[test]
fn interleaved_outputs_keep_separate_frames() {
    let mut compositor = started();
    let now = Instant::now();
    let left = compositor.add_output(test_output(1, "DP-1", Point::new(0, 0)), now);
    let right = compositor.add_output(test_output(2, "DP-2", Point::new(1920, 0)), now);

    let window = TestWindow::new(Rect::from_coords(1800, 100, 240, 200));
    compositor.scene_mut().add_item(window.handle());
    compositor.events_mut().drain();

    // compose for both outputs, interleaved, before either presents
    let mut renderer = RecordingRenderer::default();
    let left_plan = compositor
        .handle_frame_requested(left, &mut renderer, now)
        .unwrap()
        .expect("left composes");
    let right_plan = compositor
        .handle_frame_requested(right, &mut renderer, now)
        .unwrap()
        .expect("right composes");

    // the straddling window is painted on both, each in local coordinates
    assert_eq!(left_plan.painted.len(), 1);
    assert_eq!(right_plan.painted.len(), 1);
    assert_eq!(
        left_plan.painted[0],
        Region::from_rect(Rect::from_coords(1800, 100, 120, 200))
    );
    assert_eq!(
        right_plan.painted[0],
        Region::from_rect(Rect::from_coords(0, 100, 120, 200))
    );

    compositor.notify_presented(left, now);
    compositor.notify_presented(right, now);
    assert_eq!(
        window.frames_rendered.get(),
        2,
        "the window was consumed once per output"
    );
}
