mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use camslot::{
    CaptureChannel, CaptureWorker, DeviceId, ErrorKind, Event, EventBus, FrameSink, SlotIndex,
    SlotSettings, TimingConfig, WorkerState,
};

use common::{
    bus_and_sink, collect_until, gated_channel, wait_until, RecordingStore, ScriptedChannel, Step,
};

fn no_backoff() -> TimingConfig {
    TimingConfig {
        retry_backoff: Duration::ZERO,
        failure_window_secs: 2.0,
    }
}

fn worker(
    channel: impl CaptureChannel + 'static,
    settings: Arc<SlotSettings>,
    bus: Arc<EventBus>,
    sink: Arc<FrameSink>,
) -> CaptureWorker {
    CaptureWorker::new(
        SlotIndex(0),
        DeviceId::new("phone-a"),
        Box::new(channel),
        settings,
        no_backoff(),
        bus,
        sink,
    )
}

fn settings(fps: f64) -> Arc<SlotSettings> {
    let settings = SlotSettings::default();
    settings.set_desired_fps(fps);
    Arc::new(settings)
}

fn is_error(event: &Event) -> bool {
    matches!(event, Event::CaptureError { .. })
}

#[test]
fn transient_failures_are_silent_then_fault_is_reported_once() {
    let (bus, sink) = bus_and_sink(None);
    let events = bus.subscribe();
    let channel = ScriptedChannel::new([Step::Fail, Step::Fail, Step::Frame], Step::Fail);
    let reads = channel.reads();

    let handle = worker(channel, settings(24.0), bus, sink).spawn().unwrap();
    let seen = collect_until(&events, |seen| seen.iter().any(is_error));
    assert!(wait_until(|| handle.is_finished()));

    let names: Vec<_> = seen.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["frame_produced", "capture_error"]);
    match &seen[1] {
        Event::CaptureError { slot, kind, message } => {
            assert_eq!(*slot, SlotIndex(0));
            assert_eq!(*kind, ErrorKind::StreamFaulted);
            assert!(message.contains("48"), "unexpected reason: {}", message);
        }
        other => panic!("expected capture error, got {:?}", other),
    }
    assert_eq!(reads.load(Ordering::SeqCst), 2 + 1 + 48);
    assert!(events.drain().is_empty());

    let status = handle.join();
    assert_eq!(status.state, WorkerState::Stopped);
    assert_eq!(status.frames_captured, 1);
}

#[test]
fn fault_happens_at_exactly_48_failures_for_24_fps() {
    let (bus, sink) = bus_and_sink(None);
    let events = bus.subscribe();
    let channel = ScriptedChannel::failing();
    let reads = channel.reads();

    let handle = worker(channel, settings(24.0), bus, sink).spawn().unwrap();
    assert!(wait_until(|| handle.is_finished()));
    assert_eq!(reads.load(Ordering::SeqCst), 48);

    let status = handle.join();
    assert_eq!(status.consecutive_failures, 48);
    assert_eq!(events.drain().iter().filter(|e| is_error(e)).count(), 1);
}

#[test]
fn forty_seven_failures_do_not_fault() {
    let (bus, sink) = bus_and_sink(None);
    let events = bus.subscribe();
    let mut steps = vec![Step::Fail; 47];
    steps.push(Step::Frame);
    let channel = ScriptedChannel::new(steps, Step::Frame);

    let handle = worker(channel, settings(24.0), bus, sink).spawn().unwrap();
    let seen = collect_until(&events, |seen| !seen.is_empty());
    assert_eq!(seen.first().map(|e| e.name()), Some("frame_produced"));
    assert_eq!(handle.state(), WorkerState::Running);
    assert_eq!(handle.status().consecutive_failures, 0);

    let status = handle.join();
    assert_eq!(status.state, WorkerState::Stopped);
    assert!(status.error.is_none());
    assert!(!events.drain().iter().any(is_error));
}

#[test]
fn unopenable_channel_never_runs() {
    let (bus, sink) = bus_and_sink(None);
    let events = bus.subscribe();
    let channel = ScriptedChannel::unopenable();
    let reads = channel.reads();

    let handle = worker(channel, settings(24.0), bus, sink).spawn().unwrap();
    let seen = collect_until(&events, |seen| !seen.is_empty());
    assert!(wait_until(|| handle.is_finished()));
    assert_eq!(reads.load(Ordering::SeqCst), 0);
    match seen.first() {
        Some(Event::CaptureError { kind, message, .. }) => {
            assert_eq!(*kind, ErrorKind::OpenFailed);
            assert!(message.contains("refused"));
        }
        other => panic!("expected open failure, got {:?}", other),
    }
}

#[test]
fn persistence_toggle_applies_from_the_next_frame() {
    let store = Arc::new(RecordingStore::default());
    let (bus, sink) = bus_and_sink(Some(store.clone()));
    let events = bus.subscribe();
    let (gate, channel) = gated_channel();
    let slot_settings = settings(50.0);
    slot_settings.set_persist_target(Some("/captures/cam1".into()));

    let handle = worker(channel, slot_settings.clone(), bus, sink.clone())
        .spawn()
        .unwrap();

    let produced = |n: u64| {
        move |seen: &[Event]| {
            seen.iter().any(|e| {
                matches!(e, Event::FrameProduced { frame, .. } if frame.sequence == n)
            })
        }
    };

    gate.send(()).unwrap();
    gate.send(()).unwrap();
    collect_until(&events, produced(2));

    slot_settings.set_persist_enabled(true);
    gate.send(()).unwrap();
    gate.send(()).unwrap();
    collect_until(&events, produced(4));

    slot_settings.set_persist_enabled(false);
    gate.send(()).unwrap();
    collect_until(&events, produced(5));

    drop(gate);
    handle.join();
    sink.shutdown();

    assert_eq!(store.sequences(), vec![3, 4]);
    assert!(store
        .saved
        .lock()
        .iter()
        .all(|(slot, path, _)| *slot == SlotIndex(0) && path.ends_with("cam1")));
}

#[test]
fn frame_rate_changes_apply_while_running() {
    let (bus, sink) = bus_and_sink(None);
    let slot_settings = settings(1.0);
    let handle = worker(ScriptedChannel::frames(), slot_settings.clone(), bus, sink)
        .spawn()
        .unwrap();

    // At 1 fps only the first frame arrives quickly.
    assert!(wait_until(|| handle.status().frames_captured >= 1));
    slot_settings.set_desired_fps(200.0);
    assert!(wait_until(|| handle.status().frames_captured >= 20));
    handle.join();
}

#[test]
fn stop_returns_immediately_and_worker_stops() {
    let (bus, sink) = bus_and_sink(None);
    let events = bus.subscribe();
    let handle = worker(ScriptedChannel::frames(), settings(30.0), bus, sink)
        .spawn()
        .unwrap();
    assert!(wait_until(|| handle.status().frames_captured > 0));

    handle.stop();
    assert!(wait_until(|| handle.is_finished()));
    let after_stop = handle.status().frames_captured;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(handle.status().frames_captured, after_stop);

    handle.join();
    assert!(!events.drain().iter().any(is_error));
}
