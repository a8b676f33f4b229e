#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camslot::{
    CaptureChannel, ControlCommand, DeviceBridge, DeviceId, DeviceStatus, EncodedFrame, Event,
    EventBus, EventSubscription, Frame, FrameSink, PersistenceConsumer, SinkConsumers, SlotIndex,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn tiny_frame(sequence: u64) -> Frame {
    Frame::from_rgb(vec![(sequence % 256) as u8; 2 * 2 * 3], 2, 2, sequence).unwrap()
}

#[derive(Clone, Copy, Debug)]
pub enum Step {
    Frame,
    Empty,
    Fail,
}

/// Plays `steps`, then repeats `tail` forever.
pub struct ScriptedChannel {
    steps: VecDeque<Step>,
    tail: Step,
    sequence: u64,
    reads: Arc<AtomicU32>,
    open_error: bool,
    tracker: Option<Arc<AtomicUsize>>,
}

impl ScriptedChannel {
    pub fn new(steps: impl IntoIterator<Item = Step>, tail: Step) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            tail,
            sequence: 0,
            reads: Arc::new(AtomicU32::new(0)),
            open_error: false,
            tracker: None,
        }
    }

    pub fn frames() -> Self {
        Self::new([], Step::Frame)
    }

    pub fn failing() -> Self {
        Self::new([], Step::Fail)
    }

    pub fn unopenable() -> Self {
        let mut channel = Self::failing();
        channel.open_error = true;
        channel
    }

    /// Shared count of `read_frame` calls.
    pub fn reads(&self) -> Arc<AtomicU32> {
        self.reads.clone()
    }

    fn track(mut self, tracker: Arc<AtomicUsize>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

impl CaptureChannel for ScriptedChannel {
    fn open(&mut self) -> Result<()> {
        if self.open_error {
            bail!("device refused the stream");
        }
        if let Some(tracker) = &self.tracker {
            tracker.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front().unwrap_or(self.tail) {
            Step::Frame => {
                self.sequence += 1;
                Ok(Some(tiny_frame(self.sequence)))
            }
            Step::Empty => Ok(None),
            Step::Fail => Err(anyhow!("scripted read failure")),
        }
    }

    fn close(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Produces one frame per message on its gate. Dropping the gate makes every
/// later read fail.
pub struct GatedChannel {
    gate: Receiver<()>,
    sequence: u64,
}

pub fn gated_channel() -> (Sender<()>, GatedChannel) {
    let (tx, rx) = unbounded();
    (
        tx,
        GatedChannel {
            gate: rx,
            sequence: 0,
        },
    )
}

impl CaptureChannel for GatedChannel {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self.gate.recv_timeout(Duration::from_secs(10)) {
            Ok(()) => {
                self.sequence += 1;
                Ok(Some(tiny_frame(self.sequence)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("gate closed")),
        }
    }

    fn close(&mut self) {}
}

/// Each read waits for the next step sent on its feed, so a test can hold a
/// read in flight. Closing the feed makes reads fail.
pub struct FedChannel {
    feed: Receiver<Step>,
    sequence: u64,
    reads: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
}

pub fn fed_channel() -> (Sender<Step>, FedChannel) {
    let (tx, rx) = unbounded();
    (
        tx,
        FedChannel {
            feed: rx,
            sequence: 0,
            reads: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        },
    )
}

impl FedChannel {
    /// Shared count of `read_frame` calls, including one still waiting.
    pub fn reads(&self) -> Arc<AtomicU32> {
        self.reads.clone()
    }

    /// Set once the worker has released the channel.
    pub fn closed(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl CaptureChannel for FedChannel {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.feed.recv() {
            Ok(Step::Frame) => {
                self.sequence += 1;
                Ok(Some(tiny_frame(self.sequence)))
            }
            Ok(Step::Empty) => Ok(None),
            Ok(Step::Fail) => Err(anyhow!("fed read failure")),
            Err(_) => Err(anyhow!("feed closed")),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory bridge. Connecting hands out queued channels first, then
/// channels that produce frames forever.
#[derive(Default)]
pub struct FakeBridge {
    devices: Mutex<Vec<DeviceId>>,
    enumeration_down: AtomicBool,
    refused: Mutex<HashSet<DeviceId>>,
    queued: Mutex<HashMap<DeviceId, VecDeque<Box<dyn CaptureChannel>>>>,
    open_channels: Mutex<HashMap<DeviceId, Arc<AtomicUsize>>>,
    pub connects: Mutex<Vec<(SlotIndex, DeviceId)>>,
    pub disconnects: Mutex<Vec<(SlotIndex, DeviceId)>>,
}

impl FakeBridge {
    pub fn with_devices(names: &[&str]) -> Self {
        let bridge = Self::default();
        bridge.set_devices(names);
        bridge
    }

    pub fn set_devices(&self, names: &[&str]) {
        *self.devices.lock() = names.iter().map(|name| DeviceId::new(*name)).collect();
    }

    pub fn set_enumeration_down(&self, down: bool) {
        self.enumeration_down.store(down, Ordering::SeqCst);
    }

    pub fn set_refused(&self, name: &str, refused: bool) {
        let id = DeviceId::new(name);
        if refused {
            self.refused.lock().insert(id);
        } else {
            self.refused.lock().remove(&id);
        }
    }

    pub fn queue_channel(&self, name: &str, channel: impl CaptureChannel + 'static) {
        self.queued
            .lock()
            .entry(DeviceId::new(name))
            .or_default()
            .push_back(Box::new(channel));
    }

    /// Channels of `name` that are currently open.
    pub fn open_channels(&self, name: &str) -> usize {
        self.tracker(&DeviceId::new(name)).load(Ordering::SeqCst)
    }

    fn tracker(&self, device: &DeviceId) -> Arc<AtomicUsize> {
        self.open_channels
            .lock()
            .entry(device.clone())
            .or_default()
            .clone()
    }
}

impl DeviceBridge for FakeBridge {
    fn enumerate(&self) -> Result<Vec<(DeviceId, DeviceStatus)>> {
        if self.enumeration_down.load(Ordering::SeqCst) {
            bail!("bridge unavailable");
        }
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|id| (id.clone(), DeviceStatus::Present))
            .collect())
    }

    fn connect(&self, slot: SlotIndex, device: &DeviceId) -> Result<Box<dyn CaptureChannel>> {
        if self.refused.lock().contains(device) {
            bail!("{} refused", device);
        }
        self.connects.lock().push((slot, device.clone()));
        let queued = self
            .queued
            .lock()
            .get_mut(device)
            .and_then(|channels| channels.pop_front());
        let channel: Box<dyn CaptureChannel> = match queued {
            Some(channel) => channel,
            None => Box::new(ScriptedChannel::frames().track(self.tracker(device))),
        };
        Ok(channel)
    }

    fn disconnect(&self, slot: SlotIndex, device: &DeviceId) -> Result<()> {
        self.disconnects.lock().push((slot, device.clone()));
        Ok(())
    }

    fn send_control(&self, _device: &DeviceId, _command: &ControlCommand) -> Result<()> {
        Ok(())
    }
}

/// Persistence consumer that remembers what it was asked to save.
#[derive(Default)]
pub struct RecordingStore {
    pub saved: Mutex<Vec<(SlotIndex, PathBuf, u64)>>,
}

impl RecordingStore {
    pub fn sequences(&self) -> Vec<u64> {
        self.saved.lock().iter().map(|(_, _, seq)| *seq).collect()
    }
}

impl PersistenceConsumer for RecordingStore {
    fn save(&self, slot: SlotIndex, target: &Path, frame: &EncodedFrame) -> Result<()> {
        self.saved
            .lock()
            .push((slot, target.to_path_buf(), frame.sequence));
        Ok(())
    }
}

pub fn bus_and_sink(
    persistence: Option<Arc<dyn PersistenceConsumer>>,
) -> (Arc<EventBus>, Arc<FrameSink>) {
    let bus = Arc::new(EventBus::default());
    let sink = FrameSink::new(
        bus.clone(),
        2,
        SinkConsumers {
            display: None,
            persistence,
        },
    )
    .unwrap();
    (bus, Arc::new(sink))
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Receive events until `done` holds for the collected list (or time runs out).
pub fn collect_until(
    events: &EventSubscription,
    mut done: impl FnMut(&[Event]) -> bool,
) -> Vec<Event> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    while !done(&seen) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if let Some(event) = events.recv_timeout(deadline - now) {
            seen.push(event);
        }
    }
    seen
}

/// Events other than `FrameProduced`, as `(name, slot)` pairs.
pub fn lifecycle(events: &[Event]) -> Vec<(&'static str, usize)> {
    events
        .iter()
        .filter(|event| !matches!(event, Event::FrameProduced { .. }))
        .map(|event| (event.name(), event.slot().index()))
        .collect()
}
