//! Per-slot capture worker.
//!
//! One thread per bound slot: open the channel, then read, publish and
//! dispatch frames at the slot's live frame rate until told to stop or until
//! the stream is declared dead.
//!
//! A stream is dead after `failure_threshold(fps, window)` consecutive failed
//! reads (an error or an empty read). Any successful read resets the count.
//! A dead or unopenable stream ends the worker with a single terminal
//! `CaptureError`; the reconciler frees the slot on its next pass.
//!
//! Stopping is cooperative. `WorkerHandle::stop` never blocks; the worker
//! notices at the next check point (before a read, after a read, or while
//! idling). Whatever a read returns after the stop request is discarded: no
//! frame is published and no failure is counted, so a stopped worker always
//! ends in `Stopped` and never in `Faulted`.
//!
//! `spawn_gated` starts the thread but holds it before the channel is opened
//! until the returned `StartGate` is opened, so the owner can publish the
//! binding before the worker's first event.

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::bridge::{CaptureChannel, DeviceId};
use crate::event::{ErrorKind, Event, EventBus};
use crate::frame::Frame;
use crate::sink::FrameSink;
use crate::slot::{failure_threshold, frame_period, SlotIndex, SlotSettings};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Faulted,
    /// Terminal. The thread is done with its channel.
    Stopped,
}

#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub consecutive_failures: u32,
    pub frames_captured: u64,
    pub last_frame_at: Option<SystemTime>,
    /// Set once the worker faulted.
    pub error: Option<String>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Starting,
            consecutive_failures: 0,
            frames_captured: 0,
            last_frame_at: None,
            error: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimingConfig {
    /// Pause between failed reads.
    pub retry_backoff: Duration,
    /// Seconds of missed frames before a stream counts as dead.
    pub failure_window_secs: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(100),
            failure_window_secs: 2.0,
        }
    }
}

struct WorkerShared {
    status: Mutex<WorkerStatus>,
    stop: AtomicBool,
    // Dropped on stop so a sleeping worker wakes up immediately.
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl WorkerShared {
    fn set_state(&self, state: WorkerState) {
        self.status.lock().state = state;
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_tx.lock().take();
    }
}

pub struct CaptureWorker {
    slot: SlotIndex,
    device: DeviceId,
    channel: Box<dyn CaptureChannel>,
    settings: Arc<SlotSettings>,
    timing: TimingConfig,
    bus: Arc<EventBus>,
    sink: Arc<FrameSink>,
    shared: Arc<WorkerShared>,
    stop_rx: Receiver<()>,
    start_rx: Option<Receiver<()>>,
    channel_open: bool,
}

/// Releases a worker started with `CaptureWorker::spawn_gated`. Dropping it
/// unopened stops the worker before it touches the channel.
pub struct StartGate {
    tx: Sender<()>,
}

impl StartGate {
    pub fn open(self) {
        let _ = self.tx.send(());
    }
}

impl CaptureWorker {
    pub fn new(
        slot: SlotIndex,
        device: DeviceId,
        channel: Box<dyn CaptureChannel>,
        settings: Arc<SlotSettings>,
        timing: TimingConfig,
        bus: Arc<EventBus>,
        sink: Arc<FrameSink>,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded(0);
        Self {
            slot,
            device,
            channel,
            settings,
            timing,
            bus,
            sink,
            shared: Arc::new(WorkerShared {
                status: Mutex::new(WorkerStatus::default()),
                stop: AtomicBool::new(false),
                stop_tx: Mutex::new(Some(stop_tx)),
            }),
            stop_rx,
            start_rx: None,
            channel_open: false,
        }
    }

    /// Start the capture thread (`cam<n>-capture`).
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        self.spawn_thread()
    }

    /// Start the capture thread held at a gate.
    pub fn spawn_gated(mut self) -> std::io::Result<(WorkerHandle, StartGate)> {
        let (tx, rx) = bounded(1);
        self.start_rx = Some(rx);
        let handle = self.spawn_thread()?;
        Ok((handle, StartGate { tx }))
    }

    fn spawn_thread(self) -> std::io::Result<WorkerHandle> {
        let slot = self.slot;
        let device = self.device.clone();
        let shared = self.shared.clone();
        let join = std::thread::Builder::new()
            .name(format!("{}-capture", slot))
            .spawn(move || {
                let mut worker = self;
                worker.run();
            })?;
        Ok(WorkerHandle {
            slot,
            device,
            shared,
            join: Some(join),
        })
    }

    fn run(&mut self) {
        self.shared.set_state(WorkerState::Starting);
        if !self.wait_for_start() {
            log::debug!("{}: stopped before start for {}", self.slot, self.device);
            self.shared.set_state(WorkerState::Stopped);
            return;
        }
        if let Err(err) = self.channel.open() {
            self.fault(
                ErrorKind::OpenFailed,
                format!("cannot open capture channel: {:#}", err),
            );
            return;
        }
        self.channel_open = true;
        self.shared.set_state(WorkerState::Running);
        log::info!("{}: capturing from {}", self.slot, self.device);

        let mut failures: u32 = 0;
        loop {
            if self.stop_requested() {
                break;
            }
            let cycle_start = Instant::now();
            let fps = self.settings.desired_fps();
            let threshold = failure_threshold(fps, self.timing.failure_window_secs);

            let result = self.channel.read_frame();
            if self.stop_requested() {
                break;
            }
            match result {
                Ok(Some(frame)) => {
                    failures = 0;
                    let persist = self.settings.persist_destination();
                    self.record_frame(&frame);
                    self.bus.publish(Event::FrameProduced {
                        slot: self.slot,
                        frame: frame.clone(),
                    });
                    self.sink.dispatch(self.slot, frame, persist);

                    let period = frame_period(fps);
                    let elapsed = cycle_start.elapsed();
                    if elapsed < period && self.wait_for_stop(period - elapsed) {
                        break;
                    }
                }
                result => {
                    failures = failures.saturating_add(1);
                    self.shared.status.lock().consecutive_failures = failures;
                    match result {
                        Err(err) => log::debug!(
                            "{}: read failed ({}/{}): {:#}",
                            self.slot,
                            failures,
                            threshold,
                            err
                        ),
                        _ => log::debug!(
                            "{}: empty read ({}/{})",
                            self.slot,
                            failures,
                            threshold
                        ),
                    }
                    if failures >= threshold {
                        self.fault(
                            ErrorKind::StreamFaulted,
                            format!("no frames (read failed {} consecutive times)", failures),
                        );
                        return;
                    }
                    if self.wait_for_stop(self.timing.retry_backoff) {
                        break;
                    }
                }
            }
        }

        self.shared.set_state(WorkerState::Stopping);
        self.release_channel();
        self.shared.set_state(WorkerState::Stopped);
        log::info!("{}: capture stopped for {}", self.slot, self.device);
    }

    fn record_frame(&self, frame: &Frame) {
        let mut status = self.shared.status.lock();
        status.consecutive_failures = 0;
        status.frames_captured += 1;
        status.last_frame_at = Some(frame.captured_at);
    }

    fn fault(&mut self, kind: ErrorKind, message: String) {
        log::error!("{}: {} ({})", self.slot, message, self.device);
        {
            let mut status = self.shared.status.lock();
            status.state = WorkerState::Faulted;
            status.error = Some(message.clone());
        }
        self.bus.publish(Event::CaptureError {
            slot: self.slot,
            kind,
            message,
        });
        self.release_channel();
        self.shared.set_state(WorkerState::Stopped);
    }

    fn release_channel(&mut self) {
        if self.channel_open {
            self.channel.close();
            self.channel_open = false;
        }
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Block until the start gate opens. False if stopped first.
    fn wait_for_start(&mut self) -> bool {
        let Some(gate) = self.start_rx.take() else {
            return !self.stop_requested();
        };
        let opened = select! {
            recv(gate) -> msg => msg.is_ok(),
            recv(self.stop_rx) -> _ => false,
        };
        opened && !self.stop_requested()
    }

    /// Sleep up to `timeout`. Returns true if a stop was requested.
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return self.stop_requested();
        }
        match self.stop_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.stop_requested(),
        }
    }
}

impl Drop for CaptureWorker {
    // Also runs when the capture thread unwinds, so the slot never stays
    // occupied by a dead worker.
    fn drop(&mut self) {
        self.release_channel();
        self.shared.set_state(WorkerState::Stopped);
    }
}

/// Owner's side of a running worker. Dropping it requests a stop.
pub struct WorkerHandle {
    slot: SlotIndex,
    device: DeviceId,
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Ask the worker to stop. Returns immediately.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn state(&self) -> WorkerState {
        self.shared.status.lock().state
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status.lock().clone()
    }

    /// The thread has released its channel and will not publish again.
    pub fn is_finished(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    /// Stop the worker and wait for its thread.
    pub fn join(mut self) -> WorkerStatus {
        self.stop();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("{}: capture thread panicked", self.slot);
            }
        }
        self.status()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}
