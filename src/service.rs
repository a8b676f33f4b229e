//! Capture service: the reconciliation loop around `SlotAssignment`.
//!
//! `CaptureService::start` runs one reconcile pass synchronously, then hands
//! off to a reconciler thread that re-enumerates devices every
//! `reconcile_interval` and polls device telemetry every
//! `telemetry_interval`. Shutdown stops that thread first, so no new workers
//! are spawned, then stops and joins every worker, releases the devices and
//! drains the frame sink.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::assignment::{ReconcileOutcome, SlotAssignment, SlotSnapshot};
use crate::bridge::{present_devices, ControlCommand, DeviceBridge};
use crate::event::{Event, EventBus, EventBusConfig, EventSubscription};
use crate::sink::{FrameSink, SinkConsumers, SinkStats};
use crate::slot::{SlotConfig, SlotIndex, SlotSettings, DEFAULT_FPS, SLOT_COUNT};
use crate::worker::TimingConfig;

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    pub slots: usize,
    /// Initial frame rate of every slot.
    pub default_fps: f64,
    pub timing: TimingConfig,
    pub reconcile_interval: Duration,
    /// `None` disables telemetry polling.
    pub telemetry_interval: Option<Duration>,
    pub events: EventBusConfig,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            slots: SLOT_COUNT,
            default_fps: DEFAULT_FPS,
            timing: TimingConfig::default(),
            reconcile_interval: Duration::from_secs(2),
            telemetry_interval: Some(Duration::from_secs(5)),
            events: EventBusConfig::default(),
        }
    }
}

struct ReconcilerHandle {
    shutdown: Arc<AtomicBool>,
    // Dropping it wakes the thread out of its interval wait.
    wake: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.take();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("reconciler thread panicked"))?;
        }
        Ok(())
    }
}

pub struct CaptureService {
    bridge: Arc<dyn DeviceBridge>,
    bus: Arc<EventBus>,
    sink: Arc<FrameSink>,
    assignment: Arc<SlotAssignment>,
    options: ServiceOptions,
    reconciler: Option<ReconcilerHandle>,
    stopped: bool,
}

impl CaptureService {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        options: ServiceOptions,
        consumers: SinkConsumers,
    ) -> Result<Self> {
        if options.slots == 0 {
            bail!("capture service needs at least one slot");
        }
        if options.reconcile_interval.is_zero() {
            bail!("reconcile interval must be greater than zero");
        }
        let bus = Arc::new(EventBus::new(options.events.clone()));
        let sink = Arc::new(FrameSink::new(bus.clone(), options.slots, consumers)?);
        let settings = (0..options.slots)
            .map(|_| {
                Arc::new(SlotSettings::new(SlotConfig {
                    desired_fps: options.default_fps,
                    ..SlotConfig::default()
                }))
            })
            .collect();
        let assignment = Arc::new(SlotAssignment::new(
            bridge.clone(),
            bus.clone(),
            sink.clone(),
            settings,
            options.timing.clone(),
        ));
        Ok(Self {
            bridge,
            bus,
            sink,
            assignment,
            options,
            reconciler: None,
            stopped: false,
        })
    }

    /// Subscribe before `start` to see the initial bindings.
    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Reconcile once, then keep reconciling on a background thread.
    pub fn start(&mut self) -> Result<()> {
        if self.reconciler.is_some() || self.stopped {
            bail!("capture service already started");
        }
        if let Some(outcome) = reconcile_tick(&*self.bridge, &self.assignment) {
            log::info!(
                "startup reconcile: {} slot(s) bound",
                outcome.bound.len()
            );
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(0);
        let thread_shutdown = shutdown.clone();
        let bridge = self.bridge.clone();
        let assignment = self.assignment.clone();
        let bus = self.bus.clone();
        let interval = self.options.reconcile_interval;
        let telemetry_interval = self.options.telemetry_interval;

        let join = std::thread::Builder::new()
            .name("camslot-reconciler".to_string())
            .spawn(move || {
                let mut last_telemetry = Instant::now();
                loop {
                    match wake_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if thread_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    reconcile_tick(&*bridge, &assignment);
                    if let Some(every) = telemetry_interval {
                        if last_telemetry.elapsed() >= every {
                            poll_telemetry(&*bridge, &assignment, &bus);
                            last_telemetry = Instant::now();
                        }
                    }
                }
                log::debug!("reconciler thread exiting");
            })
            .context("spawn reconciler thread")?;

        self.reconciler = Some(ReconcilerHandle {
            shutdown,
            wake: Some(wake_tx),
            join: Some(join),
        });
        Ok(())
    }

    /// Run one reconcile pass now. `None` if enumeration failed.
    pub fn reconcile_now(&self) -> Option<ReconcileOutcome> {
        reconcile_tick(&*self.bridge, &self.assignment)
    }

    pub fn poll_telemetry_now(&self) {
        poll_telemetry(&*self.bridge, &self.assignment, &self.bus);
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.assignment.snapshot()
    }

    pub fn assignment(&self) -> &SlotAssignment {
        &self.assignment
    }

    pub fn sink_stats(&self) -> SinkStats {
        self.sink.stats()
    }

    pub fn settings(&self, slot: SlotIndex) -> Result<Arc<SlotSettings>> {
        self.assignment
            .settings(slot)
            .ok_or_else(|| anyhow!("no such slot: {}", slot))
    }

    /// Takes effect on the slot's next capture cycle.
    pub fn set_desired_fps(&self, slot: SlotIndex, fps: f64) -> Result<()> {
        if !fps.is_finite() {
            bail!("frame rate must be finite, got {}", fps);
        }
        self.settings(slot)?.set_desired_fps(fps);
        log::info!("{}: frame rate set to {}", slot, fps);
        Ok(())
    }

    pub fn set_persist_target(&self, slot: SlotIndex, target: Option<PathBuf>) -> Result<()> {
        self.settings(slot)?.set_persist_target(target);
        Ok(())
    }

    pub fn set_persist_enabled(&self, slot: SlotIndex, enabled: bool) -> Result<()> {
        self.settings(slot)?.set_persist_enabled(enabled);
        log::info!(
            "{}: frame saving {}",
            slot,
            if enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Toggle frame saving on every slot at once.
    pub fn set_persist_all(&self, enabled: bool) {
        for slot in SlotIndex::all(self.assignment.slot_count()) {
            if let Some(settings) = self.assignment.settings(slot) {
                settings.set_persist_enabled(enabled);
            }
        }
        log::info!("frame saving {} for all slots", if enabled { "on" } else { "off" });
    }

    /// Run a one-shot command on the device bound to `slot`.
    ///
    /// The bridge call happens without any assignment lock held and does not
    /// touch the slot's worker.
    pub fn send_control(&self, slot: SlotIndex, command: &ControlCommand) -> Result<()> {
        let device = self
            .assignment
            .device_for(slot)
            .ok_or_else(|| anyhow!("{} has no device bound", slot))?;
        self.bridge
            .send_control(&device, command)
            .with_context(|| format!("{}: {:?} on {}", slot, command, device))
    }

    /// Ordered shutdown: reconciler, then workers and devices, then sink.
    /// Returns the sink counters once every pending save has finished.
    pub fn shutdown(mut self) -> Result<SinkStats> {
        self.stop_all()?;
        Ok(self.sink.stats())
    }

    fn stop_all(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let reconciler = match self.reconciler.take() {
            Some(handle) => handle.stop(),
            None => Ok(()),
        };
        self.assignment.shutdown();
        self.sink.shutdown();
        log::info!("capture service stopped");
        reconciler
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        if let Err(err) = self.stop_all() {
            log::error!("capture service shutdown: {:#}", err);
        }
    }
}

/// Enumerate and reconcile. Enumeration errors skip the pass and keep every
/// existing binding.
fn reconcile_tick(bridge: &dyn DeviceBridge, assignment: &SlotAssignment) -> Option<ReconcileOutcome> {
    let devices = match bridge.enumerate() {
        Ok(devices) => devices,
        Err(err) => {
            log::warn!("device enumeration failed, keeping bindings: {:#}", err);
            return None;
        }
    };
    let outcome = assignment.reconcile(&present_devices(&devices));
    if !outcome.is_empty() {
        log::debug!(
            "reconcile: {} unbound, {} bound",
            outcome.unbound.len(),
            outcome.bound.len()
        );
    }
    Some(outcome)
}

fn poll_telemetry(bridge: &dyn DeviceBridge, assignment: &SlotAssignment, bus: &EventBus) {
    for snapshot in assignment.snapshot() {
        let Some(device) = snapshot.device else {
            continue;
        };
        match bridge.telemetry(&device) {
            Ok(info) if info.is_empty() => {}
            Ok(info) => bus.publish(Event::TelemetryUpdate {
                slot: snapshot.slot,
                device,
                info,
            }),
            Err(err) => log::debug!("{}: telemetry from {} failed: {:#}", snapshot.slot, device, err),
        }
    }
}
