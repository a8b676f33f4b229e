//! Slot assignment and reconciliation.
//!
//! `SlotAssignment` is the single owner of the slot → device relation. Each
//! `reconcile` pass brings the relation in line with the devices the bridge
//! currently reports:
//! - slots whose device vanished, or whose worker has finished, are released
//! - free slots (ascending) are paired with unbound devices (bridge order)
//! - every pair that connects gets a fresh `CaptureWorker`, registered in the
//!   table before `SlotBound` is published and released only after it
//!
//! The relation is a partial bijection: a slot holds at most one device and a
//! device sits in at most one slot. Bridge I/O happens outside the table lock;
//! registering a binding happens inside it, and passes are serialized.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::bridge::{DeviceBridge, DeviceId};
use crate::event::{Event, EventBus};
use crate::sink::FrameSink;
use crate::slot::{SlotConfig, SlotIndex, SlotSettings};
use crate::worker::{CaptureWorker, TimingConfig, WorkerHandle, WorkerState, WorkerStatus};

/// What one reconcile pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub unbound: Vec<(SlotIndex, DeviceId)>,
    pub bound: Vec<(SlotIndex, DeviceId)>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.unbound.is_empty() && self.bound.is_empty()
    }
}

/// Consistent copy of one slot, taken under the table lock.
#[derive(Clone, Debug)]
pub struct SlotSnapshot {
    pub slot: SlotIndex,
    pub device: Option<DeviceId>,
    pub worker: Option<WorkerStatus>,
    pub config: SlotConfig,
}

impl SlotSnapshot {
    pub fn occupied(&self) -> bool {
        self.device.is_some()
    }
}

struct Binding {
    device: DeviceId,
    worker: WorkerHandle,
}

struct AssignmentTable {
    bindings: Vec<Option<Binding>>,
    // Workers told to stop but possibly still winding down.
    retiring: Vec<WorkerHandle>,
}

pub struct SlotAssignment {
    bridge: Arc<dyn DeviceBridge>,
    bus: Arc<EventBus>,
    sink: Arc<FrameSink>,
    timing: TimingConfig,
    settings: Vec<Arc<SlotSettings>>,
    table: Mutex<AssignmentTable>,
    reconcile_lock: Mutex<()>,
}

impl SlotAssignment {
    /// One slot per entry in `settings`.
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        bus: Arc<EventBus>,
        sink: Arc<FrameSink>,
        settings: Vec<Arc<SlotSettings>>,
        timing: TimingConfig,
    ) -> Self {
        let bindings = settings.iter().map(|_| None).collect();
        Self {
            bridge,
            bus,
            sink,
            timing,
            settings,
            table: Mutex::new(AssignmentTable {
                bindings,
                retiring: Vec::new(),
            }),
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.settings.len()
    }

    pub fn settings(&self, slot: SlotIndex) -> Option<Arc<SlotSettings>> {
        self.settings.get(slot.index()).cloned()
    }

    /// Bring the slot table in line with `live` (present devices, bridge order).
    pub fn reconcile(&self, live: &[DeviceId]) -> ReconcileOutcome {
        let _pass = self.reconcile_lock.lock();
        let mut outcome = ReconcileOutcome::default();

        let mut live_unique: Vec<&DeviceId> = Vec::with_capacity(live.len());
        for device in live {
            if !live_unique.contains(&device) {
                live_unique.push(device);
            }
        }

        let released = {
            let mut table = self.table.lock();
            table.retiring.retain(|worker| !worker.is_finished());

            let mut released = Vec::new();
            for (idx, entry) in table.bindings.iter_mut().enumerate() {
                let release = match entry {
                    Some(binding) => {
                        !live_unique.contains(&&binding.device) || binding.worker.is_finished()
                    }
                    None => false,
                };
                if release {
                    if let Some(binding) = entry.take() {
                        released.push((SlotIndex(idx), binding));
                    }
                }
            }
            released
        };

        for (slot, binding) in released {
            let Binding { device, worker } = binding;
            worker.stop();
            if worker.state() == WorkerState::Stopped {
                log::info!("{}: releasing {} (worker stopped)", slot, device);
            } else {
                log::info!("{}: releasing {} (device gone)", slot, device);
            }
            self.bus.publish(Event::SlotUnbound {
                slot,
                device: device.clone(),
            });
            if let Err(err) = self.bridge.disconnect(slot, &device) {
                log::warn!("{}: disconnect {} failed: {:#}", slot, device, err);
            }
            self.table.lock().retiring.push(worker);
            outcome.unbound.push((slot, device));
        }

        let pairs: Vec<(SlotIndex, DeviceId)> = {
            let table = self.table.lock();
            let free = table
                .bindings
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.is_none())
                .map(|(idx, _)| SlotIndex(idx));
            let unassigned = live_unique.iter().filter(|device| {
                !table
                    .bindings
                    .iter()
                    .flatten()
                    .any(|binding| &binding.device == **device)
            });
            let pairs: Vec<_> = free
                .zip(unassigned)
                .map(|(slot, device)| (slot, (*device).clone()))
                .collect();
            pairs
        };

        for (slot, device) in pairs {
            if self.bind(slot, &device) {
                outcome.bound.push((slot, device));
            }
        }

        outcome
    }

    fn bind(&self, slot: SlotIndex, device: &DeviceId) -> bool {
        let Some(settings) = self.settings(slot) else {
            return false;
        };
        let channel = match self.bridge.connect(slot, device) {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("{}: cannot connect {}: {:#}", slot, device, err);
                return false;
            }
        };

        let worker = CaptureWorker::new(
            slot,
            device.clone(),
            channel,
            settings.clone(),
            self.timing.clone(),
            self.bus.clone(),
            self.sink.clone(),
        );
        let (handle, gate) = match worker.spawn_gated() {
            Ok(spawned) => spawned,
            Err(err) => {
                log::error!("{}: cannot start capture thread: {}", slot, err);
                if let Err(err) = self.bridge.disconnect(slot, device) {
                    log::warn!("{}: disconnect {} failed: {:#}", slot, device, err);
                }
                return false;
            }
        };

        // Readers see the binding before anyone hears about it, and the
        // worker's first event follows `SlotBound`.
        self.table.lock().bindings[slot.index()] = Some(Binding {
            device: device.clone(),
            worker: handle,
        });
        log::info!(
            "{}: bound to {} at {} fps",
            slot,
            device,
            settings.desired_fps()
        );
        self.bus.publish(Event::SlotBound {
            slot,
            device: device.clone(),
        });
        gate.open();
        true
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let table = self.table.lock();
        let snapshot: Vec<_> = table
            .bindings
            .iter()
            .enumerate()
            .map(|(idx, entry)| SlotSnapshot {
                slot: SlotIndex(idx),
                device: entry.as_ref().map(|b| b.device.clone()),
                worker: entry.as_ref().map(|b| b.worker.status()),
                config: self.settings[idx].current(),
            })
            .collect();
        snapshot
    }

    pub fn device_for(&self, slot: SlotIndex) -> Option<DeviceId> {
        self.table
            .lock()
            .bindings
            .get(slot.index())
            .and_then(|entry| entry.as_ref().map(|b| b.device.clone()))
    }

    pub fn slot_for(&self, device: &DeviceId) -> Option<SlotIndex> {
        self.table
            .lock()
            .bindings
            .iter()
            .position(|entry| entry.as_ref().is_some_and(|b| &b.device == device))
            .map(SlotIndex)
    }

    pub fn worker_state(&self, slot: SlotIndex) -> Option<WorkerState> {
        self.table
            .lock()
            .bindings
            .get(slot.index())
            .and_then(|entry| entry.as_ref().map(|b| b.worker.state()))
    }

    /// Stop and join every worker, then release the devices.
    pub fn shutdown(&self) {
        let _pass = self.reconcile_lock.lock();
        let (bound, retiring) = {
            let mut table = self.table.lock();
            let bound: Vec<_> = table
                .bindings
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, entry)| entry.take().map(|b| (SlotIndex(idx), b)))
                .collect();
            (bound, std::mem::take(&mut table.retiring))
        };

        for (_, binding) in &bound {
            binding.worker.stop();
        }
        for worker in retiring {
            worker.join();
        }
        for (slot, Binding { device, worker }) in bound {
            let status = worker.join();
            log::info!(
                "{}: released {} after {} frames",
                slot,
                device,
                status.frames_captured
            );
            if let Err(err) = self.bridge.disconnect(slot, &device) {
                log::warn!("{}: disconnect {} failed: {:#}", slot, device, err);
            }
            self.bus.publish(Event::SlotUnbound { slot, device });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{present_devices, StubBridge, StubConfig};
    use crate::sink::SinkConsumers;

    fn assignment(bridge: Arc<StubBridge>) -> SlotAssignment {
        let bus = Arc::new(EventBus::default());
        let sink = Arc::new(FrameSink::new(bus.clone(), 2, SinkConsumers::default()).unwrap());
        let settings = (0..2)
            .map(|_| {
                let settings = SlotSettings::default();
                settings.set_desired_fps(50.0);
                Arc::new(settings)
            })
            .collect();
        SlotAssignment::new(bridge, bus, sink, settings, TimingConfig::default())
    }

    fn live(bridge: &StubBridge) -> Vec<DeviceId> {
        present_devices(&bridge.enumerate().unwrap())
    }

    #[test]
    fn duplicate_devices_are_bound_once() {
        let bridge = Arc::new(StubBridge::with_devices(
            StubConfig {
                width: 4,
                height: 4,
            },
            ["a"],
        ));
        let assignment = assignment(bridge.clone());
        let id = DeviceId::new("stub://a");

        let outcome = assignment.reconcile(&[id.clone(), id.clone()]);
        assert_eq!(outcome.bound, vec![(SlotIndex(0), id.clone())]);
        assert_eq!(assignment.slot_for(&id), Some(SlotIndex(0)));
        assert_eq!(assignment.device_for(SlotIndex(1)), None);

        assert!(assignment.reconcile(&live(&bridge)).is_empty());
        assignment.shutdown();
        assert!(assignment.snapshot().iter().all(|s| !s.occupied()));
    }
}
