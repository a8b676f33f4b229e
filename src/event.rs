//! Event bus.
//!
//! The core reports every state change through `EventBus` and never talks to
//! a UI directly. Any number of subscribers may listen; each gets its own
//! bounded queue.
//!
//! Ordering: `publish` delivers to all subscribers while holding the
//! subscriber list lock, so every subscriber observes the same global order.
//! In particular, events from one slot arrive in the order they were produced.
//!
//! Backpressure: a full subscriber queue blocks the publisher for a bounded
//! time, then the event is dropped for that subscriber and counted on its
//! `EventSubscription::dropped`. Frames and telemetry give up after
//! `publish_timeout`; bind, unbind and error events wait `lifecycle_timeout`.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{DeviceId, DeviceTelemetry};
use crate::frame::Frame;
use crate::slot::SlotIndex;

/// Why a `CaptureError` was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The channel could not be opened; the worker never ran.
    OpenFailed,
    /// Too many consecutive failed reads; the worker stopped.
    StreamFaulted,
    /// A frame could not be encoded for display. Capture continues.
    EncodeFailed,
    /// A frame could not be saved. Capture continues.
    SaveFailed,
}

impl ErrorKind {
    /// Whether the worker that raised this error has terminated.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::OpenFailed | ErrorKind::StreamFaulted)
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    SlotBound {
        slot: SlotIndex,
        device: DeviceId,
    },
    SlotUnbound {
        slot: SlotIndex,
        device: DeviceId,
    },
    FrameProduced {
        slot: SlotIndex,
        frame: Frame,
    },
    CaptureError {
        slot: SlotIndex,
        kind: ErrorKind,
        message: String,
    },
    TelemetryUpdate {
        slot: SlotIndex,
        device: DeviceId,
        info: DeviceTelemetry,
    },
}

impl Event {
    pub fn slot(&self) -> SlotIndex {
        match self {
            Event::SlotBound { slot, .. }
            | Event::SlotUnbound { slot, .. }
            | Event::FrameProduced { slot, .. }
            | Event::CaptureError { slot, .. }
            | Event::TelemetryUpdate { slot, .. } => *slot,
        }
    }

    /// Bind, unbind and error events. These describe the slot relation and
    /// get the longer publish wait.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Event::SlotBound { .. } | Event::SlotUnbound { .. } | Event::CaptureError { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::SlotBound { .. } => "slot_bound",
            Event::SlotUnbound { .. } => "slot_unbound",
            Event::FrameProduced { .. } => "frame_produced",
            Event::CaptureError { .. } => "capture_error",
            Event::TelemetryUpdate { .. } => "telemetry_update",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::SlotBound { slot, device } => write!(f, "{} bound to {}", slot, device),
            Event::SlotUnbound { slot, device } => write!(f, "{} released {}", slot, device),
            Event::FrameProduced { slot, frame } => write!(
                f,
                "{} frame #{} {}x{}",
                slot, frame.sequence, frame.width, frame.height
            ),
            Event::CaptureError {
                slot,
                kind,
                message,
            } => write!(f, "{} error ({:?}): {}", slot, kind, message),
            Event::TelemetryUpdate { slot, device, info } => {
                write!(f, "{} telemetry for {}: ", slot, device)?;
                match info.battery_level {
                    Some(level) => write!(f, "battery {}%", level)?,
                    None => write!(f, "battery unknown")?,
                }
                if let Some(status) = &info.battery_status {
                    write!(f, " ({:?})", status)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBusConfig {
    /// Queue length per subscriber.
    pub capacity: usize,
    /// Longest a frame or telemetry publish waits on one full subscriber.
    pub publish_timeout: Duration,
    /// Same, for bind, unbind and error events.
    pub lifecycle_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            publish_timeout: Duration::from_secs(1),
            lifecycle_timeout: Duration::from_secs(10),
        }
    }
}

struct Subscriber {
    tx: Sender<Event>,
    dropped: Arc<AtomicU64>,
}

pub struct EventBus {
    config: EventBusConfig,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = bounded(self.config.capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().push(Subscriber {
            tx,
            dropped: dropped.clone(),
        });
        EventSubscription { rx, dropped }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn publish(&self, event: Event) {
        let timeout = if event.is_lifecycle() {
            self.config.lifecycle_timeout
        } else {
            self.config.publish_timeout
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            match subscriber.tx.send_timeout(event.clone(), timeout) {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) => {
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "event bus: subscriber queue full, dropped {} for {}",
                        event.name(),
                        event.slot()
                    );
                    true
                }
                Err(SendTimeoutError::Disconnected(_)) => false,
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
///
/// A subscriber that stops reading holds up publishers and, once its queue
/// stays full past the publish wait, misses events. `dropped` counts them.
pub struct EventSubscription {
    rx: Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventSubscription {
    /// Events this subscriber missed because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Block until the next event; `None` once the bus is gone.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.rx.try_iter()
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(slot: usize, device: &str) -> Event {
        Event::SlotBound {
            slot: SlotIndex(slot),
            device: DeviceId::new(device),
        }
    }

    #[test]
    fn every_subscriber_sees_the_same_order() {
        let bus = EventBus::default();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(bound(0, "x"));
        bus.publish(bound(1, "y"));
        bus.publish(Event::SlotUnbound {
            slot: SlotIndex(0),
            device: DeviceId::new("x"),
        });

        let names_a: Vec<_> = a.drain().iter().map(|e| e.to_string()).collect();
        let names_b: Vec<_> = b.drain().iter().map(|e| e.to_string()).collect();
        assert_eq!(names_a, vec!["cam1 bound to x", "cam2 bound to y", "cam1 released x"]);
        assert_eq!(names_a, names_b);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::default();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(bound(0, "x"));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.drain().len(), 1);
    }

    #[test]
    fn full_queue_blocks_only_until_timeout() {
        let bus = EventBus::new(EventBusConfig {
            capacity: 1,
            publish_timeout: Duration::from_millis(20),
            lifecycle_timeout: Duration::from_millis(20),
        });
        let slow = bus.subscribe();

        bus.publish(bound(0, "first"));
        bus.publish(bound(0, "second"));

        let events = slow.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_string(), "cam1 bound to first");
        assert_eq!(slow.dropped(), 1);
        assert_eq!(bus.subscriber_count(), 1, "slow subscribers stay subscribed");
    }

    #[test]
    fn lifecycle_events_outwait_frames() {
        let bus = Arc::new(EventBus::new(EventBusConfig {
            capacity: 1,
            publish_timeout: Duration::from_millis(10),
            lifecycle_timeout: Duration::from_secs(5),
        }));
        let slow = bus.subscribe();
        bus.publish(bound(0, "first"));

        let frame = Frame::from_rgb(vec![0u8; 3], 1, 1, 1).unwrap();
        bus.publish(Event::FrameProduced {
            slot: SlotIndex(0),
            frame,
        });
        assert_eq!(slow.dropped(), 1, "frames give up quickly");

        let publisher = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                bus.publish(Event::SlotUnbound {
                    slot: SlotIndex(0),
                    device: DeviceId::new("first"),
                })
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(slow.recv().map(|e| e.name()), Some("slot_bound"));
        publisher.join().unwrap();
        assert_eq!(slow.recv().map(|e| e.name()), Some("slot_unbound"));
        assert_eq!(slow.dropped(), 1);
    }

    #[test]
    fn terminal_error_kinds() {
        assert!(ErrorKind::StreamFaulted.is_terminal());
        assert!(ErrorKind::OpenFailed.is_terminal());
        assert!(!ErrorKind::SaveFailed.is_terminal());
        assert!(!ErrorKind::EncodeFailed.is_terminal());
    }
}
