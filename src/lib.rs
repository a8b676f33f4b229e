//! camslot
//!
//! Device lifecycle reconciler and per-device capture pipeline for a small,
//! fixed set of camera slots.
//!
//! # Architecture
//!
//! 1. **Reconcile**: a background thread enumerates devices through a
//!    `DeviceBridge` and binds present devices to free slots in order.
//! 2. **Capture**: each bound slot runs a `CaptureWorker` thread that reads
//!    frames at the slot's live frame rate and faults out after ~2 seconds of
//!    consecutive failed reads.
//! 3. **Fan-out**: frames go through `FrameSink` to the display (latest frame
//!    wins) and, when enabled, to storage (every frame).
//! 4. **Events**: every state change is published on the `EventBus`.
//!
//! # Module Structure
//!
//! - `slot`: slot indices and live per-slot settings
//! - `bridge`: device bridges (adb, stub) and capture channels (MJPEG)
//! - `assignment`: the slot → device relation and `reconcile`
//! - `worker`: the per-slot capture loop
//! - `sink`: display and persistence fan-out
//! - `event`: the event bus
//! - `service`: reconciler thread, telemetry polling, ordered shutdown
//! - `config`: file and environment configuration
//! - `console`: operator commands for the daemon

pub mod assignment;
pub mod bridge;
pub mod config;
pub mod console;
pub mod event;
pub mod frame;
pub mod service;
pub mod sink;
pub mod slot;
pub mod worker;

pub use assignment::{ReconcileOutcome, SlotAssignment, SlotSnapshot};
pub use bridge::{
    AdbBridge, AdbConfig, BatteryStatus, CaptureChannel, ControlCommand, DeviceBridge, DeviceId,
    DeviceStatus, DeviceTelemetry, StubBridge, StubConfig,
};
pub use config::CamslotConfig;
pub use console::{ConsoleCommand, RecordingActions};
pub use event::{ErrorKind, Event, EventBus, EventBusConfig, EventSubscription};
pub use frame::{EncodedFrame, Frame};
pub use service::{CaptureService, ServiceOptions};
pub use sink::{
    DisplayConsumer, FrameSink, FrameStore, PersistenceConsumer, SinkConsumers, SinkStats,
};
pub use slot::{SlotConfig, SlotIndex, SlotSettings, DEFAULT_FPS, SLOT_COUNT};
pub use worker::{
    CaptureWorker, StartGate, TimingConfig, WorkerHandle, WorkerState, WorkerStatus,
};
