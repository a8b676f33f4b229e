//! Device bridges and capture channels.
//!
//! A `DeviceBridge` knows how to find capture devices, open a data channel to
//! each, and run one-shot control commands on them. A `CaptureChannel` is the
//! per-device stream the capture worker pulls frames from.
//!
//! Implementations:
//! - `adb`: Android phones over USB, streamed through `adb forward`
//! - `mjpeg`: multipart MJPEG over HTTP (the channel `adb` hands out)
//! - `stub`: synthetic `stub://` devices for tests and dry runs
//!
//! Bridge calls may block on external I/O. The reconciler never holds the
//! assignment lock across them.

pub mod adb;
pub mod mjpeg;
pub mod stub;

pub use adb::{AdbBridge, AdbConfig};
pub use mjpeg::{MjpegChannel, MjpegConfig};
pub use stub::{StubBridge, StubConfig};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::frame::Frame;
use crate::slot::SlotIndex;

/// Stable identity of a physical device (an adb serial, a stub name, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Availability reported by the bridge. Only `Present` devices get bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Present,
    Unauthorized,
    Offline,
}

/// One-shot feature commands. None of these touch the capture pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Flash the torch briefly.
    ToggleTorch,
    /// Launch an activity, e.g. `com.dev47apps.droidcam/.DroidCam`.
    StartActivity { component: String },
    /// Simulate a screen tap.
    Tap { x: u32, y: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryStatus {
    Unknown,
    Charging,
    Discharging,
    NotCharging,
    Full,
    Other(i32),
}

impl BatteryStatus {
    /// Map an Android `BatteryManager.BATTERY_STATUS_*` code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => BatteryStatus::Unknown,
            2 => BatteryStatus::Charging,
            3 => BatteryStatus::Discharging,
            4 => BatteryStatus::NotCharging,
            5 => BatteryStatus::Full,
            other => BatteryStatus::Other(other),
        }
    }
}

/// Periodic device health info forwarded as `TelemetryUpdate` events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub battery_level: Option<u8>,
    pub battery_status: Option<BatteryStatus>,
}

impl DeviceTelemetry {
    pub fn is_empty(&self) -> bool {
        self.battery_level.is_none() && self.battery_status.is_none()
    }
}

/// Source of devices and their data channels.
pub trait DeviceBridge: Send + Sync {
    /// List devices currently visible to the bridge, in a stable order.
    fn enumerate(&self) -> Result<Vec<(DeviceId, DeviceStatus)>>;

    /// Establish the data channel for `device` on behalf of `slot`.
    fn connect(&self, slot: SlotIndex, device: &DeviceId) -> Result<Box<dyn CaptureChannel>>;

    /// Tear down whatever `connect` set up for this slot.
    fn disconnect(&self, slot: SlotIndex, device: &DeviceId) -> Result<()>;

    fn send_control(&self, device: &DeviceId, command: &ControlCommand) -> Result<()>;

    fn telemetry(&self, _device: &DeviceId) -> Result<DeviceTelemetry> {
        Ok(DeviceTelemetry::default())
    }
}

/// Per-device frame stream.
pub trait CaptureChannel: Send {
    /// Open and validate the stream. Called once before the first read.
    fn open(&mut self) -> Result<()>;

    /// Read the next frame. `Ok(None)` means the channel had no data.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    fn close(&mut self);
}

/// Devices that participate in binding, in bridge order.
pub fn present_devices(devices: &[(DeviceId, DeviceStatus)]) -> Vec<DeviceId> {
    devices
        .iter()
        .filter(|(_, status)| *status == DeviceStatus::Present)
        .map(|(id, _)| id.clone())
        .collect()
}
