//! Synthetic devices (`stub://<name>`).
//!
//! `StubBridge` keeps an in-memory list of devices that can be attached,
//! detached and stalled at runtime. Its channels generate moving gradient
//! frames, so the whole pipeline can run without hardware.

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    BatteryStatus, CaptureChannel, ControlCommand, DeviceBridge, DeviceId, DeviceStatus,
    DeviceTelemetry,
};
use crate::frame::Frame;
use crate::slot::SlotIndex;

pub const STUB_SCHEME: &str = "stub://";

#[derive(Clone, Debug)]
pub struct StubConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
        }
    }
}

struct StubDevice {
    id: DeviceId,
    status: DeviceStatus,
    stalled: Arc<AtomicBool>,
    battery_level: u8,
}

pub struct StubBridge {
    config: StubConfig,
    devices: Mutex<Vec<StubDevice>>,
    refuse_connect: Mutex<HashSet<DeviceId>>,
    enumeration_down: AtomicBool,
    commands: Mutex<Vec<(DeviceId, ControlCommand)>>,
}

impl StubBridge {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            devices: Mutex::new(Vec::new()),
            refuse_connect: Mutex::new(HashSet::new()),
            enumeration_down: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Build a bridge with the given names attached, e.g. `["front", "back"]`.
    pub fn with_devices<'a>(config: StubConfig, names: impl IntoIterator<Item = &'a str>) -> Self {
        let bridge = Self::new(config);
        for name in names {
            bridge.attach(name);
        }
        bridge
    }

    /// Plug in a device. Names get the `stub://` prefix if missing.
    pub fn attach(&self, name: &str) -> DeviceId {
        let id = stub_id(name);
        let mut devices = self.devices.lock();
        if !devices.iter().any(|d| d.id == id) {
            devices.push(StubDevice {
                id: id.clone(),
                status: DeviceStatus::Present,
                stalled: Arc::new(AtomicBool::new(false)),
                battery_level: 100,
            });
        }
        id
    }

    pub fn detach(&self, name: &str) {
        let id = stub_id(name);
        self.devices.lock().retain(|d| d.id != id);
    }

    pub fn set_status(&self, name: &str, status: DeviceStatus) {
        let id = stub_id(name);
        if let Some(device) = self.devices.lock().iter_mut().find(|d| d.id == id) {
            device.status = status;
        }
    }

    /// Make every open channel of this device stop producing frames.
    pub fn set_stalled(&self, name: &str, stalled: bool) {
        let id = stub_id(name);
        if let Some(device) = self.devices.lock().iter().find(|d| d.id == id) {
            device.stalled.store(stalled, Ordering::SeqCst);
        }
    }

    pub fn set_refuse_connect(&self, name: &str, refuse: bool) {
        let id = stub_id(name);
        let mut refused = self.refuse_connect.lock();
        if refuse {
            refused.insert(id);
        } else {
            refused.remove(&id);
        }
    }

    pub fn set_enumeration_down(&self, down: bool) {
        self.enumeration_down.store(down, Ordering::SeqCst);
    }

    /// Control commands received so far, oldest first.
    pub fn commands(&self) -> Vec<(DeviceId, ControlCommand)> {
        self.commands.lock().clone()
    }
}

impl DeviceBridge for StubBridge {
    fn enumerate(&self) -> Result<Vec<(DeviceId, DeviceStatus)>> {
        if self.enumeration_down.load(Ordering::SeqCst) {
            bail!("stub enumeration unavailable");
        }
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|d| (d.id.clone(), d.status))
            .collect())
    }

    fn connect(&self, slot: SlotIndex, device: &DeviceId) -> Result<Box<dyn CaptureChannel>> {
        if self.refuse_connect.lock().contains(device) {
            bail!("stub device {} refused connection", device);
        }
        let devices = self.devices.lock();
        let stub = devices
            .iter()
            .find(|d| &d.id == device)
            .ok_or_else(|| anyhow!("stub device {} not attached", device))?;
        log::info!("{}: connected to {} (synthetic)", slot, device);
        Ok(Box::new(StubChannel::new(
            self.config.clone(),
            stub.stalled.clone(),
        )))
    }

    fn disconnect(&self, slot: SlotIndex, device: &DeviceId) -> Result<()> {
        log::info!("{}: disconnected from {} (synthetic)", slot, device);
        Ok(())
    }

    fn send_control(&self, device: &DeviceId, command: &ControlCommand) -> Result<()> {
        if !self.devices.lock().iter().any(|d| &d.id == device) {
            bail!("stub device {} not attached", device);
        }
        self.commands.lock().push((device.clone(), command.clone()));
        Ok(())
    }

    fn telemetry(&self, device: &DeviceId) -> Result<DeviceTelemetry> {
        let mut devices = self.devices.lock();
        let stub = devices
            .iter_mut()
            .find(|d| &d.id == device)
            .ok_or_else(|| anyhow!("stub device {} not attached", device))?;
        stub.battery_level = stub.battery_level.saturating_sub(1).max(5);
        Ok(DeviceTelemetry {
            battery_level: Some(stub.battery_level),
            battery_status: Some(BatteryStatus::Discharging),
        })
    }
}

/// Channel producing a moving gradient.
pub struct StubChannel {
    config: StubConfig,
    stalled: Arc<AtomicBool>,
    open: bool,
    sequence: u64,
}

impl StubChannel {
    fn new(config: StubConfig, stalled: Arc<AtomicBool>) -> Self {
        Self {
            config,
            stalled,
            open: false,
            sequence: 0,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let (width, height) = (self.config.width as usize, self.config.height as usize);
        let shift = self.sequence as usize;
        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                pixels.push(((x + shift) % 256) as u8);
                pixels.push(((y + shift) % 256) as u8);
                pixels.push((shift % 256) as u8);
            }
        }
        pixels
    }
}

impl CaptureChannel for StubChannel {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            bail!("stub channel not open");
        }
        if self.stalled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.sequence += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(pixels, self.config.width, self.config.height, self.sequence).map(Some)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

fn stub_id(name: &str) -> DeviceId {
    if name.starts_with(STUB_SCHEME) {
        DeviceId::new(name)
    } else {
        DeviceId::new(format!("{}{}", STUB_SCHEME, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> StubConfig {
        StubConfig {
            width: 4,
            height: 2,
        }
    }

    #[test]
    fn attached_devices_enumerate_in_order() -> Result<()> {
        let bridge = StubBridge::with_devices(small(), ["front", "back"]);
        bridge.attach("front");
        let ids: Vec<_> = bridge.enumerate()?.into_iter().map(|(id, _)| id).collect();
        assert_eq!(
            ids,
            vec![DeviceId::new("stub://front"), DeviceId::new("stub://back")]
        );

        bridge.detach("stub://front");
        assert_eq!(bridge.enumerate()?.len(), 1);
        Ok(())
    }

    #[test]
    fn channel_produces_frames_until_stalled() -> Result<()> {
        let bridge = StubBridge::with_devices(small(), ["front"]);
        let mut channel = bridge.connect(SlotIndex(0), &DeviceId::new("stub://front"))?;
        assert!(channel.read_frame().is_err(), "reads require open()");

        channel.open()?;
        let frame = channel.read_frame()?.expect("frame");
        assert_eq!((frame.width, frame.height, frame.sequence), (4, 2, 1));

        bridge.set_stalled("front", true);
        assert!(channel.read_frame()?.is_none());

        bridge.set_stalled("front", false);
        assert_eq!(channel.read_frame()?.expect("frame").sequence, 2);
        Ok(())
    }

    #[test]
    fn refused_and_unknown_devices_fail_to_connect() {
        let bridge = StubBridge::with_devices(small(), ["front"]);
        bridge.set_refuse_connect("front", true);
        assert!(bridge
            .connect(SlotIndex(0), &DeviceId::new("stub://front"))
            .is_err());
        assert!(bridge
            .connect(SlotIndex(0), &DeviceId::new("stub://missing"))
            .is_err());
    }

    #[test]
    fn enumeration_outage_is_an_error() {
        let bridge = StubBridge::with_devices(small(), ["front"]);
        bridge.set_enumeration_down(true);
        assert!(bridge.enumerate().is_err());
    }

    #[test]
    fn control_commands_are_recorded() -> Result<()> {
        let bridge = StubBridge::with_devices(small(), ["front"]);
        let id = DeviceId::new("stub://front");
        bridge.send_control(&id, &ControlCommand::Tap { x: 10, y: 20 })?;
        assert_eq!(
            bridge.commands(),
            vec![(id, ControlCommand::Tap { x: 10, y: 20 })]
        );
        Ok(())
    }
}
