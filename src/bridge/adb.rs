//! ADB device bridge.
//!
//! Android phones running a webcam app are reached over USB:
//! - `adb devices` lists serials and their state
//! - `adb -s <serial> forward tcp:<local> tcp:<remote>` exposes the phone's
//!   stream on a fixed local port per slot
//! - the stream itself is read as MJPEG from `http://127.0.0.1:<local>/video`
//!
//! Every adb invocation is bounded by `command_timeout`; a hung adb server
//! shows up as a command error instead of a stalled reconciler.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::mjpeg::{MjpegChannel, MjpegConfig};
use super::{
    BatteryStatus, CaptureChannel, ControlCommand, DeviceBridge, DeviceId, DeviceStatus,
    DeviceTelemetry,
};
use crate::slot::SlotIndex;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const TORCH_PULSE: Duration = Duration::from_millis(100);

/// Configuration for the adb bridge.
#[derive(Clone, Debug)]
pub struct AdbConfig {
    /// adb executable (looked up on PATH when not absolute).
    pub program: String,
    /// Local TCP port per slot, indexed by slot.
    pub local_ports: Vec<u16>,
    /// Port the webcam app listens on inside the phone.
    pub remote_port: u16,
    /// Upper bound for one adb invocation.
    pub command_timeout: Duration,
    /// Upper bound for one frame read on the forwarded stream.
    pub read_timeout: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            program: "adb".to_string(),
            local_ports: vec![4747, 4748],
            remote_port: 4747,
            command_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Captured result of one adb run.
#[derive(Clone, Debug)]
pub struct AdbOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

pub struct AdbBridge {
    config: AdbConfig,
}

impl AdbBridge {
    pub fn new(config: AdbConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdbConfig {
        &self.config
    }

    fn local_port(&self, slot: SlotIndex) -> Result<u16> {
        self.config
            .local_ports
            .get(slot.index())
            .copied()
            .ok_or_else(|| anyhow!("no local port configured for {}", slot))
    }

    /// Run adb with `args`, killing it after `command_timeout`.
    ///
    /// Both pipes are drained on their own threads while the child runs, so
    /// large output never stalls it.
    pub fn run(&self, args: &[&str]) -> Result<AdbOutput> {
        let mut child = Command::new(&self.config.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {} {}", self.config.program, args.join(" ")))?;

        let pipes = drain_pipe(child.stdout.take(), "adb-stdout")
            .and_then(|stdout| Ok((stdout, drain_pipe(child.stderr.take(), "adb-stderr")?)));
        let (stdout, stderr) = match pipes {
            Ok(pipes) => pipes,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        let deadline = Instant::now() + self.config.command_timeout;
        let status = loop {
            if let Some(status) = child.try_wait().context("wait for adb")? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "adb {} timed out after {:?}",
                    args.join(" "),
                    self.config.command_timeout
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        Ok(AdbOutput {
            stdout: collect_pipe(&stdout, deadline).context("read adb stdout")?,
            stderr: collect_pipe(&stderr, deadline).context("read adb stderr")?,
            success: status.success(),
        })
    }

    fn run_checked(&self, args: &[&str]) -> Result<AdbOutput> {
        let output = self.run(args)?;
        if !output.success {
            bail!("adb {} failed: {}", args.join(" "), output.stderr.trim());
        }
        Ok(output)
    }

    fn shell(&self, device: &DeviceId, command: &[&str]) -> Result<AdbOutput> {
        let mut args = vec!["-s", device.as_str(), "shell"];
        args.extend_from_slice(command);
        self.run_checked(&args)
    }
}

impl DeviceBridge for AdbBridge {
    fn enumerate(&self) -> Result<Vec<(DeviceId, DeviceStatus)>> {
        let output = self.run_checked(&["devices"])?;
        Ok(parse_devices(&output.stdout))
    }

    fn connect(&self, slot: SlotIndex, device: &DeviceId) -> Result<Box<dyn CaptureChannel>> {
        let local_port = self.local_port(slot)?;
        let local = format!("tcp:{}", local_port);
        let remote = format!("tcp:{}", self.config.remote_port);
        self.run_checked(&["-s", device.as_str(), "forward", &local, &remote])
            .with_context(|| format!("forward {} for {}", local, device))?;
        log::info!(
            "{}: forwarded local {} to {} on {}",
            slot,
            local_port,
            self.config.remote_port,
            device
        );

        let channel = MjpegChannel::new(MjpegConfig {
            url: format!("http://127.0.0.1:{}/video", local_port),
            read_timeout: self.config.read_timeout,
        })?;
        Ok(Box::new(channel))
    }

    fn disconnect(&self, slot: SlotIndex, device: &DeviceId) -> Result<()> {
        let local = format!("tcp:{}", self.local_port(slot)?);
        self.run_checked(&["-s", device.as_str(), "forward", "--remove", &local])
            .with_context(|| format!("remove forward {} for {}", local, device))?;
        Ok(())
    }

    fn send_control(&self, device: &DeviceId, command: &ControlCommand) -> Result<()> {
        match command {
            ControlCommand::ToggleTorch => {
                self.shell(device, &["settings", "put", "system", "torch_enabled", "1"])?;
                std::thread::sleep(TORCH_PULSE);
                self.shell(device, &["settings", "put", "system", "torch_enabled", "0"])?;
            }
            ControlCommand::StartActivity { component } => {
                self.shell(device, &["am", "start", "-n", component])?;
            }
            ControlCommand::Tap { x, y } => {
                let (x, y) = (x.to_string(), y.to_string());
                self.shell(device, &["input", "tap", &x, &y])?;
            }
        }
        Ok(())
    }

    fn telemetry(&self, device: &DeviceId) -> Result<DeviceTelemetry> {
        let output = self.shell(device, &["dumpsys", "battery"])?;
        if output.stdout.trim().is_empty() {
            bail!("empty battery report from {}", device);
        }
        Ok(parse_battery(&output.stdout))
    }
}

type PipeOutput = Receiver<std::io::Result<Vec<u8>>>;

/// Read `pipe` to the end on a background thread.
fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>, name: &str) -> Result<PipeOutput> {
    let (tx, rx) = bounded(1);
    match pipe {
        Some(mut pipe) => {
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let mut bytes = Vec::new();
                    let result = pipe.read_to_end(&mut bytes).map(|_| bytes);
                    let _ = tx.send(result);
                })
                .with_context(|| format!("spawn {} reader", name))?;
        }
        None => {
            let _ = tx.send(Ok(Vec::new()));
        }
    }
    Ok(rx)
}

/// Wait for a drained pipe. A pipe still held open by a leftover process
/// counts against the same deadline as the command.
fn collect_pipe(output: &PipeOutput, deadline: Instant) -> Result<String> {
    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(POLL_INTERVAL);
    match output.recv_timeout(wait) {
        Ok(result) => {
            let bytes = result?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        Err(RecvTimeoutError::Timeout) => bail!("output still open after the command exited"),
        Err(RecvTimeoutError::Disconnected) => bail!("output reader exited early"),
    }
}

/// Parse `adb devices` output. The first line is a header.
pub fn parse_devices(stdout: &str) -> Vec<(DeviceId, DeviceStatus)> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let status = match parts.next()? {
                "device" => DeviceStatus::Present,
                "unauthorized" => DeviceStatus::Unauthorized,
                "offline" => DeviceStatus::Offline,
                _ => return None,
            };
            Some((DeviceId::new(serial), status))
        })
        .collect()
}

/// Parse the `level:` and `status:` lines of `dumpsys battery`.
pub fn parse_battery(stdout: &str) -> DeviceTelemetry {
    let mut info = DeviceTelemetry::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("level:") {
            info.battery_level = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("status:") {
            info.battery_status = value.trim().parse().ok().map(BatteryStatus::from_code);
        }
    }
    info
}
