use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::AdbConfig;
use crate::event::EventBusConfig;
use crate::service::ServiceOptions;
use crate::slot::{DEFAULT_FPS, SLOT_COUNT};
use crate::worker::TimingConfig;

const DEFAULT_FAILURE_WINDOW_SECS: f64 = 2.0;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 2000;
const DEFAULT_TELEMETRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_ADB_PROGRAM: &str = "adb";
const DEFAULT_LOCAL_PORTS: [u16; SLOT_COUNT] = [4747, 4748];
const DEFAULT_REMOTE_PORT: u16 = 4747;
const DEFAULT_ADB_TIMEOUT_SECS: u64 = 5;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
const DEFAULT_OUTPUT_ROOT: &str = "captures";
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 1000;
const DEFAULT_LIFECYCLE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize, Default)]
struct CamslotConfigFile {
    capture: Option<CaptureConfigFile>,
    reconcile: Option<ReconcileConfigFile>,
    adb: Option<AdbConfigFile>,
    output: Option<OutputConfigFile>,
    events: Option<EventsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    fps: Option<f64>,
    failure_window_secs: Option<f64>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconcileConfigFile {
    interval_ms: Option<u64>,
    /// 0 disables telemetry polling.
    telemetry_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AdbConfigFile {
    path: Option<String>,
    local_ports: Option<Vec<u16>>,
    remote_port: Option<u16>,
    command_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    root: Option<PathBuf>,
    persist_on_start: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    capacity: Option<usize>,
    publish_timeout_ms: Option<u64>,
    lifecycle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CamslotConfig {
    pub capture: CaptureSettings,
    pub reconcile: ReconcileSettings,
    pub adb: AdbConfig,
    pub output: OutputSettings,
    pub events: EventBusConfig,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub fps: f64,
    pub failure_window_secs: f64,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: Duration,
    pub telemetry_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub root: PathBuf,
    pub persist_on_start: bool,
}

impl CamslotConfig {
    /// Load from `CAMSLOT_CONFIG` (if set), then apply `CAMSLOT_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMSLOT_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamslotConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let reconcile = file.reconcile.unwrap_or_default();
        let adb = file.adb.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let events = file.events.unwrap_or_default();

        let telemetry_secs = reconcile
            .telemetry_interval_secs
            .unwrap_or(DEFAULT_TELEMETRY_INTERVAL_SECS);
        Self {
            capture: CaptureSettings {
                fps: capture.fps.unwrap_or(DEFAULT_FPS),
                failure_window_secs: capture
                    .failure_window_secs
                    .unwrap_or(DEFAULT_FAILURE_WINDOW_SECS),
                retry_backoff: Duration::from_millis(
                    capture.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                ),
            },
            reconcile: ReconcileSettings {
                interval: Duration::from_millis(
                    reconcile
                        .interval_ms
                        .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS),
                ),
                telemetry_interval: (telemetry_secs > 0)
                    .then(|| Duration::from_secs(telemetry_secs)),
            },
            adb: AdbConfig {
                program: adb
                    .path
                    .unwrap_or_else(|| DEFAULT_ADB_PROGRAM.to_string()),
                local_ports: adb
                    .local_ports
                    .unwrap_or_else(|| DEFAULT_LOCAL_PORTS.to_vec()),
                remote_port: adb.remote_port.unwrap_or(DEFAULT_REMOTE_PORT),
                command_timeout: Duration::from_secs(
                    adb.command_timeout_secs.unwrap_or(DEFAULT_ADB_TIMEOUT_SECS),
                ),
                read_timeout: Duration::from_secs(
                    adb.read_timeout_secs.unwrap_or(DEFAULT_READ_TIMEOUT_SECS),
                ),
            },
            output: OutputSettings {
                root: output
                    .root
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
                persist_on_start: output.persist_on_start.unwrap_or(false),
            },
            events: EventBusConfig {
                capacity: events.capacity.unwrap_or(DEFAULT_EVENT_CAPACITY),
                publish_timeout: Duration::from_millis(
                    events
                        .publish_timeout_ms
                        .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS),
                ),
                lifecycle_timeout: Duration::from_millis(
                    events
                        .lifecycle_timeout_ms
                        .unwrap_or(DEFAULT_LIFECYCLE_TIMEOUT_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(fps) = std::env::var("CAMSLOT_FPS") {
            self.capture.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMSLOT_FPS must be a number"))?;
        }
        if let Ok(window) = std::env::var("CAMSLOT_FAILURE_WINDOW_SECS") {
            self.capture.failure_window_secs = window
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMSLOT_FAILURE_WINDOW_SECS must be a number of seconds"))?;
        }
        if let Ok(interval) = std::env::var("CAMSLOT_RECONCILE_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("CAMSLOT_RECONCILE_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.reconcile.interval = Duration::from_millis(millis);
        }
        if let Ok(root) = std::env::var("CAMSLOT_OUTPUT_ROOT") {
            if !root.trim().is_empty() {
                self.output.root = PathBuf::from(root);
            }
        }
        if let Ok(path) = std::env::var("CAMSLOT_ADB_PATH") {
            if !path.trim().is_empty() {
                self.adb.program = path;
            }
        }
        if let Ok(ports) = std::env::var("CAMSLOT_LOCAL_PORTS") {
            let parsed = split_csv(&ports)
                .iter()
                .map(|port| port.parse::<u16>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| anyhow!("CAMSLOT_LOCAL_PORTS must be a comma-separated port list"))?;
            if !parsed.is_empty() {
                self.adb.local_ports = parsed;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.capture.fps.is_finite() || self.capture.fps <= 0.0 {
            return Err(anyhow!("capture fps must be greater than zero"));
        }
        if !self.capture.failure_window_secs.is_finite() || self.capture.failure_window_secs <= 0.0
        {
            return Err(anyhow!("failure window must be greater than zero"));
        }
        if self.reconcile.interval.is_zero() {
            return Err(anyhow!("reconcile interval must be greater than zero"));
        }
        if self.adb.local_ports.len() < SLOT_COUNT {
            return Err(anyhow!(
                "adb needs {} local ports, got {}",
                SLOT_COUNT,
                self.adb.local_ports.len()
            ));
        }
        for (idx, port) in self.adb.local_ports.iter().enumerate() {
            if *port == 0 {
                return Err(anyhow!("adb local port must be non-zero"));
            }
            if self.adb.local_ports[..idx].contains(port) {
                return Err(anyhow!("adb local port {} listed twice", port));
            }
        }
        if self.events.capacity == 0 {
            return Err(anyhow!("event capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn timing(&self) -> TimingConfig {
        TimingConfig {
            retry_backoff: self.capture.retry_backoff,
            failure_window_secs: self.capture.failure_window_secs,
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            slots: SLOT_COUNT,
            default_fps: self.capture.fps,
            timing: self.timing(),
            reconcile_interval: self.reconcile.interval,
            telemetry_interval: self.reconcile.telemetry_interval,
            events: self.events.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<CamslotConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
