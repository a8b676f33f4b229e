//! camslotd - capture daemon for camslot
//!
//! This daemon:
//! 1. Loads configuration (file, environment, flags)
//! 2. Reconciles adb (or synthetic) devices into capture slots
//! 3. Logs every event and, when recording, saves frames as PNG files
//! 4. Takes operator commands on stdin (`help` lists them)
//! 5. Shuts down in order on Ctrl-C or `quit`

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camslot::console::{self, ConsoleCommand, RecordingActions};
use camslot::{
    AdbBridge, CamslotConfig, CaptureService, DeviceBridge, DisplayConsumer, EncodedFrame, Event,
    EventSubscription, FrameStore, SinkConsumers, SlotIndex, StubBridge, StubConfig, SLOT_COUNT,
};

const DISPLAY_LOG_EVERY: u64 = 100;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML when it ends in .toml).
    #[arg(long, env = "CAMSLOT_CONFIG")]
    config: Option<PathBuf>,
    /// Use synthetic devices with these names instead of adb.
    #[arg(long, value_delimiter = ',')]
    stub: Vec<String>,
    /// Save every captured frame from the start.
    #[arg(long)]
    record: bool,
    /// Initial frame rate for every slot.
    #[arg(long)]
    fps: Option<f64>,
    /// Seconds between slot status lines (0 disables them).
    #[arg(long, default_value_t = 10)]
    status_secs: u64,
    /// Activity to launch on each phone when recording starts.
    #[arg(long)]
    start_activity: Option<String>,
    /// Screen tap (x,y) on cam1 when recording starts.
    #[arg(long)]
    tap1: Option<String>,
    /// Screen tap (x,y) on cam2 when recording starts.
    #[arg(long)]
    tap2: Option<String>,
    /// Ignore stdin commands.
    #[arg(long)]
    no_console: bool,
}

enum Signal {
    Shutdown,
    Command(ConsoleCommand),
}

/// Stands in for the live view: counts frames and logs now and then.
#[derive(Default)]
struct LogDisplay {
    shown: [AtomicU64; SLOT_COUNT],
}

impl DisplayConsumer for LogDisplay {
    fn present(&self, slot: SlotIndex, frame: &EncodedFrame) -> Result<()> {
        let counter = self
            .shown
            .get(slot.index())
            .ok_or_else(|| anyhow!("no display for {}", slot))?;
        let shown = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if shown % DISPLAY_LOG_EVERY == 0 {
            log::info!(
                "{}: displayed {} frames (latest {}x{}, {} bytes png)",
                slot,
                shown,
                frame.width,
                frame.height,
                frame.png_bytes().len()
            );
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let actions = RecordingActions {
        start_activity: args.start_activity.clone(),
        taps: [&args.tap1, &args.tap2]
            .into_iter()
            .map(|tap| tap.as_deref().map(console::parse_point).transpose())
            .collect::<Result<_>>()?,
    };

    let mut config = CamslotConfig::load_from(args.config.as_deref())?;
    if let Some(fps) = args.fps {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        config.capture.fps = fps;
    }

    let bridge: Arc<dyn DeviceBridge> = if args.stub.is_empty() {
        log::info!("using adb at {}", config.adb.program);
        Arc::new(AdbBridge::new(config.adb.clone()))
    } else {
        log::info!("using synthetic devices: {}", args.stub.join(", "));
        Arc::new(StubBridge::with_devices(
            StubConfig::default(),
            args.stub.iter().map(String::as_str),
        ))
    };

    let consumers = SinkConsumers {
        display: Some(Arc::new(LogDisplay::default())),
        persistence: Some(Arc::new(FrameStore::new())),
    };
    let mut service = CaptureService::new(bridge, config.service_options(), consumers)?;

    let session = session_dir(&config.output.root);
    let record = args.record || config.output.persist_on_start;
    for slot in SlotIndex::all(SLOT_COUNT) {
        service.set_persist_target(slot, Some(session.join(slot.to_string())))?;
        service.set_persist_enabled(slot, record)?;
    }
    if record {
        log::info!("recording frames under {}", session.display());
    }

    let events = service.subscribe();
    let event_log = std::thread::Builder::new()
        .name("camslot-events".to_string())
        .spawn(move || log_events(events))
        .context("spawn event log thread")?;

    service.start()?;
    log::info!("camslotd running with {} slots", SLOT_COUNT);

    if record {
        console::execute(&service, &actions, &ConsoleCommand::Record(true))?;
    }

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Signal::Shutdown);
    })
    .context("set Ctrl-C handler")?;

    if !args.no_console {
        // Detached: a blocked stdin read must not hold up shutdown.
        std::thread::Builder::new()
            .name("camslot-console".to_string())
            .spawn(move || {
                let result = console::read_commands(io::stdin().lock(), |command| {
                    let quit = command == ConsoleCommand::Quit;
                    let signal = if quit {
                        Signal::Shutdown
                    } else {
                        Signal::Command(command)
                    };
                    tx.send(signal).is_ok() && !quit
                });
                if let Err(err) = result {
                    log::warn!("console stopped: {:#}", err);
                }
            })
            .context("spawn console thread")?;
        log::info!("{}", console::HELP);
    } else {
        drop(tx);
    }

    log::info!("camslotd waiting for shutdown signal (Ctrl-C)...");
    let status_every = Duration::from_secs(args.status_secs);
    loop {
        let signal = if status_every.is_zero() {
            rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(status_every)
        };
        match signal {
            Ok(Signal::Command(command)) => {
                if let Err(err) = console::execute(&service, &actions, &command) {
                    log::warn!("{:#}", err);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => console::log_status(&service),
            Ok(Signal::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received, stopping capture...");
    let stats = service.shutdown()?;
    if event_log.join().is_err() {
        log::error!("event log thread panicked");
    }
    log::info!(
        "camslotd stopped: {} frames dispatched, {} saved, {} save failures",
        stats.dispatched,
        stats.saved,
        stats.save_failed
    );
    Ok(())
}

fn session_dir(root: &std::path::Path) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    root.join(format!("session_{}", stamp))
}

fn log_events(events: EventSubscription) {
    while let Some(event) = events.recv() {
        match &event {
            Event::FrameProduced { .. } => log::trace!("{}", event),
            Event::CaptureError { .. } => log::warn!("{}", event),
            _ => log::info!("{}", event),
        }
    }
}
