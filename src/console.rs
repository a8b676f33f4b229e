//! Operator commands.
//!
//! `camslotd` reads one command per line from stdin:
//!
//! ```text
//! fps <n>                 frame rate for every slot
//! fps <cam> <n>           frame rate for one slot
//! rec on|off              start or stop saving frames on every slot
//! torch <cam>             flash the torch
//! tap <cam> <x>,<y>       tap the device screen
//! start <cam> <component> launch an activity
//! status | help | quit
//! ```
//!
//! `<cam>` is the one-based camera number, with or without the `cam` prefix.

use anyhow::{anyhow, bail, Context, Result};
use std::io::BufRead;

use crate::bridge::ControlCommand;
use crate::service::CaptureService;
use crate::slot::SlotIndex;

pub const HELP: &str = "commands: fps [cam] <n> | rec on|off | torch <cam> | \
                        tap <cam> <x>,<y> | start <cam> <component> | status | help | quit";

#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleCommand {
    /// `slot: None` applies to every slot.
    Fps { slot: Option<SlotIndex>, fps: f64 },
    Record(bool),
    Control {
        slot: SlotIndex,
        command: ControlCommand,
    },
    Status,
    Help,
    Quit,
}

/// Device actions run when recording starts, like pressing record on the
/// phones themselves.
#[derive(Clone, Debug, Default)]
pub struct RecordingActions {
    /// Activity launched on every bound device.
    pub start_activity: Option<String>,
    /// Screen tap per slot, indexed by slot.
    pub taps: Vec<Option<(u32, u32)>>,
}

impl RecordingActions {
    fn commands_for(&self, slot: SlotIndex) -> Vec<ControlCommand> {
        let mut commands = Vec::new();
        if let Some(component) = &self.start_activity {
            commands.push(ControlCommand::StartActivity {
                component: component.clone(),
            });
        }
        if let Some(Some((x, y))) = self.taps.get(slot.index()) {
            commands.push(ControlCommand::Tap { x: *x, y: *y });
        }
        commands
    }
}

/// Parse one input line. `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("fps", [fps]) => ConsoleCommand::Fps {
            slot: None,
            fps: parse_fps(fps)?,
        },
        ("fps", [cam, fps]) => ConsoleCommand::Fps {
            slot: Some(parse_cam(cam)?),
            fps: parse_fps(fps)?,
        },
        ("rec", ["on"]) => ConsoleCommand::Record(true),
        ("rec", ["off"]) => ConsoleCommand::Record(false),
        ("torch", [cam]) => ConsoleCommand::Control {
            slot: parse_cam(cam)?,
            command: ControlCommand::ToggleTorch,
        },
        ("tap", [cam, point]) => {
            let (x, y) = parse_point(point)?;
            ConsoleCommand::Control {
                slot: parse_cam(cam)?,
                command: ControlCommand::Tap { x, y },
            }
        }
        ("start", [cam, component]) => ConsoleCommand::Control {
            slot: parse_cam(cam)?,
            command: ControlCommand::StartActivity {
                component: component.to_string(),
            },
        },
        ("status", []) => ConsoleCommand::Status,
        ("help", []) => ConsoleCommand::Help,
        ("quit", []) | ("exit", []) => ConsoleCommand::Quit,
        _ => bail!("unrecognized command '{}'; {}", line.trim(), HELP),
    };
    Ok(Some(command))
}

/// `<cam>` as typed by an operator: `1`, `cam2`.
pub fn parse_cam(value: &str) -> Result<SlotIndex> {
    let digits = value
        .trim()
        .strip_prefix("cam")
        .unwrap_or_else(|| value.trim());
    let number: usize = digits
        .parse()
        .with_context(|| format!("invalid camera '{}'", value))?;
    if number == 0 {
        bail!("camera numbers start at 1");
    }
    Ok(SlotIndex(number - 1))
}

/// Screen coordinates as `x,y`.
pub fn parse_point(value: &str) -> Result<(u32, u32)> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| anyhow!("tap coordinates must look like x,y, got '{}'", value))?;
    let x = x
        .trim()
        .parse()
        .with_context(|| format!("invalid x in '{}'", value))?;
    let y = y
        .trim()
        .parse()
        .with_context(|| format!("invalid y in '{}'", value))?;
    Ok((x, y))
}

fn parse_fps(value: &str) -> Result<f64> {
    let fps: f64 = value
        .parse()
        .with_context(|| format!("invalid frame rate '{}'", value))?;
    if !fps.is_finite() || fps <= 0.0 {
        bail!("frame rate must be greater than zero");
    }
    Ok(fps)
}

/// Run a parsed command against the service. `Quit` is the caller's business.
pub fn execute(
    service: &CaptureService,
    actions: &RecordingActions,
    command: &ConsoleCommand,
) -> Result<()> {
    match command {
        ConsoleCommand::Fps { slot: Some(slot), fps } => service.set_desired_fps(*slot, *fps),
        ConsoleCommand::Fps { slot: None, fps } => {
            for slot in SlotIndex::all(service.assignment().slot_count()) {
                service.set_desired_fps(slot, *fps)?;
            }
            Ok(())
        }
        ConsoleCommand::Record(enabled) => {
            service.set_persist_all(*enabled);
            if *enabled {
                run_recording_actions(service, actions);
            }
            Ok(())
        }
        ConsoleCommand::Control { slot, command } => service.send_control(*slot, command),
        ConsoleCommand::Status => {
            log_status(service);
            Ok(())
        }
        ConsoleCommand::Help => {
            log::info!("{}", HELP);
            Ok(())
        }
        ConsoleCommand::Quit => Ok(()),
    }
}

// A device that rejects a command does not stop recording on the others.
fn run_recording_actions(service: &CaptureService, actions: &RecordingActions) {
    for snapshot in service.snapshot() {
        if !snapshot.occupied() {
            continue;
        }
        for command in actions.commands_for(snapshot.slot) {
            match service.send_control(snapshot.slot, &command) {
                Ok(()) => log::info!("{}: sent {:?}", snapshot.slot, command),
                Err(err) => log::warn!("{:#}", err),
            }
        }
    }
}

pub fn log_status(service: &CaptureService) {
    for slot in service.snapshot() {
        match (&slot.device, &slot.worker) {
            (Some(device), Some(worker)) => log::info!(
                "{}: {} {:?}, {} frames, {} fps{}",
                slot.slot,
                device,
                worker.state,
                worker.frames_captured,
                slot.config.desired_fps,
                if slot.config.persist_enabled {
                    ", recording"
                } else {
                    ""
                }
            ),
            _ => log::info!("{}: free", slot.slot),
        }
    }
}

/// Parse `reader` line by line and pass each command to `handle` until it
/// returns false or input ends. Bad lines are logged and skipped.
pub fn read_commands<R: BufRead>(
    reader: R,
    mut handle: impl FnMut(ConsoleCommand) -> bool,
) -> Result<()> {
    for line in reader.lines() {
        let line = line.context("failed to read command input")?;
        match parse_command(&line) {
            Ok(Some(command)) => {
                if !handle(command) {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("{:#}", err),
        }
    }
    Ok(())
}
