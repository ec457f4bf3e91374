//! Operator intents: what the control panel buttons do.
//!
//! Every function here surfaces failures through the event bus's error slot
//! and hands the message back to the caller.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::Utc;
use serde::Serialize;

use crate::error::DashError;
use crate::events::UserError;
use crate::export::{self, ExportSelection};
use crate::recording::{
    summarize_primary, summarize_secondary, ChannelSummary, RecorderSnapshot, Registers,
};
use crate::serial::{list_ports, ConnectionState, PortEntry};
use crate::AppState;

/// Single-byte commands understood by the rig firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceCommand {
    Tare,
    Calibrate,
}

impl DeviceCommand {
    pub fn byte(self) -> u8 {
        match self {
            DeviceCommand::Tare => b't',
            DeviceCommand::Calibrate => b'c',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b't' => Some(DeviceCommand::Tare),
            b'c' => Some(DeviceCommand::Calibrate),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Tare => write!(f, "tare"),
            DeviceCommand::Calibrate => write!(f, "calibrate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Connect,
    Disconnect,
    Tare,
    Calibrate,
    ToggleRecording,
    /// `None` exports every channel the session tracks.
    Export(Option<ExportSelection>),
    Status,
    Dismiss,
    Ports,
    Help,
    Quit,
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut words = input.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        let intent = match verb.as_str() {
            "connect" | "c" => Intent::Connect,
            "disconnect" => Intent::Disconnect,
            "tare" => Intent::Tare,
            "calibrate" | "cal" => Intent::Calibrate,
            "record" | "r" => Intent::ToggleRecording,
            "export" | "e" => match words.next() {
                None => Intent::Export(None),
                Some(word) => Intent::Export(Some(
                    ExportSelection::parse(word)
                        .ok_or_else(|| format!("unknown export channel '{word}'"))?,
                )),
            },
            "status" | "s" => Intent::Status,
            "dismiss" => Intent::Dismiss,
            "ports" => Intent::Ports,
            "help" | "?" => Intent::Help,
            "quit" | "exit" | "q" => Intent::Quit,
            "" => return Err("empty command".into()),
            other => return Err(format!("unknown command '{other}'")),
        };
        Ok(intent)
    }
}

pub const HELP: &str = "\
commands:
  connect                      open the serial port and start reading
  disconnect                   close the port
  tare | calibrate             send a command to the rig (not while recording)
  record                       start or stop a recording session
  export [force|pressure|both] write the last session to CSV
  status                       show readings, session and link state
  dismiss                      clear the last reported error
  ports                        list serial ports
  quit";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connection: ConnectionState,
    pub link: Option<String>,
    pub registers: Registers,
    pub recording: RecorderSnapshot,
    pub sample_interval_ms: u64,
    pub primary: ChannelSummary,
    pub secondary: ChannelSummary,
    pub latest_error: Option<UserError>,
}

fn surface(state: &AppState, err: DashError) -> String {
    state.events.report_error(&err);
    err.to_string()
}

pub async fn connect(state: &AppState) -> Result<ConnectionState, String> {
    state
        .supervisor
        .connect()
        .await
        .map_err(|e| surface(state, e))?;
    Ok(state.supervisor.state())
}

pub async fn disconnect(state: &AppState) -> Result<(), String> {
    state.supervisor.shutdown().await;
    Ok(())
}

pub async fn tare(state: &AppState) -> Result<(), String> {
    send_device_command(state, DeviceCommand::Tare).await
}

pub async fn calibrate(state: &AppState) -> Result<(), String> {
    send_device_command(state, DeviceCommand::Calibrate).await
}

async fn send_device_command(state: &AppState, command: DeviceCommand) -> Result<(), String> {
    if state.recorder.is_recording().await {
        return Err(surface(
            state,
            DashError::Command(format!("cannot {command} while recording")),
        ));
    }
    state
        .supervisor
        .send_command(command)
        .await
        .map_err(|e| surface(state, e))
}

pub async fn toggle_recording(state: &AppState) -> Result<RecorderSnapshot, String> {
    Ok(state.recorder.toggle().await)
}

/// Writes the recorded buffer and returns the files created.
pub async fn export_recording(
    state: &AppState,
    selection: Option<ExportSelection>,
) -> Result<Vec<PathBuf>, String> {
    let selection = selection.unwrap_or(if state.dual_channel {
        ExportSelection::Both
    } else {
        ExportSelection::Force
    });

    let records = state.recorder.recorded().await;
    let documents = export::encode(&records, selection, state.export_format, Utc::now())
        .map_err(|e| surface(state, e))?;

    let mut written = Vec::with_capacity(documents.len());
    for document in &documents {
        let path = state.export_sink.write(document).await.map_err(|e| {
            surface(
                state,
                DashError::Export(format!("Failed to export data: {e:#}")),
            )
        })?;
        log::info!("Exported {} rows to {}", records.len(), path.display());
        written.push(path);
    }
    Ok(written)
}

pub async fn status(state: &AppState) -> StatusReport {
    let records = state.recorder.recorded().await;
    StatusReport {
        connection: state.supervisor.state(),
        link: state.supervisor.link_description().await,
        registers: state.registers.snapshot(),
        recording: state.recorder.snapshot().await,
        sample_interval_ms: state.recorder.tick_interval().as_millis() as u64,
        primary: summarize_primary(&records),
        secondary: summarize_secondary(&records),
        latest_error: state.events.latest_error(),
    }
}

/// Clears the error slot; `None` when nothing was pending.
pub fn dismiss_error(state: &AppState) -> Option<UserError> {
    state.events.clear_error()
}

pub fn list_serial_ports() -> Vec<PortEntry> {
    list_ports()
}
