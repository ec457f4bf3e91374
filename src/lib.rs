pub mod commands;
pub mod error;
pub mod events;
pub mod export;
pub mod parsing;
pub mod recording;
pub mod serial;
pub mod settings;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, watch},
};

use commands::{Intent, HELP};
use events::{DashboardEvent, EventBus};
use export::{ExportFormat, FileSink};
use parsing::LineGrammar;
use recording::{RegisterBank, SessionRecorder};
use serial::{
    ConnectionState, ConnectionSupervisor, PortProvider, SerialPortProvider, SimulatedProvider,
    SimulationConfig,
};
use settings::{DashSettings, SettingsStore};

/// Everything the operator's intents act on.
pub struct AppState {
    pub supervisor: ConnectionSupervisor,
    pub recorder: SessionRecorder,
    pub registers: RegisterBank,
    pub events: EventBus,
    pub export_sink: FileSink,
    pub export_format: ExportFormat,
    pub dual_channel: bool,
}

impl AppState {
    pub fn new(settings: &DashSettings, provider: Arc<dyn PortProvider>) -> anyhow::Result<Self> {
        let grammar = LineGrammar::compile().context("Failed to compile line grammar")?;
        let registers = RegisterBank::new();
        let events = EventBus::new();
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Disconnected);

        let recorder = SessionRecorder::new(
            settings.record_layout(),
            settings.sample_interval(),
            registers.clone(),
            connection_rx,
            events.clone(),
        );
        let supervisor = ConnectionSupervisor::new(
            provider,
            grammar,
            settings.supervisor_config(),
            registers.clone(),
            recorder.clone(),
            events.clone(),
            connection_tx,
        );

        Ok(Self {
            supervisor,
            recorder,
            registers,
            events,
            export_sink: FileSink::new(settings.export.directory.clone()),
            export_format: settings.export_format(),
            dual_channel: settings.export.dual_channel,
        })
    }
}

/// Live telemetry console for a serial load-cell / current-sensor rig.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (created on first save)
    #[arg(long, default_value = "sensordash.json")]
    config: PathBuf,

    /// Serial port name; defaults to the first USB serial port
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Use the built-in simulated rig instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Write --port/--baud back to the settings file
    #[arg(long)]
    save: bool,
}

impl Args {
    fn apply(&self, settings: &mut DashSettings) {
        if let Some(port) = &self.port {
            settings.port.name = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            settings.port.baud_rate = baud;
        }
    }
}

fn init_logging() {
    let debug_mode = std::env::var("SENSORDASH_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    env_logger::Builder::new()
        .filter_level(if debug_mode {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    if args.list_ports {
        print_ports();
        return Ok(());
    }

    log::info!("sensordash starting up...");

    let store = SettingsStore::new(args.config.clone())?;
    let settings = if args.save {
        let saved = store.update(|s| args.apply(s))?;
        log::info!("Saved port settings to {}", store.path().display());
        saved
    } else {
        let mut settings = store.current();
        args.apply(&mut settings);
        settings
    };
    log::info!(
        "Using {} at {} baud (settings: {})",
        settings.port.name.as_deref().unwrap_or("first USB port"),
        settings.port.baud_rate,
        store.path().display()
    );

    let provider: Arc<dyn PortProvider> = if args.simulate {
        Arc::new(SimulatedProvider::new(SimulationConfig {
            variant: settings.protocol.variant,
            ..SimulationConfig::default()
        }))
    } else {
        Arc::new(SerialPortProvider::new(
            settings.port.name.clone(),
            settings.port.baud_rate,
        ))
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(async move {
        let state = AppState::new(&settings, provider)?;
        console(state).await
    })
}

fn print_ports() {
    let ports = commands::list_serial_ports();
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
}

async fn console(state: AppState) -> anyhow::Result<()> {
    let printer = tokio::spawn(print_events(state.events.subscribe()));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let intent = match line.parse::<Intent>() {
            Ok(intent) => intent,
            Err(msg) => {
                println!("{msg} (try 'help')");
                continue;
            }
        };
        if intent == Intent::Quit {
            break;
        }
        dispatch(&state, intent).await;
    }

    state.recorder.stop().await;
    state.supervisor.shutdown().await;
    printer.abort();
    log::info!("sensordash stopped");
    Ok(())
}

async fn dispatch(state: &AppState, intent: Intent) {
    let outcome = match intent {
        Intent::Connect => commands::connect(state)
            .await
            .map(|s| format!("connection: {s:?}")),
        Intent::Disconnect => commands::disconnect(state)
            .await
            .map(|_| "disconnected".to_string()),
        Intent::Tare => commands::tare(state).await.map(|_| "tare sent".to_string()),
        Intent::Calibrate => commands::calibrate(state)
            .await
            .map(|_| "calibrate sent".to_string()),
        Intent::ToggleRecording => commands::toggle_recording(state).await.map(|snap| {
            format!(
                "recording: {:?} ({} samples)",
                snap.status, snap.recorded_len
            )
        }),
        Intent::Export(selection) => commands::export_recording(state, selection)
            .await
            .map(|paths| {
                paths
                    .iter()
                    .map(|p| format!("wrote {}", p.display()))
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
        Intent::Status => {
            let report = commands::status(state).await;
            serde_json::to_string_pretty(&report).map_err(|e| e.to_string())
        }
        Intent::Dismiss => Ok(match commands::dismiss_error(state) {
            Some(error) => format!("dismissed: {}", error.message),
            None => "no error to dismiss".to_string(),
        }),
        Intent::Ports => {
            print_ports();
            return;
        }
        Intent::Help | Intent::Quit => Ok(HELP.to_string()),
    };

    match outcome {
        Ok(msg) => println!("{msg}"),
        Err(msg) => println!("error: {msg}"),
    }
}

async fn print_events(mut rx: broadcast::Receiver<DashboardEvent>) {
    loop {
        match rx.recv().await {
            Ok(DashboardEvent::ReadingChanged { change }) => {
                log::debug!("{:?} = {}", change.channel, change.value);
            }
            Ok(DashboardEvent::Sampled { .. }) => {}
            Ok(DashboardEvent::ConnectionChanged { state }) => println!("[link] {state:?}"),
            Ok(DashboardEvent::RecordingStarted { session_id }) => {
                println!("[rec] session {session_id} started")
            }
            Ok(DashboardEvent::RecordingStopped {
                samples, forced, ..
            }) => {
                let why = if forced { " (connection lost)" } else { "" };
                println!("[rec] stopped with {samples} samples{why}");
            }
            Ok(DashboardEvent::ErrorRaised { error }) => {
                println!("[error] {:?}: {}", error.kind, error.message)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("event printer skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
