//! Serial transport over the `serialport` crate.
//!
//! Reads block, so each open port gets a reader on the blocking pool that
//! forwards outcomes through a bounded channel; the async side only awaits
//! that channel.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serialport::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits,
};
use tokio::{sync::mpsc, task::JoinHandle};

use super::link::{ChunkSource, CommandSink, PortLink, PortProvider, ReadOutcome};
use crate::error::{DashError, Result};

/// How long one blocking read waits before re-checking the stop flag.
const READ_POLL: Duration = Duration::from_millis(100);
const READ_BUFFER_LEN: usize = 1024;
const CHUNK_QUEUE_DEPTH: usize = 64;

/// One entry in the port picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub port_name: String,
    pub display: String,
    pub is_usb: bool,
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

/// Ports the OS reports, USB adapters described by manufacturer and product.
pub fn list_ports() -> Vec<PortEntry> {
    describe_ports(serialport::available_ports())
}

/// An enumeration failure is logged and reads as an empty list.
fn describe_ports(found: serialport::Result<Vec<SerialPortInfo>>) -> Vec<PortEntry> {
    let ports = match found {
        Ok(ports) => ports,
        Err(err) => {
            log::warn!("Failed to enumerate serial ports: {}", err);
            Vec::new()
        }
    };

    let mut out: Vec<PortEntry> = ports
        .into_iter()
        .map(|p| {
            let (display, is_usb) = match p.port_type {
                SerialPortType::UsbPort(info) => {
                    let parts: Vec<String> =
                        info.manufacturer.into_iter().chain(info.product).collect();
                    if parts.is_empty() {
                        (format!("{}: USB Serial", p.port_name), true)
                    } else {
                        (format!("{}: {}", p.port_name, parts.join(" ")), true)
                    }
                }
                SerialPortType::BluetoothPort => (format!("{}: Bluetooth", p.port_name), false),
                SerialPortType::PciPort => (format!("{}: PCI", p.port_name), false),
                SerialPortType::Unknown => (p.port_name.clone(), false),
            };
            PortEntry {
                port_name: p.port_name,
                display,
                is_usb,
            }
        })
        .collect();

    out.sort_by(|a, b| a.display.cmp(&b.display));
    out
}

/// Opens a named device node, or the first USB adapter when none is named.
pub struct SerialPortProvider {
    port_name: Option<String>,
    baud_rate: u32,
}

impl SerialPortProvider {
    pub fn new(port_name: Option<String>, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
        }
    }

    fn resolve_port_name(&self) -> Result<String> {
        if let Some(name) = &self.port_name {
            return Ok(name.clone());
        }
        let ports = list_ports();
        ports
            .iter()
            .find(|p| p.is_usb)
            .or_else(|| ports.first())
            .map(|p| p.port_name.clone())
            .ok_or_else(|| DashError::Connection("no serial ports found".into()))
    }
}

#[async_trait]
impl PortProvider for SerialPortProvider {
    async fn acquire(&self) -> Result<PortLink> {
        let name = self.resolve_port_name()?;
        let baud_rate = self.baud_rate;

        let open_name = name.clone();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&open_name, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(READ_POLL)
                .open()
        })
        .await
        .map_err(|e| DashError::Connection(format!("open worker failed: {e}")))?
        .map_err(|e| DashError::Connection(format!("{name}: {e}")))?;

        let write_half = port
            .try_clone()
            .map_err(|e| DashError::Connection(format!("{name}: {e}")))?;

        log::info!("Opened serial port: {} at {} baud", name, baud_rate);

        Ok(PortLink {
            description: format!("{name} @ {baud_rate}"),
            reader: Box::new(SerialChunkSource::spawn(port)),
            writer: Box::new(SerialCommandSink {
                port: Some(Arc::new(Mutex::new(write_half))),
            }),
        })
    }
}

fn classify_read_error(err: &io::Error) -> ReadOutcome {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::InvalidData => {
            ReadOutcome::Transient(err.to_string())
        }
        _ => ReadOutcome::Failed(err.to_string()),
    }
}

struct SerialChunkSource {
    rx: mpsc::Receiver<ReadOutcome>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SerialChunkSource {
    fn spawn(port: Box<dyn SerialPort>) -> Self {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker = tokio::task::spawn_blocking(move || read_worker(port, tx, worker_stop));
        Self {
            rx,
            stop,
            worker: Some(worker),
        }
    }
}

fn read_worker(mut port: Box<dyn SerialPort>, tx: mpsc::Sender<ReadOutcome>, stop: Arc<AtomicBool>) {
    let mut buffer = [0u8; READ_BUFFER_LEN];
    while !stop.load(Ordering::Relaxed) {
        let outcome = match port.read(&mut buffer) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => ReadOutcome::Data(buffer[..n].to_vec()),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                continue;
            }
            Err(e) => classify_read_error(&e),
        };

        let terminal = matches!(outcome, ReadOutcome::Closed | ReadOutcome::Failed(_));
        if tx.blocking_send(outcome).is_err() || terminal {
            break;
        }
    }
    log::debug!("serial reader worker exiting");
}

#[async_trait]
impl ChunkSource for SerialChunkSource {
    async fn next_chunk(&mut self) -> ReadOutcome {
        self.rx.recv().await.unwrap_or(ReadOutcome::Closed)
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.rx.close();
        if let Some(worker) = self.worker.take() {
            worker
                .await
                .context("serial reader worker failed to join")?;
        }
        Ok(())
    }
}

struct SerialCommandSink {
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

#[async_trait]
impl CommandSink for SerialCommandSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.clone().ok_or(DashError::NotConnected)?;
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().unwrap_or_else(PoisonError::into_inner);
            guard.write_all(&bytes)?;
            guard.flush()
        })
        .await
        .map_err(|e| DashError::Command(format!("write worker failed: {e}")))?
        .map_err(|e| DashError::Command(e.to_string()))
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        self.port = None;
        Ok(())
    }
}
