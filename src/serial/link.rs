//! Transport boundary between the supervisor and whatever produces bytes.
//!
//! A [`PortProvider`] stands for "request a port": on a desktop that is
//! opening a device node, elsewhere it may need the operator to pick a device
//! again, so every acquire can fail with a connection error.

use async_trait::async_trait;

use crate::error::Result;

/// Result of one read from the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// Recoverable failure; the stream is still usable.
    Transient(String),
    /// The device closed the stream.
    Closed,
    /// Unrecoverable failure.
    Failed(String),
}

#[async_trait]
pub trait ChunkSource: Send {
    /// Waits for the next chunk. May wait indefinitely.
    async fn next_chunk(&mut self) -> ReadOutcome;

    /// Releases the inbound stream.
    async fn release(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CommandSink: Send {
    /// Writes `bytes` without waiting for any reply from the device.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Releases the outbound stream.
    async fn release(&mut self) -> anyhow::Result<()>;
}

/// An opened port, split into its two directions.
pub struct PortLink {
    pub description: String,
    pub reader: Box<dyn ChunkSource>,
    pub writer: Box<dyn CommandSink>,
}

#[async_trait]
pub trait PortProvider: Send + Sync {
    /// Selects and opens a port at the provider's baud rate.
    async fn acquire(&self) -> Result<PortLink>;
}
