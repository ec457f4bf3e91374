//! Error taxonomy for the telemetry pipeline.
//!
//! Malformed lines and unparseable fields are not errors: the extractor drops
//! them and nothing here represents that case.

use serde::Serialize;

pub type Result<T> = std::result::Result<T, DashError>;

#[derive(Debug, thiserror::Error)]
pub enum DashError {
    /// Port could not be selected or opened. Surfaced, not retried.
    #[error("Failed to connect: {0}")]
    Connection(String),

    /// Recoverable read failure (framing, interrupted read). Retried in place.
    #[error("Transient read error: {0}")]
    TransientRead(String),

    /// Stream closed, device unplugged or retry budget exhausted.
    #[error("Read error: {0}")]
    FatalRead(String),

    /// Writing a command byte failed.
    #[error("Command failed: {0}")]
    Command(String),

    /// A command was issued with no open port.
    #[error("Command failed: port is not connected")]
    NotConnected,

    /// Export requested with nothing recorded, or the encoder failed.
    #[error("{0}")]
    Export(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl DashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DashError::Connection(_) => ErrorKind::Connection,
            DashError::TransientRead(_) => ErrorKind::TransientRead,
            DashError::FatalRead(_) => ErrorKind::FatalRead,
            DashError::Command(_) | DashError::NotConnected => ErrorKind::Command,
            DashError::Export(_) | DashError::Csv(_) => ErrorKind::Export,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Connection,
    TransientRead,
    FatalRead,
    Command,
    Export,
}
