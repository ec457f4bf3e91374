pub mod controller;
pub mod registers;
pub mod state;
pub mod stats;

pub use controller::SessionRecorder;
pub use registers::{Channel, RegisterBank, RegisterChange, Registers};
pub use state::{ReadingRecord, RecordLayout, RecorderSnapshot, RecorderStatus, StopReason};
pub use stats::{format_elapsed, summarize_primary, summarize_secondary, ChannelSummary, SessionStats};
