//! Dashboard notifications and the single latest-error slot.
//!
//! Display code subscribes here instead of polling: register changes, link
//! state, session boundaries and samples all arrive as [`DashboardEvent`]s.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::error::{DashError, ErrorKind};
use crate::recording::registers::RegisterChange;
use crate::recording::state::ReadingRecord;
use crate::serial::state::ConnectionState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DashboardEvent {
    ReadingChanged { change: RegisterChange },
    ConnectionChanged { state: ConnectionState },
    RecordingStarted { session_id: String },
    RecordingStopped { session_id: String, samples: usize, forced: bool },
    Sampled { record: ReadingRecord },
    ErrorRaised { error: UserError },
}

/// What the operator sees. A new error replaces the previous one.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserError {
    pub kind: ErrorKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl From<&DashError> for UserError {
    fn from(err: &DashError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            raised_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<DashboardEvent>,
    latest_error: watch::Sender<Option<UserError>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (latest_error, _) = watch::channel(None);
        Self {
            events,
            latest_error,
        }
    }

    /// Fire and forget; having no subscribers is not an error.
    pub fn emit(&self, event: DashboardEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    /// Overwrites the error slot and announces the new error.
    pub fn report_error(&self, err: &DashError) {
        let error = UserError::from(err);
        self.latest_error.send_replace(Some(error.clone()));
        self.emit(DashboardEvent::ErrorRaised { error });
    }

    pub fn latest_error(&self) -> Option<UserError> {
        self.latest_error.borrow().clone()
    }

    /// Empties the error slot, returning what it held.
    pub fn clear_error(&self) -> Option<UserError> {
        self.latest_error.send_replace(None)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_error_overwrites() {
        let bus = EventBus::new();
        assert!(bus.latest_error().is_none());

        bus.report_error(&DashError::Connection("no port".into()));
        bus.report_error(&DashError::Export("No data available to export".into()));

        let latest = bus.latest_error().unwrap();
        assert_eq!(latest.kind, ErrorKind::Export);
        assert_eq!(latest.message, "No data available to export");

        assert_eq!(bus.clear_error(), Some(latest));
        assert!(bus.latest_error().is_none());
        assert_eq!(bus.clear_error(), None);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(DashboardEvent::ConnectionChanged {
            state: ConnectionState::Connecting,
        });
        match rx.recv().await.unwrap() {
            DashboardEvent::ConnectionChanged { state } => {
                assert_eq!(state, ConnectionState::Connecting)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
