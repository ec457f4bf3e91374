use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Port open, read loop not yet pulling.
    ConnectedIdle,
    ConnectedReading,
    /// Waiting out the delay before the next acquire attempt.
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedIdle | ConnectionState::ConnectedReading
        )
    }

    /// Only this state lets the sampler record.
    pub fn is_reading(self) -> bool {
        self == ConnectionState::ConnectedReading
    }
}
