pub mod manager;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Processing,
    Stopped,
    Error,
}

impl ConnectionState {
    /// A run owns the flow: a new `run` is refused.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Processing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Processing => "processing",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Cancelled,
}

/// Everything that can happen to a flow's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Run { run_id: Uuid },
    /// Join a run that is already executing on the backend (recovery).
    Attach { run_id: Uuid },
    Opened,
    Event,
    Completed,
    BackendError(String),
    TransportFailed(String),
    Stop,
}

/// Connection lifecycle of one flow. Pure: callers feed inputs and act on
/// the returned state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connection {
    pub state: ConnectionState,
    pub run_id: Option<Uuid>,
    pub error: Option<String>,
    pub reconnect_suggested: bool,
    pub stop_reason: Option<StopReason>,
}

impl Connection {
    /// Apply one input. Returns the new state, or `None` when the input is
    /// not valid in the current state and was ignored.
    pub fn apply(&mut self, input: Input) -> Option<ConnectionState> {
        use ConnectionState::*;

        let next = match (&input, self.state) {
            (Input::Run { .. }, Idle | Stopped | Error) => Connecting,
            (Input::Attach { .. }, Idle) => Processing,
            (Input::Opened, Connecting) => Connected,
            (Input::Event, Connected | Processing) => Processing,
            (Input::Completed, Processing) => Stopped,
            (Input::BackendError(_), Connected | Processing) => Error,
            (Input::TransportFailed(_), Connecting | Connected | Processing) => Error,
            (Input::Stop, _) => Stopped,
            _ => return None,
        };

        match input {
            Input::Run { run_id } | Input::Attach { run_id } => {
                self.run_id = Some(run_id);
                self.error = None;
                self.reconnect_suggested = false;
                self.stop_reason = None;
            }
            Input::Completed => self.stop_reason = Some(StopReason::Completed),
            Input::BackendError(message) => {
                self.error = Some(message);
                self.reconnect_suggested = false;
            }
            Input::TransportFailed(message) => {
                self.error = Some(message);
                self.reconnect_suggested = true;
            }
            Input::Stop => {
                if self.state != Stopped {
                    self.stop_reason = Some(StopReason::Cancelled);
                }
                self.error = None;
                self.reconnect_suggested = false;
            }
            Input::Opened | Input::Event => {}
        }

        self.state = next;
        Some(next)
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    /// True once the stream is open, including while events are flowing.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Processing
        )
    }

    pub fn is_processing(&self) -> bool {
        self.state == ConnectionState::Processing
    }
}
