//! Finite state machine of one physical session to a node

use serde::{Deserialize, Serialize};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Never connected
    Pending,

    /// Connection attempt in progress
    Connecting,

    /// Connected and idle
    Ready,

    /// A command or file operation is running
    Executing,

    /// Disconnected, either after a failure or on purpose
    Closed,
}

/// Session event
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Start a connection attempt
    Connect,

    /// Connection established
    Connected,

    /// Connection attempt failed
    ConnectFailed(String),

    /// Operation started
    Execute,

    /// Operation finished
    Executed,

    /// Session ended
    Closed,
}

/// Session FSM
#[derive(Debug, Clone)]
pub struct SessionFsm {
    state: SessionState,
    error: Option<String>,
    failures: u32,
}

impl SessionFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: SessionState::Pending,
            error: None,
            failures: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last connection error, cleared once connected
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Consecutive failed connection attempts
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: SessionEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (SessionState::Pending | SessionState::Closed, SessionEvent::Connect) => {
                SessionState::Connecting
            }

            // From Connecting
            (SessionState::Connecting, SessionEvent::Connected) => {
                self.error = None;
                self.failures = 0;
                SessionState::Ready
            }
            (SessionState::Connecting, SessionEvent::ConnectFailed(err)) => {
                self.error = Some(err.clone());
                self.failures += 1;
                SessionState::Closed
            }

            // From Ready
            (SessionState::Ready, SessionEvent::Execute) => SessionState::Executing,

            // From Executing
            (SessionState::Executing, SessionEvent::Executed) => SessionState::Ready,

            (
                SessionState::Connecting | SessionState::Ready | SessionState::Executing,
                SessionEvent::Closed,
            ) => SessionState::Closed,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self::new()
    }
}
