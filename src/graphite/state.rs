use std::fmt;

use tracing::debug;

use super::error::ProtocolViolation;

/// Lifecycle of the collector connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    NotConnected,
    Connected,
    DataReceived,
    EofReceived,
    ConnectionLost,
}

impl ConnectionState {
    /// States reachable from `self` in one transition.
    pub const fn next_states(self) -> &'static [ConnectionState] {
        use ConnectionState::*;

        match self {
            NotConnected => &[Connected],
            Connected => &[DataReceived, EofReceived, ConnectionLost],
            DataReceived => &[DataReceived, EofReceived, ConnectionLost],
            EofReceived => &[ConnectionLost],
            ConnectionLost => &[Connected],
        }
    }

    /// Whether the socket is usable for writes.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::DataReceived)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Connected => "connected",
            Self::DataReceived => "data_received",
            Self::EofReceived => "eof_received",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates every connection-state change against the static transition table.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    current: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            current: ConnectionState::NotConnected,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }

    /// States the machine will currently accept.
    pub fn allowed(&self) -> &'static [ConnectionState] {
        self.current.next_states()
    }

    /// Move to `to`, or fail if the table does not allow it.
    pub fn transition(&mut self, to: ConnectionState) -> Result<(), ProtocolViolation> {
        let from = self.current;
        if !from.next_states().contains(&to) {
            return Err(ProtocolViolation { from, to });
        }

        debug!(%from, %to, allowed = ?to.next_states(), "connection state change");
        self.current = to;
        Ok(())
    }

    /// Return to the initial state. Only `close()` does this.
    pub fn reset(&mut self) {
        self.current = ConnectionState::NotConnected;
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
