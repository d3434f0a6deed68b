//! Link state shared (by `&mut`) between the connection manager and the scan monitor.

use std::fmt;

/// Where the peripheral link is. `Ready` and `Scanning` never hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Connect call succeeded; waiting for services and the notify handle.
    Connecting,
    /// Notify handle acquired; data flows both ways.
    Ready,
    /// Link down, discovery running, waiting for the peripheral's wake flag.
    Scanning,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Scanning => "scanning",
        };
        f.write_str(s)
    }
}
