//! Immutable bridge configuration handed over by the host at startup.

use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::path::PeripheralAddress;

/// Default listen host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default TCP port.
pub const DEFAULT_PORT: u16 = 3000;
/// Connect call timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Timeout for every other transport call (D-Bus default reply timeout).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);
/// Pause between a successful connect and acquire-notify while the peripheral resolves services.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Bound on joining the scan dispatch task.
pub const DEFAULT_SCAN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Sent to the client once after a wake-triggered reconnect.
pub const DEFAULT_WAKE_NOTICE: &[u8] = b"\r\n+WAKE\r\n";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub address: PeripheralAddress,
    pub host: String,
    pub port: u16,
    /// Reconnect after a failed write instead of exiting.
    pub reconnect: bool,
    /// Leave the peripheral connected when the bridge exits.
    pub keep_connected: bool,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub settle_delay: Duration,
    pub reconnect_backoff: BackoffConfig,
    pub acquire_backoff: BackoffConfig,
    pub scan_join_timeout: Duration,
    pub wake_notice: Vec<u8>,
}

impl BridgeConfig {
    pub fn new(address: PeripheralAddress) -> Self {
        Self {
            address,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            reconnect: false,
            keep_connected: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            reconnect_backoff: BackoffConfig::default(),
            acquire_backoff: BackoffConfig::default(),
            scan_join_timeout: DEFAULT_SCAN_JOIN_TIMEOUT,
            wake_notice: DEFAULT_WAKE_NOTICE.to_vec(),
        }
    }

    /// `host:port` string for resolution.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
