//! HM-10 style serial-over-BLE bridge core.
//! Exposes one GATT characteristic as a single-client TCP stream; the BLE stack
//! is reached only through the `Transport` trait the host supplies.

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod path;
pub mod scan;
pub mod shutdown;
pub mod state;
pub mod transport;
pub mod wake;

#[cfg(test)]
mod mock;

pub use backoff::{Backoff, BackoffConfig};
pub use bridge::{bind_listener, Bridge};
pub use config::BridgeConfig;
pub use connection::ConnectionManager;
pub use error::{BridgeError, LinkError, TransportError};
pub use path::{ObjectPath, PathError, PeripheralAddress};
pub use scan::{decode_wake_flag, ScanMonitor};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use state::ConnectionState;
pub use transport::{
    DiscoveryTransport, NotifyHandle, PropertyChange, PropertyStream, Transport, DEFAULT_MTU,
    DEVICE_INTERFACE,
};
pub use wake::{wake_channel, WakeReceiver, WakeSender};
