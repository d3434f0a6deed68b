//! Contract the bridge needs from the BLE stack. The host supplies the implementation.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::TransportError;
use crate::path::ObjectPath;

/// Interface name carried by property changes of a remote device.
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// BLE ATT default payload size, used before any notify handle reports its MTU.
pub const DEFAULT_MTU: u16 = 20;

/// Readable notification resource plus the chunk size negotiated for it.
pub struct NotifyHandle<R> {
    pub reader: R,
    pub mtu: u16,
}

impl<R> NotifyHandle<R> {
    pub fn new(reader: R, mtu: u16) -> Self {
        Self { reader, mtu }
    }
}

/// Discovery filter transport selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTransport {
    Le,
}

/// One properties-changed notification, already lifted out of the wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub interface: String,
    /// Changed `ServiceData` entries, if the notification carried any. Order as received.
    pub service_data: Option<Vec<(Uuid, Vec<u8>)>>,
}

impl PropertyChange {
    pub fn device(service_data: Option<Vec<(Uuid, Vec<u8>)>>) -> Self {
        Self {
            interface: DEVICE_INTERFACE.to_string(),
            service_data,
        }
    }
}

/// Live property-change subscription. Dropping it unsubscribes.
pub type PropertyStream = Pin<Box<dyn Stream<Item = PropertyChange> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Notify: AsyncRead + Unpin + Send + 'static;

    async fn connect(&self, device: &ObjectPath, timeout: Duration) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &ObjectPath) -> Result<(), TransportError>;

    async fn write_channel(&self, channel: &ObjectPath, bytes: &[u8]) -> Result<(), TransportError>;

    async fn acquire_notify(
        &self,
        channel: &ObjectPath,
    ) -> Result<NotifyHandle<Self::Notify>, TransportError>;

    async fn set_discovery_filter(
        &self,
        adapter: &ObjectPath,
        transport: DiscoveryTransport,
    ) -> Result<(), TransportError>;

    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), TransportError>;

    async fn stop_discovery(&self, adapter: &ObjectPath) -> Result<(), TransportError>;

    async fn subscribe_property_changes(
        &self,
        device: &ObjectPath,
    ) -> Result<PropertyStream, TransportError>;
}

/// Bound a transport call; an expired call becomes `TransportError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}
