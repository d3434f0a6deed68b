//! BlueZ transport over `bluer`.
//!
//! Object paths are resolved on every call: the adapter by name (`hci0`), the
//! device by the MAC encoded in `dev_XX_XX_XX_XX_XX_XX`, and the service and
//! characteristic by the hex ids in `serviceNNNN` / `charNNNN`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::gatt::CharacteristicReader;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter, Session};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use hmlink_core::{
    DiscoveryTransport, NotifyHandle, ObjectPath, PropertyChange, PropertyStream, Transport,
    TransportError,
};

const DEVICE_PREFIX: &str = "dev_";
const SERVICE_PREFIX: &str = "service";
const CHARACTERISTIC_PREFIX: &str = "char";

pub struct BluezTransport {
    session: Session,
    /// Keeps the discovery session alive between start and stop.
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluezTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let session = Session::new().await.map_err(map_err)?;
        info!("BlueZ session opened");
        Ok(Self {
            session,
            discovery: Mutex::new(None),
        })
    }

    fn adapter(&self, adapter: &ObjectPath) -> Result<Adapter, TransportError> {
        self.session.adapter(adapter.file_name()).map_err(map_err)
    }

    fn device(&self, device: &ObjectPath) -> Result<Device, TransportError> {
        let adapter_path = device
            .parent()
            .ok_or_else(|| TransportError::failed(format!("no adapter in {device}")))?;
        let adapter = self.adapter(&adapter_path)?;
        adapter.device(device_address(device)?).map_err(map_err)
    }

    async fn characteristic(&self, channel: &ObjectPath) -> Result<Characteristic, TransportError> {
        let (service_id, char_id) = gatt_ids(channel)?;
        let device_path = channel
            .parent()
            .and_then(|service| service.parent())
            .ok_or_else(|| TransportError::failed(format!("no device in {channel}")))?;
        let device = self.device(&device_path)?;
        let service = device.service(service_id).await.map_err(map_err)?;
        service.characteristic(char_id).await.map_err(map_err)
    }

    fn take_discovery(&self) -> Option<JoinHandle<()>> {
        self.discovery.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl Transport for BluezTransport {
    type Notify = CharacteristicReader;

    async fn connect(&self, device: &ObjectPath, timeout: Duration) -> Result<(), TransportError> {
        let device = self.device(device)?;
        match tokio::time::timeout(timeout, device.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if matches!(e.kind, bluer::ErrorKind::AlreadyConnected) => Ok(()),
            Ok(Err(e)) => Err(map_err(e)),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn disconnect(&self, device: &ObjectPath) -> Result<(), TransportError> {
        self.device(device)?.disconnect().await.map_err(map_err)
    }

    async fn write_channel(&self, channel: &ObjectPath, bytes: &[u8]) -> Result<(), TransportError> {
        let chr = self.characteristic(channel).await?;
        chr.write(bytes).await.map_err(map_err)
    }

    async fn acquire_notify(
        &self,
        channel: &ObjectPath,
    ) -> Result<NotifyHandle<CharacteristicReader>, TransportError> {
        let chr = self.characteristic(channel).await?;
        let reader = chr.notify_io().await.map_err(map_err)?;
        let mtu = u16::try_from(reader.mtu()).unwrap_or(u16::MAX);
        debug!(%channel, mtu, "notify handle acquired");
        Ok(NotifyHandle::new(reader, mtu))
    }

    async fn set_discovery_filter(
        &self,
        adapter: &ObjectPath,
        transport: DiscoveryTransport,
    ) -> Result<(), TransportError> {
        let filter = DiscoveryFilter {
            transport: match transport {
                DiscoveryTransport::Le => bluer::DiscoveryTransport::Le,
            },
            ..Default::default()
        };
        self.adapter(adapter)?
            .set_discovery_filter(filter)
            .await
            .map_err(map_err)
    }

    async fn start_discovery(&self, adapter: &ObjectPath) -> Result<(), TransportError> {
        let adapter = self.adapter(adapter)?;
        let mut events = Box::pin(adapter.discover_devices().await.map_err(map_err)?);
        let drain = tokio::spawn(async move { while events.next().await.is_some() {} });
        let previous = self
            .discovery
            .lock()
            .map_err(|_| TransportError::failed("discovery state poisoned"))?
            .replace(drain);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_discovery(&self, _adapter: &ObjectPath) -> Result<(), TransportError> {
        if let Some(drain) = self.take_discovery() {
            drain.abort();
            let _ = drain.await;
        }
        Ok(())
    }

    async fn subscribe_property_changes(
        &self,
        device: &ObjectPath,
    ) -> Result<PropertyStream, TransportError> {
        let events = self.device(device)?.events().await.map_err(map_err)?;
        Ok(Box::pin(events.map(property_change)))
    }
}

fn property_change(event: DeviceEvent) -> PropertyChange {
    if let DeviceEvent::PropertyChanged(DeviceProperty::ServiceData(map)) = event {
        PropertyChange::device(Some(map.into_iter().collect()))
    } else {
        PropertyChange::device(None)
    }
}

fn map_err(err: bluer::Error) -> TransportError {
    if matches!(err.kind, bluer::ErrorKind::NotConnected) || says_not_connected(&err.message) {
        TransportError::NotConnected
    } else {
        TransportError::failed(err.to_string())
    }
}

/// BlueZ also reports a dropped link as a generic `Failed` with this message.
fn says_not_connected(message: &str) -> bool {
    message.contains("Not connected")
}

/// `.../dev_5C_12_03_6A_24_E7` to `5C:12:03:6A:24:E7`.
fn device_address(device: &ObjectPath) -> Result<Address, TransportError> {
    let name = device.file_name();
    let mac = name
        .strip_prefix(DEVICE_PREFIX)
        .ok_or_else(|| TransportError::failed(format!("not a device path: {device}")))?
        .replace('_', ":");
    mac.parse()
        .map_err(|_| TransportError::failed(format!("bad device address in {device}")))
}

/// Service and characteristic ids of a characteristic path.
fn gatt_ids(channel: &ObjectPath) -> Result<(u16, u16), TransportError> {
    let service = channel
        .parent()
        .ok_or_else(|| TransportError::failed(format!("no service in {channel}")))?;
    let service_id = hex_suffix(service.file_name(), SERVICE_PREFIX)
        .ok_or_else(|| TransportError::failed(format!("bad service id in {channel}")))?;
    let char_id = hex_suffix(channel.file_name(), CHARACTERISTIC_PREFIX)
        .ok_or_else(|| TransportError::failed(format!("bad characteristic id in {channel}")))?;
    Ok((service_id, char_id))
}

fn hex_suffix(segment: &str, prefix: &str) -> Option<u16> {
    let digits = segment.strip_prefix(prefix)?;
    if digits.is_empty() {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}
