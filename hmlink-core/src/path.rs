//! Object paths: derive device and adapter scope from a characteristic path.
//!
//! Example: `/org/bluez/hci0/dev_5C_12_03_6A_24_E7/service0010/char0011`
//! has device `/org/bluez/hci0/dev_5C_12_03_6A_24_E7` and adapter `/org/bluez/hci0`.

use std::fmt;

const SERVICE_MARKER: &str = "/service";
const DEVICE_MARKER: &str = "/dev_";

/// A slash-separated, absolute object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(PathError::NotAbsolute(path));
        }
        if path.len() > 1 && path[1..].split('/').any(str::is_empty) {
            return Err(PathError::EmptySegment(path));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment (`char0011` for a characteristic path).
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Path with the last segment removed. `None` for the root.
    pub fn parent(&self) -> Option<ObjectPath> {
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            return if self.0.len() > 1 {
                Some(ObjectPath("/".to_string()))
            } else {
                None
            };
        }
        Some(ObjectPath(self.0[..idx].to_string()))
    }

    fn prefix_before(&self, marker: &str) -> Option<ObjectPath> {
        let pos = self.0.find(marker)?;
        if pos == 0 {
            return None;
        }
        Some(ObjectPath(self.0[..pos].to_string()))
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel, device and adapter paths of the bridged peripheral. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralAddress {
    pub channel: ObjectPath,
    pub device: ObjectPath,
    pub adapter: ObjectPath,
}

impl PeripheralAddress {
    /// Derive device and adapter paths from the characteristic path.
    pub fn from_channel(channel: &str) -> Result<Self, PathError> {
        let channel = ObjectPath::new(channel)?;
        let device = channel
            .prefix_before(SERVICE_MARKER)
            .ok_or(PathError::Missing("service"))?;
        let adapter = channel
            .prefix_before(DEVICE_MARKER)
            .ok_or(PathError::Missing("device"))?;
        if !device.as_str().starts_with(adapter.as_str()) || device == adapter {
            return Err(PathError::Missing("device"));
        }
        Ok(Self {
            channel,
            device,
            adapter,
        })
    }

    /// Like `from_channel`, but also check an explicitly configured device path.
    pub fn with_device(channel: &str, device: &str) -> Result<Self, PathError> {
        let address = Self::from_channel(channel)?;
        let device = ObjectPath::new(device)?;
        if device != address.device {
            return Err(PathError::DeviceMismatch {
                device: device.to_string(),
                channel: address.channel.to_string(),
            });
        }
        Ok(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("object path must be absolute: {0:?}")]
    NotAbsolute(String),
    #[error("object path has an empty segment: {0:?}")]
    EmptySegment(String),
    #[error("characteristic path has no {0} component")]
    Missing(&'static str),
    #[error("device path {device} is not the parent of characteristic {channel}")]
    DeviceMismatch { device: String, channel: String },
}
