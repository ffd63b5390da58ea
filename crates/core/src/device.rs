use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::channel::{DeviceSnapshot, LinkType};
use crate::error::{CastError, Result};
use crate::protocol::MediaPort;

/// A peer device as known to the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDevice {
    pub device_id: String,
    pub device_name: String,
    pub ip_address: String,
    pub link_type: LinkType,
    /// Peer's negotiation port; set from consult data on the sink side.
    pub rtsp_port: u16,
    pub media_port: MediaPort,
    pub rc_port: u16,
    /// Base64 session key shared with the peer.
    pub session_key: String,
    /// Assigned once per connection attempt.
    pub session_id: Option<u32>,
}

impl RemoteDevice {
    pub fn new(device_id: &str, ip_address: &str, link_type: LinkType) -> Self {
        RemoteDevice {
            device_id: device_id.to_string(),
            ip_address: ip_address.to_string(),
            link_type,
            ..Default::default()
        }
    }

    pub fn snapshot(&self, port: u16) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            ip_address: self.ip_address.clone(),
            port,
        }
    }
}

/// Per-device connection state reported to session listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Playing,
    Paused,
    Disconnecting,
    Stream,
    Authing,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Disconnecting => "disconnecting",
            Self::Stream => "stream",
            Self::Authing => "authing",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeviceInfo {
    pub device: RemoteDevice,
    pub state: DeviceState,
}

/// Device lookup and trust, supplied by the embedding application.
pub trait DeviceManager: Send + Sync {
    fn get_device(&self, device_id: &str) -> Option<RemoteDevice>;
    fn is_trusted(&self, device_id: &str) -> bool;
    fn is_double_frame_supported(&self, device_id: &str) -> bool;
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    device: RemoteDevice,
    trusted: bool,
    double_frame: bool,
}

/// In-memory [`DeviceManager`].
///
/// Cheap to clone; clones share the same devices.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceEntry>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device.
    pub fn add(&self, device: RemoteDevice, trusted: bool) {
        tracing::debug!(device_id = %device.device_id, trusted, "device registered");
        self.devices.write().insert(
            device.device_id.clone(),
            DeviceEntry {
                device,
                trusted,
                double_frame: false,
            },
        );
    }

    pub fn set_trusted(&self, device_id: &str, trusted: bool) -> Result<()> {
        self.update(device_id, |entry| entry.trusted = trusted)
    }

    pub fn set_double_frame(&self, device_id: &str, supported: bool) -> Result<()> {
        self.update(device_id, |entry| entry.double_frame = supported)
    }

    pub fn remove(&self, device_id: &str) -> Option<RemoteDevice> {
        self.devices.write().remove(device_id).map(|e| e.device)
    }

    fn update(&self, device_id: &str, f: impl FnOnce(&mut DeviceEntry)) -> Result<()> {
        let mut devices = self.devices.write();
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| CastError::DeviceNotFound(device_id.to_string()))?;
        f(entry);
        Ok(())
    }
}

impl DeviceManager for DeviceRegistry {
    fn get_device(&self, device_id: &str) -> Option<RemoteDevice> {
        self.devices.read().get(device_id).map(|e| e.device.clone())
    }

    fn is_trusted(&self, device_id: &str) -> bool {
        self.devices.read().get(device_id).is_some_and(|e| e.trusted)
    }

    fn is_double_frame_supported(&self, device_id: &str) -> bool {
        self.devices
            .read()
            .get(device_id)
            .is_some_and(|e| e.double_frame)
    }
}

/// Devices taking part in one session, behind the device-list lock.
#[derive(Default)]
pub struct DeviceList {
    devices: Mutex<Vec<RemoteDeviceInfo>>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: RemoteDevice, state: DeviceState) -> Result<()> {
        let mut devices = self.devices.lock();
        if devices.iter().any(|d| d.device.device_id == device.device_id) {
            return Err(CastError::DeviceExists(device.device_id));
        }
        devices.push(RemoteDeviceInfo { device, state });
        Ok(())
    }

    pub fn get(&self, device_id: &str) -> Option<RemoteDeviceInfo> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.device.device_id == device_id)
            .cloned()
    }

    /// First device in the session, if any.
    pub fn first(&self) -> Option<RemoteDeviceInfo> {
        self.devices.lock().first().cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices
            .lock()
            .iter()
            .map(|d| d.device.device_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Set the state of `device_id`. Returns false when absent.
    pub fn set_state(&self, device_id: &str, state: DeviceState) -> bool {
        self.update(device_id, |d| d.state = state)
    }

    /// Apply `f` to the entry for `device_id`. Returns false when absent.
    pub fn update(&self, device_id: &str, f: impl FnOnce(&mut RemoteDeviceInfo)) -> bool {
        let mut devices = self.devices.lock();
        match devices.iter_mut().find(|d| d.device.device_id == device_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Record the session id for this connection attempt. A second
    /// assignment is refused and logged.
    pub fn assign_session_id(&self, device_id: &str, session_id: u32) -> bool {
        let mut assigned = false;
        self.update(device_id, |d| {
            if d.device.session_id.is_none() {
                d.device.session_id = Some(session_id);
                assigned = true;
            }
        });
        if !assigned {
            tracing::warn!(device_id, session_id, "session id already assigned");
        }
        assigned
    }

    pub fn remove(&self, device_id: &str) -> Option<RemoteDeviceInfo> {
        let mut devices = self.devices.lock();
        let pos = devices
            .iter()
            .position(|d| d.device.device_id == device_id)?;
        Some(devices.remove(pos))
    }

    /// Remove every device and return the removed ids.
    pub fn clear(&self) -> Vec<String> {
        std::mem::take(&mut *self.devices.lock())
            .into_iter()
            .map(|d| d.device.device_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reports_trust_and_double_frame() {
        let registry = DeviceRegistry::new();
        registry.add(RemoteDevice::new("tv", "10.0.0.2", LinkType::Tcp), false);

        assert!(!registry.is_trusted("tv"));
        registry.set_trusted("tv", true).unwrap();
        registry.set_double_frame("tv", true).unwrap();
        assert!(registry.is_trusted("tv"));
        assert!(registry.is_double_frame_supported("tv"));

        assert!(registry.get_device("phone").is_none());
        assert!(matches!(
            registry.set_trusted("phone", true),
            Err(CastError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn device_list_rejects_duplicates() {
        let list = DeviceList::new();
        let device = RemoteDevice::new("tv", "", LinkType::Tcp);
        list.insert(device.clone(), DeviceState::Connecting).unwrap();
        assert!(matches!(
            list.insert(device, DeviceState::Connecting),
            Err(CastError::DeviceExists(id)) if id == "tv"
        ));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn session_id_is_assigned_once() {
        let list = DeviceList::new();
        list.insert(RemoteDevice::new("tv", "", LinkType::Tcp), DeviceState::Connecting)
            .unwrap();

        assert!(list.assign_session_id("tv", 7));
        assert!(!list.assign_session_id("tv", 8));
        assert_eq!(list.get("tv").unwrap().device.session_id, Some(7));
        assert!(!list.assign_session_id("phone", 9));
    }

    #[test]
    fn clear_returns_removed_ids() {
        let list = DeviceList::new();
        list.insert(RemoteDevice::new("a", "", LinkType::Tcp), DeviceState::Connected)
            .unwrap();
        list.insert(RemoteDevice::new("b", "", LinkType::Tcp), DeviceState::Connected)
            .unwrap();
        assert_eq!(list.clear(), vec!["a", "b"]);
        assert!(list.is_empty());
    }
}
