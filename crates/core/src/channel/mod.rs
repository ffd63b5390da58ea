//! Channel and connection layer.
//!
//! A cast session needs several point-to-point byte channels to the peer,
//! one per [`ModuleType`]: the RTSP negotiation channel, media channels,
//! the remote-control channel, and so on. Each channel is produced by a
//! [`Connection`] implementation selected by [`LinkType`].
//!
//! ```text
//! ChannelManager ── LinkType ──▶ ConnectionRegistry ──▶ dyn Connection
//!        ▲                                                   │
//!        └──────── ConnectionListener (opened/failed/closed/error)
//! ```
//!
//! Two connections ship with the crate:
//!
//! - [`tcp::TcpConnection`]: one TCP stream per channel, one thread per stream.
//! - [`memory::MemoryConnection`]: an in-process link pairing two sessions,
//!   used by tests and demos.

pub mod manager;
pub mod memory;
pub mod tcp;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::session::SessionProperties;

pub use manager::{ChannelManager, ChannelManagerListener, PendingChannel};

/// What a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleType {
    Auth,
    Rtsp,
    Video,
    Audio,
    RemoteControl,
    Stream,
    Ui,
}

impl ModuleType {
    pub fn code(self) -> i32 {
        match self {
            Self::Auth => 0,
            Self::Rtsp => 1,
            Self::Video => 2,
            Self::Audio => 3,
            Self::RemoteControl => 4,
            Self::Stream => 5,
            Self::Ui => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Auth,
            1 => Self::Rtsp,
            2 => Self::Video,
            3 => Self::Audio,
            4 => Self::RemoteControl,
            5 => Self::Stream,
            6 => Self::Ui,
            _ => return None,
        })
    }

    pub fn is_media(self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }
}

/// Transport family a channel runs over.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// Managed bus; media ports travel packed in a single field.
    SoftBus,
    #[default]
    Tcp,
    Vtp,
}

/// Which end of the channel this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Listens and reports the bound port.
    Sender,
    /// Connects to the port the peer advertised.
    Receiver,
}

/// Identity of one end of a channel at the time the request was built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub ip_address: String,
    /// Port to connect to (remote side, Receiver role) or 0.
    pub port: u16,
}

/// One desired channel.
///
/// Equality and ordering use only the connection id the
/// [`ChannelManager`] assigns, so requests can key a `BTreeMap`.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub connection_id: u32,
    pub module_type: ModuleType,
    pub link_type: LinkType,
    pub role: ChannelRole,
    pub local_device: DeviceSnapshot,
    pub remote_device: DeviceSnapshot,
    pub properties: SessionProperties,
}

impl ChannelRequest {
    pub fn new(
        module_type: ModuleType,
        link_type: LinkType,
        role: ChannelRole,
        local_device: DeviceSnapshot,
        remote_device: DeviceSnapshot,
        properties: SessionProperties,
    ) -> Self {
        Self {
            connection_id: 0,
            module_type,
            link_type,
            role,
            local_device,
            remote_device,
            properties,
        }
    }

    pub(crate) fn with_connection_id(mut self, connection_id: u32) -> Self {
        self.connection_id = connection_id;
        self
    }
}

impl PartialEq for ChannelRequest {
    fn eq(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id
    }
}

impl Eq for ChannelRequest {}

impl PartialOrd for ChannelRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.connection_id.cmp(&other.connection_id)
    }
}

/// A live, bound transport endpoint.
pub trait Channel: Send + Sync {
    fn request(&self) -> &ChannelRequest;

    /// Locally bound port, 0 when not meaningful.
    fn local_port(&self) -> u16;

    fn send(&self, data: &[u8]) -> Result<()>;

    /// Attach the consumer of inbound data. Data that arrives before a
    /// listener is attached is held back, not dropped.
    fn set_listener(&self, listener: Arc<dyn ChannelListener>);

    /// Close locally. Does not report `on_connection_closed` for this end.
    fn close(&self);
}

/// Consumer of bytes arriving on a channel.
pub trait ChannelListener: Send + Sync {
    fn on_data(&self, request: &ChannelRequest, data: &[u8]);
}

/// A transport implementation able to produce channels.
pub trait Connection: Send + Sync {
    /// Connect to `request.remote_device.port`. Completion is reported
    /// through `listener`.
    fn start_connection(
        &self,
        request: &ChannelRequest,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<()>;

    /// Listen for the peer and return the bound port. The accepted channel
    /// is reported through `listener`.
    fn start_listen(
        &self,
        request: &ChannelRequest,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<u16>;

    /// Release anything still pending for `request` (listen sockets,
    /// connect attempts). Idempotent.
    fn close_connection(&self, request: &ChannelRequest);
}

/// Callbacks from a [`Connection`] to its owner.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_opened(&self, channel: Arc<dyn Channel>);
    fn on_connection_connect_failed(&self, request: &ChannelRequest, reason: i32);
    fn on_connection_closed(&self, channel: Arc<dyn Channel>);
    fn on_connection_error(&self, request: &ChannelRequest, code: i32);
}

/// Registry of connection implementations, keyed by link type.
///
/// Cheap to clone; sessions share one registry.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<LinkType, Arc<dyn Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Replaces any existing one for the link type.
    pub fn register(&self, link_type: LinkType, connection: Arc<dyn Connection>) {
        self.connections.write().insert(link_type, connection);
        tracing::info!(?link_type, "connection registered");
    }

    pub fn get(&self, link_type: LinkType) -> Option<Arc<dyn Connection>> {
        self.connections.read().get(&link_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(id: u32, module_type: ModuleType) -> ChannelRequest {
        ChannelRequest::new(
            module_type,
            LinkType::Tcp,
            ChannelRole::Sender,
            DeviceSnapshot::default(),
            DeviceSnapshot::default(),
            SessionProperties::default(),
        )
        .with_connection_id(id)
    }

    #[test]
    fn requests_order_by_connection_id() {
        let mut map = BTreeMap::new();
        map.insert(request(3, ModuleType::Video), "video");
        map.insert(request(1, ModuleType::Rtsp), "rtsp");
        map.insert(request(2, ModuleType::Audio), "audio");
        let order: Vec<_> = map.values().copied().collect();
        assert_eq!(order, vec!["rtsp", "audio", "video"]);
    }
}
