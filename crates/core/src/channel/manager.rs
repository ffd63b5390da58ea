use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::{
    Channel, ChannelListener, ChannelRequest, ChannelRole, ConnectionListener, ConnectionRegistry,
    ModuleType,
};
use crate::error::{CastError, Result};

/// Callbacks from the [`ChannelManager`] to its owner.
pub trait ChannelManagerListener: Send + Sync {
    fn on_channel_created(&self, channel: Arc<dyn Channel>);
    fn on_channel_open_failed(&self, request: &ChannelRequest, reason: i32);
    fn on_channel_removed(&self, request: &ChannelRequest);
    fn on_channel_error(&self, request: &ChannelRequest, code: i32);
}

/// Synchronous result of [`ChannelManager::create_channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChannel {
    pub connection_id: u32,
    /// Bound port for the Sender role, remote port for the Receiver role.
    pub port: u16,
}

struct ChannelEntry {
    data_listener: Arc<dyn ChannelListener>,
    channel: Option<Arc<dyn Channel>>,
}

/// Creates, tracks and destroys the channels of one session.
///
/// Channels are keyed by their [`ChannelRequest`] (ordered by connection
/// id). The channel map lock is never held while calling into a
/// connection or the listener.
pub struct ChannelManager {
    registry: ConnectionRegistry,
    listener: Arc<dyn ChannelManagerListener>,
    channels: Mutex<BTreeMap<ChannelRequest, ChannelEntry>>,
    next_connection_id: AtomicU32,
    self_ref: Weak<ChannelManager>,
}

impl ChannelManager {
    pub fn new(
        registry: ConnectionRegistry,
        listener: Arc<dyn ChannelManagerListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| ChannelManager {
            registry,
            listener,
            channels: Mutex::new(BTreeMap::new()),
            next_connection_id: AtomicU32::new(1),
            self_ref: self_ref.clone(),
        })
    }

    /// Validate `request`, hand it to the connection for its link type and
    /// return its id. Open/failure is reported later through the listener;
    /// `data_listener` is attached to the channel before it is reported.
    pub fn create_channel(
        &self,
        request: ChannelRequest,
        data_listener: Arc<dyn ChannelListener>,
    ) -> Result<PendingChannel> {
        validate(&request)?;

        let connection = self
            .registry
            .get(request.link_type)
            .ok_or(CastError::ConnectionUnavailable(request.link_type))?;

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let request = request.with_connection_id(connection_id);

        self.channels.lock().insert(
            request.clone(),
            ChannelEntry {
                data_listener,
                channel: None,
            },
        );

        let conn_listener: Arc<dyn ConnectionListener> = Arc::new(ManagerConnectionListener {
            manager: self.self_ref.clone(),
        });

        let started = match request.role {
            ChannelRole::Sender => connection.start_listen(&request, conn_listener),
            ChannelRole::Receiver => connection
                .start_connection(&request, conn_listener)
                .map(|()| request.remote_device.port),
        };

        match started {
            Ok(port) => {
                tracing::info!(
                    connection_id,
                    module = ?request.module_type,
                    link = ?request.link_type,
                    role = ?request.role,
                    port,
                    "channel requested"
                );
                Ok(PendingChannel {
                    connection_id,
                    port,
                })
            }
            Err(e) => {
                tracing::error!(connection_id, module = ?request.module_type, error = %e, "channel request failed");
                self.channels.lock().remove(&request);
                Err(e)
            }
        }
    }

    /// The live channel for `module_type`, if it has opened.
    pub fn channel(&self, module_type: ModuleType) -> Option<Arc<dyn Channel>> {
        self.channels
            .lock()
            .iter()
            .find(|(req, entry)| req.module_type == module_type && entry.channel.is_some())
            .and_then(|(_, entry)| entry.channel.clone())
    }

    /// Whether a channel for `module_type` is requested or open.
    pub fn has_channel(&self, module_type: ModuleType) -> bool {
        self.channels
            .lock()
            .keys()
            .any(|req| req.module_type == module_type)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Destroy every channel for `module_type`. Absent channels are a no-op.
    pub fn destroy_channel(&self, module_type: ModuleType) {
        let removed: Vec<_> = {
            let mut channels = self.channels.lock();
            let keys: Vec<_> = channels
                .keys()
                .filter(|req| req.module_type == module_type)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| channels.remove_entry(&key))
                .collect()
        };
        self.release(removed);
    }

    /// Destroy every channel of this session. Idempotent.
    pub fn destroy_all_channels(&self) {
        let removed: Vec<_> = std::mem::take(&mut *self.channels.lock())
            .into_iter()
            .collect();
        self.release(removed);
    }

    fn release(&self, removed: Vec<(ChannelRequest, ChannelEntry)>) {
        for (request, entry) in removed {
            if let Some(channel) = entry.channel {
                channel.close();
            }
            if let Some(connection) = self.registry.get(request.link_type) {
                connection.close_connection(&request);
            }
            tracing::debug!(connection_id = request.connection_id, module = ?request.module_type, "channel destroyed");
        }
    }

    fn handle_opened(&self, channel: Arc<dyn Channel>) {
        let request = channel.request().clone();
        let data_listener = {
            let mut channels = self.channels.lock();
            match channels.get_mut(&request) {
                Some(entry) if entry.channel.is_none() => {
                    entry.channel = Some(channel.clone());
                    Some(entry.data_listener.clone())
                }
                _ => None,
            }
        };

        match data_listener {
            Some(data_listener) => {
                channel.set_listener(data_listener);
                tracing::info!(connection_id = request.connection_id, module = ?request.module_type, "channel opened");
                self.listener.on_channel_created(channel);
            }
            None => {
                tracing::warn!(connection_id = request.connection_id, module = ?request.module_type, "unexpected channel, closing");
                channel.close();
            }
        }
    }

    fn handle_connect_failed(&self, request: &ChannelRequest, reason: i32) {
        if self.channels.lock().remove(request).is_some() {
            tracing::warn!(connection_id = request.connection_id, module = ?request.module_type, reason, "channel open failed");
            self.listener.on_channel_open_failed(request, reason);
        }
    }

    fn handle_closed(&self, channel: Arc<dyn Channel>) {
        let request = channel.request().clone();
        let removed = {
            let mut channels = self.channels.lock();
            let owned = channels
                .get(&request)
                .and_then(|entry| entry.channel.as_ref())
                .is_some_and(|current| Arc::ptr_eq(current, &channel));
            owned && channels.remove(&request).is_some()
        };
        if removed {
            tracing::info!(connection_id = request.connection_id, module = ?request.module_type, "channel closed by peer");
            if let Some(connection) = self.registry.get(request.link_type) {
                connection.close_connection(&request);
            }
            self.listener.on_channel_removed(&request);
        }
    }

    fn handle_error(&self, request: &ChannelRequest, code: i32) {
        if self.channels.lock().contains_key(request) {
            tracing::warn!(connection_id = request.connection_id, module = ?request.module_type, code, "channel error");
            self.listener.on_channel_error(request, code);
        }
    }
}

fn validate(request: &ChannelRequest) -> Result<()> {
    if request.local_device.device_id.is_empty() {
        return Err(CastError::InvalidRequest("local device id is empty".into()));
    }
    if request.remote_device.device_id.is_empty() {
        return Err(CastError::InvalidRequest("remote device id is empty".into()));
    }
    if request.role == ChannelRole::Receiver && request.remote_device.port == 0 {
        return Err(CastError::InvalidRequest(format!(
            "no remote port for {:?} channel",
            request.module_type
        )));
    }
    Ok(())
}

/// Connection callbacks routed back to the manager while it is alive.
struct ManagerConnectionListener {
    manager: Weak<ChannelManager>,
}

impl ManagerConnectionListener {
    fn manager(&self) -> Option<Arc<ChannelManager>> {
        let manager = self.manager.upgrade();
        if manager.is_none() {
            tracing::debug!("channel manager released, dropping connection event");
        }
        manager
    }
}

impl ConnectionListener for ManagerConnectionListener {
    fn on_connection_opened(&self, channel: Arc<dyn Channel>) {
        match self.manager() {
            Some(manager) => manager.handle_opened(channel),
            None => channel.close(),
        }
    }

    fn on_connection_connect_failed(&self, request: &ChannelRequest, reason: i32) {
        if let Some(manager) = self.manager() {
            manager.handle_connect_failed(request, reason);
        }
    }

    fn on_connection_closed(&self, channel: Arc<dyn Channel>) {
        if let Some(manager) = self.manager() {
            manager.handle_closed(channel);
        }
    }

    fn on_connection_error(&self, request: &ChannelRequest, code: i32) {
        if let Some(manager) = self.manager() {
            manager.handle_error(request, code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryConnection;
    use crate::channel::{DeviceSnapshot, LinkType};
    use crate::session::SessionProperties;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ChannelManagerListener for Recorder {
        fn on_channel_created(&self, channel: Arc<dyn Channel>) {
            self.events
                .lock()
                .push(format!("created {:?}", channel.request().module_type));
        }
        fn on_channel_open_failed(&self, request: &ChannelRequest, _reason: i32) {
            self.events
                .lock()
                .push(format!("failed {:?}", request.module_type));
        }
        fn on_channel_removed(&self, request: &ChannelRequest) {
            self.events
                .lock()
                .push(format!("removed {:?}", request.module_type));
        }
        fn on_channel_error(&self, request: &ChannelRequest, _code: i32) {
            self.events
                .lock()
                .push(format!("error {:?}", request.module_type));
        }
    }

    impl ChannelListener for Recorder {
        fn on_data(&self, _request: &ChannelRequest, data: &[u8]) {
            self.events
                .lock()
                .push(format!("data {}", String::from_utf8_lossy(data)));
        }
    }

    fn request(module: ModuleType, role: ChannelRole, port: u16) -> ChannelRequest {
        ChannelRequest::new(
            module,
            LinkType::Tcp,
            role,
            DeviceSnapshot {
                device_id: "local".into(),
                ..Default::default()
            },
            DeviceSnapshot {
                device_id: "remote".into(),
                port,
                ..Default::default()
            },
            SessionProperties::default(),
        )
    }

    fn manager(registry: &ConnectionRegistry) -> (Arc<ChannelManager>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (ChannelManager::new(registry.clone(), recorder.clone()), recorder)
    }

    #[test]
    fn rejects_missing_device_identity() {
        let registry = ConnectionRegistry::new();
        registry.register(LinkType::Tcp, Arc::new(MemoryConnection::new()));
        let (mgr, recorder) = manager(&registry);

        let mut req = request(ModuleType::Rtsp, ChannelRole::Sender, 0);
        req.remote_device.device_id.clear();
        assert!(matches!(
            mgr.create_channel(req, recorder.clone()),
            Err(CastError::InvalidRequest(_))
        ));
        assert_eq!(mgr.channel_count(), 0);
    }

    #[test]
    fn rejects_unregistered_link() {
        let (mgr, recorder) = manager(&ConnectionRegistry::new());
        let req = request(ModuleType::Rtsp, ChannelRole::Sender, 0);
        assert!(matches!(
            mgr.create_channel(req, recorder),
            Err(CastError::ConnectionUnavailable(LinkType::Tcp))
        ));
    }

    #[test]
    fn paired_channels_report_created_and_carry_data() {
        let registry = ConnectionRegistry::new();
        registry.register(LinkType::Tcp, Arc::new(MemoryConnection::new()));
        let (server, server_events) = manager(&registry);
        let (client, client_events) = manager(&registry);

        let pending = server
            .create_channel(
                request(ModuleType::Rtsp, ChannelRole::Sender, 0),
                server_events.clone(),
            )
            .unwrap();
        assert!(pending.port > 0);
        assert!(server.channel(ModuleType::Rtsp).is_none());

        client
            .create_channel(
                request(ModuleType::Rtsp, ChannelRole::Receiver, pending.port),
                client_events.clone(),
            )
            .unwrap();

        let channel = client.channel(ModuleType::Rtsp).unwrap();
        channel.send(b"hello").unwrap();

        assert_eq!(
            *server_events.events.lock(),
            vec!["created Rtsp".to_string(), "data hello".to_string()]
        );
        assert_eq!(*client_events.events.lock(), vec!["created Rtsp".to_string()]);
    }

    #[test]
    fn connect_to_unknown_port_reports_open_failed() {
        let registry = ConnectionRegistry::new();
        registry.register(LinkType::Tcp, Arc::new(MemoryConnection::new()));
        let (client, events) = manager(&registry);

        client
            .create_channel(
                request(ModuleType::Video, ChannelRole::Receiver, 1),
                events.clone(),
            )
            .unwrap();
        assert_eq!(*events.events.lock(), vec!["failed Video".to_string()]);
        assert_eq!(client.channel_count(), 0);
    }

    #[test]
    fn destroy_is_idempotent_and_reports_removal_to_peer_only() {
        let registry = ConnectionRegistry::new();
        registry.register(LinkType::Tcp, Arc::new(MemoryConnection::new()));
        let (server, server_events) = manager(&registry);
        let (client, client_events) = manager(&registry);

        let pending = server
            .create_channel(
                request(ModuleType::Video, ChannelRole::Sender, 0),
                server_events.clone(),
            )
            .unwrap();
        client
            .create_channel(
                request(ModuleType::Video, ChannelRole::Receiver, pending.port),
                client_events.clone(),
            )
            .unwrap();

        server.destroy_channel(ModuleType::Video);
        server.destroy_channel(ModuleType::Video);
        server.destroy_all_channels();

        assert_eq!(server.channel_count(), 0);
        assert_eq!(client.channel_count(), 0);
        assert_eq!(*server_events.events.lock(), vec!["created Video".to_string()]);
        assert_eq!(
            *client_events.events.lock(),
            vec!["created Video".to_string(), "removed Video".to_string()]
        );
    }
}
