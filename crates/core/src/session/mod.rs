//! Cast session: a hierarchical state machine driven by one worker thread.
//!
//! Every API call, channel callback and negotiation callback becomes a
//! [`Message`] on the session queue. The worker hands each message to the
//! active [`SessionState`], which may defer it, run a processor from the
//! dispatch table, or transfer to another state.
//!
//! ```text
//! add_device ──▶ CONNECT ──▶ Disconnected ──▶ Connecting ──▶ Connected ──▶ Paused ⇄ Playing
//!                                 ▲                │               │          └── Stream
//!                                 └──── Disconnecting ◀── DISCONNECT / ERROR / TIMEOUT
//! ```
//!
//! Callbacks from channels and the protocol controller hold a weak handle;
//! once the last [`Session`] clone drops, the worker tears down whatever is
//! still open and exits.

mod dispatch;
mod handle;
pub mod listener;
pub mod message;
pub mod player;
pub mod properties;
pub mod queue;
pub mod state;
mod states;
mod worker;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::channel::ConnectionRegistry;
use crate::config::{SessionConfig, SessionRole};
use crate::device::{DeviceManager, RemoteDeviceInfo};
use crate::error::{CastError, Result};
use crate::protocol::FeatureSet;

use self::worker::SessionCore;
use self::handle::{SessionHandle, Shared};

pub use worker::ModuleState;
pub use handle::RENDER_READY_ACTION;
pub use listener::{ListenerRegistry, SessionListener, event};
pub use message::{Message, MessageId};
pub use player::{MirrorPlayer, MirrorRenderer, StreamManager};
pub use properties::{CastMode, SessionProperties};
pub use queue::MessageQueue;
pub use state::SessionState;

struct Inner {
    shared: Arc<Shared>,
    config: SessionConfig,
    device_manager: Arc<dyn DeviceManager>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.queue.close();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }
    }
}

/// One casting session to a single remote device.
///
/// Cheap to clone; clones drive the same session. Dropping the last clone
/// stops the worker and waits for it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a session, enter `Disconnected` and start its worker.
    pub fn new(
        config: SessionConfig,
        registry: ConnectionRegistry,
        device_manager: Arc<dyn DeviceManager>,
    ) -> Result<Session> {
        let session_id = config.id_generator.session_id();
        let shared = Arc::new(Shared::new(session_id, config.cast_mode));

        let mut core = SessionCore::new(
            shared.clone(),
            config.clone(),
            registry,
            device_manager.clone(),
        );
        core.init();

        let worker = thread::Builder::new()
            .name(format!("cast-session-{session_id}"))
            .spawn(move || run(core))?;

        tracing::info!(session_id, role = ?config.role, link = ?config.link_type, "session created");
        Ok(Session {
            inner: Arc::new(Inner {
                shared,
                config,
                device_manager,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub fn session_id(&self) -> u32 {
        self.shared().session_id()
    }

    /// The id as a string; falls back to the negotiated RTSP port when no
    /// id has been assigned.
    pub fn session_id_string(&self) -> String {
        match self.session_id() {
            0 => self.shared().rtsp_port.load(Ordering::SeqCst).to_string(),
            id => id.to_string(),
        }
    }

    pub fn role(&self) -> SessionRole {
        self.inner.config.role
    }

    pub fn state(&self) -> SessionState {
        *self.shared().state.lock()
    }

    pub fn cast_mode(&self) -> CastMode {
        *self.shared().cast_mode.lock()
    }

    pub fn register_listener(&self, pid: u32, listener: Arc<dyn SessionListener>) {
        self.shared().listeners.register(pid, listener);
    }

    pub fn unregister_listener(&self, pid: u32) -> bool {
        self.shared().listeners.unregister(pid)
    }

    /// Start casting to `device_id`.
    ///
    /// Validation happens here; the connect itself runs on the worker and
    /// reports through the registered listeners.
    pub fn add_device(&self, device_id: &str) -> Result<()> {
        if device_id.is_empty() {
            return Err(CastError::InvalidRequest("device id is empty".to_string()));
        }
        let shared = self.shared();
        if !shared
            .listeners
            .wait_for_listener(self.inner.config.listener_wait)
        {
            tracing::error!(device_id, "no session listener registered");
            return Err(CastError::NoListener);
        }
        if shared.devices.contains(device_id) {
            return Err(CastError::DeviceExists(device_id.to_string()));
        }
        if self.inner.device_manager.get_device(device_id).is_none() {
            return Err(CastError::DeviceNotFound(device_id.to_string()));
        }
        if self.inner.config.role == SessionRole::Sink
            && shared
                .properties
                .wait(self.inner.config.properties_wait)
                .is_none()
        {
            return Err(CastError::PropertiesTimeout);
        }

        if !self.inner.device_manager.is_trusted(device_id) {
            shared
                .queue
                .post(Message::new(MessageId::Auth).with_str(device_id))?;
        }
        shared
            .queue
            .post(Message::new(MessageId::Connect).with_str(device_id))
    }

    /// Disconnect `device_id`. Unknown devices are rejected.
    pub fn remove_device(&self, device_id: &str) -> Result<()> {
        if !self.shared().devices.contains(device_id) {
            return Err(CastError::DeviceNotFound(device_id.to_string()));
        }
        self.post(Message::new(MessageId::Disconnect).with_str(device_id))
    }

    pub fn play(&self) -> Result<()> {
        self.post(Message::new(MessageId::Play))
    }

    pub fn pause(&self) -> Result<()> {
        self.post(Message::new(MessageId::Pause))
    }

    /// Switch between mirroring and stream projection. Applied while
    /// playing and forwarded to the peer.
    pub fn set_cast_mode(&self, mode: CastMode) -> Result<()> {
        self.post(Message::new(MessageId::SetCastMode).with_args(mode.code(), 0))
    }

    /// Propose `features` to the peer once connected. Needs the custom
    /// params feature on both ends; both sides keep the intersection.
    pub fn renegotiate_features(&self, features: &FeatureSet) -> Result<()> {
        self.post(Message::new(MessageId::UpdateFeatures).with_str(features.to_string()))
    }

    /// Provide the source's consult data to a sink. Must happen before
    /// [`add_device`](Self::add_device) returns on a sink.
    pub fn set_session_properties(&self, properties: SessionProperties) {
        tracing::debug!(session_id = properties.session_id, rtsp_port = properties.rtsp_port, "session properties set");
        self.shared().properties.set(properties);
    }

    pub fn set_session_properties_json(&self, json: &str) -> Result<()> {
        self.set_session_properties(SessionProperties::from_json(json)?);
        Ok(())
    }

    pub fn session_properties(&self) -> Option<SessionProperties> {
        self.shared().properties.get()
    }

    /// Consult data to hand to the peer out of band.
    pub fn consult_data(&self) -> Result<String> {
        self.session_properties()
            .ok_or_else(|| CastError::InvalidRequest("no connect attempt running".to_string()))?
            .to_json()
    }

    pub fn device(&self, device_id: &str) -> Option<RemoteDeviceInfo> {
        self.shared().devices.get(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.shared().devices.ids()
    }

    /// Attach `renderer` as this session's mirror pipeline.
    pub fn create_mirror_player(&self, renderer: Arc<dyn MirrorRenderer>) -> MirrorPlayer {
        self.shared().set_renderer(Some(renderer.clone()));
        MirrorPlayer::new(SessionHandle::new(self.shared()), renderer)
    }

    pub fn set_stream_manager(&self, manager: Option<Arc<dyn StreamManager>>) {
        self.shared().set_stream_manager(manager);
    }

    /// Open a stream channel while in `Stream`: listen when `port` is 0 and
    /// advertise the port to the peer, otherwise connect to it.
    pub fn create_stream_channel(&self, port: u16) -> Result<()> {
        self.post(Message::new(MessageId::StreamChannelCreate).with_args(i32::from(port), 0))
    }

    /// Send a stream action (JSON) to the peer.
    pub fn send_stream_action(&self, action: &str) -> Result<()> {
        self.post(Message::new(MessageId::StreamSendActionEventToPeers).with_str(action))
    }

    pub fn post(&self, message: Message) -> Result<()> {
        self.shared().queue.post(message)
    }

    /// Stop the worker now. Other clones see a closed session.
    pub fn release(&self) {
        self.shared().queue.close();
        if let Some(worker) = self.inner.worker.lock().take()
            && worker.thread().id() != thread::current().id()
            && worker.join().is_err()
        {
            tracing::error!("session worker panicked");
        }
    }
}

fn run(mut core: SessionCore) {
    tracing::debug!(session_id = core.session_id, "session worker started");
    while let Some(message) = core.shared.queue.next() {
        core.handle_message(message);
    }
    core.shutdown();
}
