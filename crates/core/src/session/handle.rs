use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use base64::prelude::{BASE64_STANDARD, Engine as _};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelListener, ChannelManagerListener, ChannelRequest, ModuleType};
use crate::device::DeviceList;
use crate::error::{CastError, EventCode, Result};
use crate::protocol::{ParamInfo, ProtocolListener};
use crate::session::listener::{ListenerRegistry, event};
use crate::session::message::{Message, MessageId};
use crate::session::player::{MirrorRenderer, StreamManager};
use crate::session::properties::{CastMode, PropertiesSlot};
use crate::session::queue::MessageQueue;
use crate::session::state::SessionState;

/// Stream action a sink sends once its first frame is on screen.
pub const RENDER_READY_ACTION: &str = "render_ready";

/// Session state reachable from API callers and callbacks.
///
/// Everything else belongs to the worker.
pub(crate) struct Shared {
    pub(crate) queue: MessageQueue,
    pub(crate) devices: DeviceList,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) properties: PropertiesSlot,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) cast_mode: Mutex<CastMode>,
    pub(crate) session_id: AtomicU32,
    pub(crate) rtsp_port: AtomicU16,
    renderer: Mutex<Option<Arc<dyn MirrorRenderer>>>,
    stream_manager: Mutex<Option<Arc<dyn StreamManager>>>,
}

impl Shared {
    pub(crate) fn new(session_id: u32, cast_mode: CastMode) -> Self {
        Shared {
            queue: MessageQueue::new(),
            devices: DeviceList::new(),
            listeners: ListenerRegistry::new(),
            properties: PropertiesSlot::default(),
            state: Mutex::new(SessionState::Default),
            cast_mode: Mutex::new(cast_mode),
            session_id: AtomicU32::new(session_id),
            rtsp_port: AtomicU16::new(0),
            renderer: Mutex::new(None),
            stream_manager: Mutex::new(None),
        }
    }

    pub(crate) fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub(crate) fn renderer(&self) -> Option<Arc<dyn MirrorRenderer>> {
        self.renderer.lock().clone()
    }

    pub(crate) fn set_renderer(&self, renderer: Option<Arc<dyn MirrorRenderer>>) {
        *self.renderer.lock() = renderer;
    }

    pub(crate) fn stream_manager(&self) -> Option<Arc<dyn StreamManager>> {
        self.stream_manager.lock().clone()
    }

    pub(crate) fn set_stream_manager(&self, manager: Option<Arc<dyn StreamManager>>) {
        *self.stream_manager.lock() = manager;
    }
}

/// Weak reference to a session, held by everything that calls back into
/// it. Events for a released session are logged and dropped.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    shared: Weak<Shared>,
}

impl SessionHandle {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        SessionHandle {
            shared: Arc::downgrade(shared),
        }
    }

    pub(crate) fn shared(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    pub(crate) fn post(&self, message: Message) -> Result<()> {
        let Some(shared) = self.shared() else {
            tracing::debug!(message = ?message.id, "session released, dropping message");
            return Err(CastError::SessionClosed);
        };
        shared.queue.post(message)
    }

    fn post_or_log(&self, message: Message) {
        let id = message.id;
        if let Err(e) = self.post(message) {
            tracing::debug!(message = ?id, error = %e, "message not posted");
        }
    }
}

impl ChannelManagerListener for SessionHandle {
    fn on_channel_created(&self, channel: Arc<dyn Channel>) {
        let module = channel.request().module_type;
        let id = match module {
            ModuleType::Rtsp => MessageId::Setup,
            _ => MessageId::SetupSuccess,
        };
        self.post_or_log(Message::new(id).with_args(module.code(), 0));
    }

    fn on_channel_open_failed(&self, request: &ChannelRequest, reason: i32) {
        let module = request.module_type;
        let message = match module {
            ModuleType::Rtsp => Message::new(MessageId::Error).with_event(EventCode::ConnectionFailed),
            _ => Message::new(MessageId::SetupFailed),
        };
        self.post_or_log(message.with_args(module.code(), reason));
    }

    fn on_channel_removed(&self, request: &ChannelRequest) {
        let module = request.module_type;
        let message = match module {
            ModuleType::Rtsp => {
                Message::new(MessageId::Disconnect).with_event(EventCode::PeerDisconnected)
            }
            _ => Message::new(MessageId::Error).with_event(EventCode::TransportError),
        };
        self.post_or_log(message.with_args(module.code(), 0));
    }

    fn on_channel_error(&self, request: &ChannelRequest, code: i32) {
        self.post_or_log(
            Message::new(MessageId::Error)
                .with_args(request.module_type.code(), code)
                .with_event(EventCode::TransportError),
        );
    }
}

impl ChannelListener for SessionHandle {
    fn on_data(&self, request: &ChannelRequest, data: &[u8]) {
        let Some(shared) = self.shared() else {
            return;
        };
        match request.module_type {
            ModuleType::Rtsp => {
                let text = String::from_utf8_lossy(data).into_owned();
                self.post_or_log(Message::new(MessageId::RtspData).with_str(text));
            }
            module @ (ModuleType::Video | ModuleType::Audio) => match shared.renderer() {
                Some(renderer) => renderer.on_media_data(module, data),
                None => tracing::trace!(len = data.len(), ?module, "no renderer, dropping media"),
            },
            ModuleType::Stream => match shared.stream_manager() {
                Some(manager) => manager.on_stream_data(data),
                None => tracing::trace!(len = data.len(), "no stream manager, dropping data"),
            },
            ModuleType::RemoteControl => {
                let json = serde_json::json!({ "data": BASE64_STANDARD.encode(data) });
                shared
                    .listeners
                    .notify_event(event::REMOTE_CONTROL, &json.to_string());
            }
            module => tracing::debug!(?module, len = data.len(), "ignoring channel data"),
        }
    }
}

impl ProtocolListener for SessionHandle {
    fn on_setup(&self, _params: &ParamInfo) {
        self.post_or_log(Message::new(MessageId::SetupDone));
    }

    fn on_play(&self) {
        self.post_or_log(Message::new(MessageId::PlayReq));
    }

    fn on_pause(&self) {
        self.post_or_log(Message::new(MessageId::PauseReq));
    }

    fn on_teardown(&self) {
        self.post_or_log(Message::new(MessageId::Disconnect).with_event(EventCode::PeerDisconnected));
    }

    fn on_error(&self, error: &CastError) {
        self.post_or_log(
            Message::new(MessageId::Error)
                .with_str(error.to_string())
                .with_event(EventCode::ProtocolError),
        );
    }

    fn on_trigger(&self, method: &str) {
        self.post_or_log(Message::new(MessageId::ProcessTriggerReq).with_str(method));
    }

    fn on_event(&self, key: &str, value: &str) {
        let message = match key {
            "cast_stream_action" if value == RENDER_READY_ACTION => {
                Message::new(MessageId::PeerRenderReady)
            }
            "cast_stream_action" => {
                Message::new(MessageId::StreamRecvActionEventFromPeers).with_str(value)
            }
            "cast_mode" => match value.parse::<CastMode>() {
                Ok(mode) => Message::new(MessageId::SetCastMode).with_args(mode.code(), 1),
                Err(e) => {
                    tracing::warn!(value, error = %e, "peer sent unknown cast mode");
                    return;
                }
            },
            other => {
                tracing::debug!(key = other, "ignoring protocol event");
                return;
            }
        };
        self.post_or_log(message);
    }
}
