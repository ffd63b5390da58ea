use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::channel::{
    ChannelManager, ChannelRequest, ChannelRole, ConnectionRegistry, LinkType, ModuleType,
};
use crate::config::{SessionConfig, SessionRole};
use crate::device::{DeviceManager, DeviceState, RemoteDevice};
use crate::error::{CastError, EventCode, Result};
use crate::protocol::{
    Action, ControllerRole, FeatureSet, ParamInfo, ProtocolController, feature,
};
use crate::session::handle::{SessionHandle, Shared};
use crate::session::listener::event;
use crate::session::message::{Message, MessageId};
use crate::session::properties::{CastMode, SessionProperties};
use crate::session::state::SessionState;
use crate::session::states;

/// Setup progress of a group of module channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Idle,
    Starting,
    Success,
    Failed,
}

/// Media channels a link needs: SoftBus without split ports carries audio
/// and video on one channel.
pub(crate) fn media_modules(link_type: LinkType, split_ports: bool) -> Vec<ModuleType> {
    match link_type {
        LinkType::SoftBus if !split_ports => vec![ModuleType::Video],
        _ => vec![ModuleType::Video, ModuleType::Audio],
    }
}

/// Worker-owned session state.
///
/// Only the session worker touches this; everything other threads need
/// lives in [`Shared`].
pub(crate) struct SessionCore {
    pub(crate) shared: Arc<Shared>,
    pub(crate) handle: SessionHandle,
    pub(crate) config: SessionConfig,
    pub(crate) device_manager: Arc<dyn DeviceManager>,
    pub(crate) channels: Arc<ChannelManager>,
    pub(crate) state: SessionState,
    deferred: Vec<Message>,
    /// Messages waiting for the outstanding negotiation request to finish.
    stalled: Vec<Message>,
    pub(crate) controller: Option<ProtocolController>,
    pub(crate) local_params: ParamInfo,
    pub(crate) negotiated: Option<ParamInfo>,
    pub(crate) media_state: ModuleState,
    pub(crate) media_pending: BTreeSet<ModuleType>,
    pub(crate) rc_state: ModuleState,
    pub(crate) cast_mode: CastMode,
    pub(crate) pending_event: EventCode,
    pub(crate) session_id: u32,
    pub(crate) session_key: String,
    #[cfg(test)]
    transitions: Vec<(SessionState, SessionState)>,
}

impl SessionCore {
    pub(crate) fn new(
        shared: Arc<Shared>,
        config: SessionConfig,
        registry: ConnectionRegistry,
        device_manager: Arc<dyn DeviceManager>,
    ) -> Self {
        let handle = SessionHandle::new(&shared);
        let channels = ChannelManager::new(registry, Arc::new(handle.clone()));
        let session_id = shared.session_id();
        SessionCore {
            shared,
            handle,
            local_params: config.local_params.clone(),
            cast_mode: config.cast_mode,
            config,
            device_manager,
            channels,
            state: SessionState::Default,
            deferred: Vec::new(),
            stalled: Vec::new(),
            controller: None,
            negotiated: None,
            media_state: ModuleState::Idle,
            media_pending: BTreeSet::new(),
            rc_state: ModuleState::Idle,
            pending_event: EventCode::None,
            session_id,
            session_key: String::new(),
            #[cfg(test)]
            transitions: Vec::new(),
        }
    }

    pub(crate) fn init(&mut self) {
        self.transfer_state(SessionState::Disconnected);
    }

    /// Offer `message` to the active state, then to each ancestor until one
    /// handles it.
    pub(crate) fn handle_message(&mut self, message: Message) {
        tracing::debug!(
            session_id = self.session_id,
            state = %self.state,
            message = ?message.id,
            "processing message"
        );
        for state in self.state.chain() {
            if states::process(self, state, &message) {
                break;
            }
        }
        if message.id == MessageId::RtspData {
            self.replay_stalled();
        }
    }

    /// Hold `message` until the next transition, then replay it ahead of
    /// anything queued.
    pub(crate) fn defer(&mut self, message: Message) {
        tracing::debug!(state = %self.state, message = ?message.id, "message deferred");
        self.deferred.push(message);
    }

    /// Hold `message` until the negotiation request in flight is answered,
    /// then replay it ahead of anything queued.
    pub(crate) fn stall(&mut self, message: &Message) {
        tracing::debug!(state = %self.state, message = ?message.id, "message waits for pending request");
        self.stalled.push(message.clone());
    }

    fn replay_stalled(&mut self) {
        let pending = self
            .controller
            .as_ref()
            .is_some_and(ProtocolController::has_pending_request);
        if pending || self.stalled.is_empty() {
            return;
        }
        let stalled = std::mem::take(&mut self.stalled);
        self.shared.queue.post_front(stalled);
    }

    pub(crate) fn is_allow_transfer_state(&self, _target: SessionState) -> bool {
        true
    }

    /// Move to `target`: exit states up to the common ancestor, replay
    /// deferred messages, then enter states down to `target`.
    pub(crate) fn transfer_state(&mut self, target: SessionState) {
        if !self.is_allow_transfer_state(target) {
            tracing::warn!(from = %self.state, to = %target, "state transfer refused");
            return;
        }
        let from = self.state;
        let from_chain = from.chain();
        let to_chain = target.chain();

        for state in from_chain.iter().take_while(|s| !to_chain.contains(s)) {
            tracing::debug!(session_id = self.session_id, state = %state, "exit");
        }
        let entering: Vec<SessionState> = to_chain
            .iter()
            .take_while(|s| !from_chain.contains(s))
            .copied()
            .collect();

        #[cfg(test)]
        self.transitions.push((from, target));
        self.state = target;
        *self.shared.state.lock() = target;
        tracing::info!(session_id = self.session_id, from = %from, state = %target, "stage");

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            self.shared.queue.post_front(deferred);
        }

        for state in entering.into_iter().rev() {
            self.enter_state(state);
        }
    }

    fn enter_state(&mut self, state: SessionState) {
        match state {
            SessionState::Connected => {
                self.shared.queue.remove(MessageId::ConnectTimeout);
                self.notify_all(DeviceState::Connected, EventCode::None);
            }
            SessionState::Paused => {
                self.notify_all(DeviceState::Paused, EventCode::None);
                if let Some(renderer) = self.shared.renderer() {
                    renderer.on_playback(false);
                }
            }
            SessionState::Playing => {
                self.notify_all(DeviceState::Playing, EventCode::None);
                if let Some(renderer) = self.shared.renderer() {
                    renderer.on_playback(true);
                }
            }
            SessionState::Stream => self.notify_all(DeviceState::Stream, EventCode::None),
            SessionState::Disconnecting => {
                let code = std::mem::take(&mut self.pending_event);
                self.release_resources(code);
                self.transfer_state(SessionState::Disconnected);
            }
            _ => {}
        }
    }

    pub(crate) fn notify_device(&self, device_id: &str, state: DeviceState, code: EventCode) {
        self.shared.devices.set_state(device_id, state);
        self.shared
            .listeners
            .notify_device_state(state, device_id, code);
    }

    pub(crate) fn notify_all(&self, state: DeviceState, code: EventCode) {
        for device_id in self.shared.devices.ids() {
            self.notify_device(&device_id, state, code);
        }
    }

    /// Stop negotiation, destroy channels, report every device disconnected
    /// with `code` and forget them.
    pub(crate) fn release_resources(&mut self, code: EventCode) {
        self.shared.queue.remove(MessageId::ConnectTimeout);
        if let Some(mut controller) = self.controller.take() {
            controller.stop();
        }
        self.stalled.clear();
        self.channels.destroy_all_channels();
        self.media_state = ModuleState::Idle;
        self.media_pending.clear();
        self.rc_state = ModuleState::Idle;
        self.negotiated = None;
        self.local_params = self.config.local_params.clone();
        self.shared.properties.clear();
        self.shared.rtsp_port.store(0, Ordering::SeqCst);

        self.notify_all(DeviceState::Disconnecting, EventCode::None);
        for device_id in self.shared.devices.clear() {
            self.shared
                .listeners
                .notify_device_state(DeviceState::Disconnected, &device_id, code);
        }
    }

    /// Called on the worker after the queue closes.
    pub(crate) fn shutdown(&mut self) {
        if let Some(controller) = self.controller.as_mut()
            && controller.is_established()
            && let Err(e) = controller.action(Action::Teardown)
        {
            tracing::debug!(error = %e, "teardown on release failed");
        }
        self.release_resources(EventCode::None);
        tracing::info!(session_id = self.session_id, "session released");
    }

    pub(crate) fn is_ready(&self) -> bool {
        let established = self
            .controller
            .as_ref()
            .is_some_and(ProtocolController::is_established);
        established
            && self.negotiated.is_some()
            && self.media_state == ModuleState::Success
            && matches!(self.rc_state, ModuleState::Idle | ModuleState::Success)
    }

    /// When every channel is up, defer a `SETUP_SUCCESS` and move to
    /// Connected, which replays it.
    pub(crate) fn check_ready(&mut self, trigger: Option<&Message>) {
        if !self.is_ready() {
            return;
        }
        let message = trigger
            .cloned()
            .unwrap_or_else(|| Message::new(MessageId::SetupSuccess).with_args(-1, 0));
        self.defer(message);
        self.transfer_state(SessionState::Connected);
    }

    pub(crate) fn is_support_feature(&self, feature: u32) -> bool {
        self.controller
            .as_ref()
            .is_some_and(|c| c.is_support_feature(feature))
    }

    /// Request a channel for `module` to `device`. Returns the bound port
    /// (Sender) or `remote_port` (Receiver).
    pub(crate) fn open_channel(
        &self,
        module: ModuleType,
        role: ChannelRole,
        device: &RemoteDevice,
        remote_port: u16,
    ) -> Result<u16> {
        let request = ChannelRequest::new(
            module,
            self.config.link_type,
            role,
            self.config.local_device.clone(),
            device.snapshot(remote_port),
            self.shared.properties.get().unwrap_or_default(),
        );
        let pending = self
            .channels
            .create_channel(request, Arc::new(self.handle.clone()))?;
        Ok(pending.port)
    }

    fn controller_role(&self) -> ControllerRole {
        match self.config.role {
            SessionRole::Source => ControllerRole::Offerer,
            SessionRole::Sink => ControllerRole::Responder,
        }
    }

    fn fail_connect(&self, device_id: &str, code: EventCode) {
        self.shared.devices.remove(device_id);
        self.shared
            .listeners
            .notify_device_state(DeviceState::Disconnected, device_id, code);
    }

    /// Begin a connect attempt: record the device, request the negotiation
    /// channel and arm the connect timeout. Returns false when the attempt
    /// failed before anything was requested.
    pub(crate) fn connect_device(&mut self, device_id: &str) -> bool {
        let Some(mut device) = self.device_manager.get_device(device_id) else {
            tracing::error!(device_id, "connect to unknown device");
            self.fail_connect(device_id, EventCode::DeviceNotFound);
            return false;
        };
        if self.device_manager.is_double_frame_supported(device_id) {
            self.local_params.features.insert(feature::DOUBLE_FRAME);
        } else {
            self.local_params.features.remove(feature::DOUBLE_FRAME);
        }

        let mut properties = match self.config.role {
            SessionRole::Source => SessionProperties {
                session_id: self.session_id,
                device_id: self.config.local_device.device_id.clone(),
                ip_address: self.config.local_device.ip_address.clone(),
                rtsp_port: 0,
                session_key: self.config.id_generator.session_key(),
                cast_mode: self.cast_mode,
                link_type: self.config.link_type,
            },
            SessionRole::Sink => match self.shared.properties.get() {
                Some(properties) => properties,
                None => {
                    tracing::error!(device_id, "no session properties for sink connect");
                    self.fail_connect(device_id, EventCode::ConnectionFailed);
                    return false;
                }
            },
        };

        if self.config.role == SessionRole::Sink {
            self.session_id = properties.session_id;
            self.shared
                .session_id
                .store(properties.session_id, Ordering::SeqCst);
            self.cast_mode = properties.cast_mode;
            device.rtsp_port = properties.rtsp_port;
        }
        device.session_key = properties.session_key.clone();

        let updated = self.shared.devices.update(device_id, |entry| {
            let session_id = entry.device.session_id;
            entry.device = device.clone();
            entry.device.session_id = session_id;
            entry.state = DeviceState::Connecting;
        });
        if !updated && let Err(e) = self.shared.devices.insert(device.clone(), DeviceState::Connecting) {
            tracing::warn!(device_id, error = %e, "device entry not added");
        }
        self.shared.devices.assign_session_id(device_id, self.session_id);
        self.notify_device(device_id, DeviceState::Connecting, EventCode::None);

        let (role, remote_port) = match self.config.role {
            SessionRole::Source => (ChannelRole::Sender, 0),
            SessionRole::Sink => (ChannelRole::Receiver, properties.rtsp_port),
        };
        let request = ChannelRequest::new(
            ModuleType::Rtsp,
            self.config.link_type,
            role,
            self.config.local_device.clone(),
            device.snapshot(remote_port),
            properties.clone(),
        );
        let pending = match self
            .channels
            .create_channel(request, Arc::new(self.handle.clone()))
        {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(device_id, error = %e, "negotiation channel request failed");
                self.fail_connect(device_id, EventCode::ConnectionFailed);
                return false;
            }
        };

        if self.config.role == SessionRole::Source {
            properties.rtsp_port = pending.port;
        }
        self.shared
            .rtsp_port
            .store(properties.rtsp_port, Ordering::SeqCst);
        self.session_key = properties.session_key.clone();
        self.shared.properties.set(properties);

        self.controller = Some(ProtocolController::new(
            self.controller_role(),
            self.config.link_type,
            self.session_id.to_string(),
            Arc::new(self.handle.clone()),
        ));

        if let Err(e) = self.shared.queue.post_delayed(
            Message::new(MessageId::ConnectTimeout).with_str(device_id),
            self.config.connect_timeout,
        ) {
            tracing::warn!(error = %e, "connect timeout not scheduled");
        }
        tracing::info!(
            session_id = self.session_id,
            device_id,
            rtsp_port = pending.port,
            "connect attempt started"
        );
        true
    }

    /// Emit the consult data for a peer that still has to be paired.
    pub(crate) fn emit_consult_data(&self) {
        match self.shared.properties.get().map(|p| p.to_json()) {
            Some(Ok(json)) => self
                .shared
                .listeners
                .notify_event(event::CONSULT_DATA, &json),
            Some(Err(e)) => tracing::error!(error = %e, "consult data not serialized"),
            None => tracing::warn!("no consult data to emit"),
        }
    }

    /// Record the negotiated parameters and open what they call for.
    /// Returns false when a channel could not be requested.
    pub(crate) fn on_setup_done(&mut self) -> bool {
        let Some(negotiated) = self
            .controller
            .as_ref()
            .and_then(|c| c.negotiated_params())
            .cloned()
        else {
            tracing::warn!("setup done without negotiated parameters");
            return false;
        };
        let Some(device) = self.shared.devices.first().map(|d| d.device) else {
            tracing::warn!("setup done without a device");
            return false;
        };

        self.shared.devices.update(&device.device_id, |entry| {
            entry.device.media_port = negotiated.media_port;
            entry.device.rc_port = negotiated.rc_port;
        });
        self.negotiated = Some(negotiated.clone());

        match self.config.role {
            SessionRole::Source => {
                if self.rc_state != ModuleState::Idle
                    && !self.is_support_feature(feature::REMOTE_CONTROL)
                {
                    tracing::info!("remote control not negotiated, closing its channel");
                    self.channels.destroy_channel(ModuleType::RemoteControl);
                    self.rc_state = ModuleState::Idle;
                }
            }
            SessionRole::Sink => {
                self.cast_mode = negotiated.projection_mode;
                *self.shared.cast_mode.lock() = negotiated.projection_mode;

                for module in media_modules(self.config.link_type, negotiated.split_ports()) {
                    let port = match module {
                        ModuleType::Audio => negotiated.media_port.audio,
                        _ => negotiated.media_port.video,
                    };
                    self.media_pending.insert(module);
                    if let Err(e) = self.open_channel(module, ChannelRole::Receiver, &device, port) {
                        tracing::error!(?module, port, error = %e, "media channel request failed");
                        return false;
                    }
                }
                self.media_state = ModuleState::Starting;

                if self.is_support_feature(feature::REMOTE_CONTROL) && negotiated.rc_port != 0 {
                    self.rc_state = ModuleState::Starting;
                    if let Err(e) = self.open_channel(
                        ModuleType::RemoteControl,
                        ChannelRole::Receiver,
                        &device,
                        negotiated.rc_port,
                    ) {
                        tracing::error!(error = %e, "remote control channel request failed");
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Propose the feature set carried by an `UPDATE_FEATURES` message.
    pub(crate) fn update_features(&mut self, message: &Message) {
        let features = match message.str_arg.parse::<FeatureSet>() {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(features = %message.str_arg, error = %e, "bad feature set");
                return;
            }
        };
        let Some(controller) = self.controller.as_mut() else {
            tracing::warn!("no negotiation running, feature update dropped");
            return;
        };
        match controller.renegotiate_features(features) {
            Ok(()) => self.negotiated = controller.negotiated_params().cloned(),
            Err(CastError::RequestPending(_)) => self.stall(message),
            Err(e) => tracing::warn!(error = %e, "feature update not sent"),
        }
    }

    /// Apply a `SET_CAST_MODE` message, telling the peer unless it asked.
    pub(crate) fn set_cast_mode(&mut self, message: &Message) {
        let Some(mode) = CastMode::from_code(message.arg1) else {
            tracing::warn!(code = message.arg1, "unknown cast mode");
            return;
        };
        let from_peer = message.arg2 == 1;
        if !from_peer && let Some(controller) = self.controller.as_mut() {
            match controller.send_parameter("cast_mode", &mode.to_string()) {
                Ok(()) => {}
                Err(CastError::RequestPending(_)) => {
                    self.stall(message);
                    return;
                }
                Err(e) => tracing::warn!(error = %e, "cast mode not sent to peer"),
            }
        }
        self.cast_mode = mode;
        *self.shared.cast_mode.lock() = mode;
        tracing::info!(session_id = self.session_id, %mode, from_peer, "cast mode changed");

        let json = serde_json::json!({ "castMode": mode, "fromPeer": from_peer });
        self.shared
            .listeners
            .notify_event(event::CAST_MODE, &json.to_string());
    }
}
