//! Session-level message processors.
//!
//! States decide *whether* a message moves the machine; the processors here
//! do the work shared by every state that accepts the message. Messages
//! without a processor are handled entirely by the states.

use crate::channel::{ChannelRole, ModuleType};
use crate::config::SessionRole;
use crate::device::DeviceState;
use crate::error::{CastError, EventCode};
use crate::protocol::{Action, feature};
use crate::session::worker::{ModuleState, SessionCore, media_modules};
use crate::session::listener::event;
use crate::session::message::{Message, MessageId};

pub(crate) type Processor = fn(&mut SessionCore, &Message) -> bool;

/// The processor for `id`, if it has one.
pub(crate) fn processor(id: MessageId) -> Option<Processor> {
    let processor: Processor = match id {
        MessageId::Auth => process_auth,
        MessageId::Setup => process_setup,
        MessageId::SetupSuccess => process_setup_success,
        MessageId::Play => process_play,
        MessageId::Pause => process_pause,
        MessageId::PlayReq => process_play_req,
        MessageId::PauseReq => process_pause_req,
        MessageId::Disconnect => process_disconnect,
        MessageId::ConnectTimeout => process_connect_timeout,
        MessageId::Error => process_error,
        MessageId::ProcessTriggerReq => process_trigger_req,
        MessageId::PeerRenderReady => process_peer_render_ready,
        MessageId::SetSurface => process_set_surface,
        MessageId::DeliverInputEvent => process_deliver_input_event,
        MessageId::RtspData => process_rtsp_data,
        MessageId::Connect
        | MessageId::SetupFailed
        | MessageId::SetupDone
        | MessageId::StreamRecvActionEventFromPeers
        | MessageId::StreamSendActionEventToPeers
        | MessageId::StreamChannelCreate
        | MessageId::SetCastMode
        | MessageId::UpdateFeatures => return None,
    };
    Some(processor)
}

/// Run the processor for `message`. A message without one is reported and
/// yields `false`.
pub(crate) fn process_state_event(core: &mut SessionCore, message: &Message) -> bool {
    match processor(message.id) {
        Some(processor) => processor(core, message),
        None => {
            tracing::warn!(message = ?message.id, "no processor for message");
            false
        }
    }
}

fn process_auth(core: &mut SessionCore, message: &Message) -> bool {
    let device_id = message.str_arg.as_str();
    let Some(device) = core.device_manager.get_device(device_id) else {
        tracing::error!(device_id, "auth for unknown device");
        core.shared.listeners.notify_device_state(
            DeviceState::Disconnected,
            device_id,
            EventCode::DeviceNotFound,
        );
        return false;
    };
    if !core.shared.devices.contains(device_id)
        && let Err(e) = core.shared.devices.insert(device, DeviceState::Authing)
    {
        tracing::warn!(device_id, error = %e, "device entry not added");
    }
    core.notify_device(device_id, DeviceState::Authing, EventCode::None);
    true
}

fn process_setup(core: &mut SessionCore, _message: &Message) -> bool {
    let Some(channel) = core.channels.channel(ModuleType::Rtsp) else {
        tracing::error!("negotiation channel missing at setup");
        return false;
    };
    let Some(device) = core.shared.devices.first().map(|d| d.device) else {
        tracing::error!("no device at setup");
        return false;
    };

    if core.config.role == SessionRole::Source {
        let modules = media_modules(core.config.link_type, core.local_params.split_ports());
        let mut ports = Vec::with_capacity(modules.len());
        for module in modules {
            match core.open_channel(module, ChannelRole::Sender, &device, 0) {
                Ok(port) => {
                    core.media_pending.insert(module);
                    ports.push((module, port));
                }
                Err(e) => {
                    tracing::error!(?module, error = %e, "media channel request failed");
                    core.media_state = ModuleState::Failed;
                    return false;
                }
            }
        }
        for (module, port) in &ports {
            match module {
                ModuleType::Audio => core.local_params.media_port.audio = *port,
                _ => core.local_params.media_port.video = *port,
            }
        }
        if ports.len() == 1 {
            core.local_params.media_port.audio = core.local_params.media_port.video;
        }
        core.media_state = ModuleState::Starting;

        if core.local_params.features.contains(feature::REMOTE_CONTROL) {
            match core.open_channel(ModuleType::RemoteControl, ChannelRole::Sender, &device, 0) {
                Ok(port) => {
                    core.local_params.rc_port = port;
                    core.rc_state = ModuleState::Starting;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "remote control unavailable, not offering it");
                    core.local_params.features.remove(feature::REMOTE_CONTROL);
                }
            }
        }
    }

    if let Some(manager) = core.shared.stream_manager() {
        core.local_params.player_capability = manager.player_capability();
    }
    core.local_params.projection_mode = core.cast_mode;

    let params = core.local_params.clone();
    let session_key = core.session_key.clone();
    let Some(controller) = core.controller.as_mut() else {
        tracing::error!("no protocol controller at setup");
        return false;
    };
    match controller.start(Some(channel), params, &session_key) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "negotiation start failed");
            false
        }
    }
}

fn process_setup_success(core: &mut SessionCore, message: &Message) -> bool {
    match ModuleType::from_code(message.arg1) {
        Some(module) if module.is_media() => {
            core.media_pending.remove(&module);
            if core.media_pending.is_empty() && core.media_state == ModuleState::Starting {
                core.media_state = ModuleState::Success;
                tracing::info!(session_id = core.session_id, "media channels ready");
            }
        }
        Some(ModuleType::RemoteControl) => {
            if core.rc_state == ModuleState::Starting {
                core.rc_state = ModuleState::Success;
                tracing::info!(session_id = core.session_id, "remote control channel ready");
            }
        }
        Some(ModuleType::Stream) => {
            tracing::info!(session_id = core.session_id, "stream channel ready");
        }
        module => tracing::debug!(?module, "setup success"),
    }
    true
}

/// Send `action` for `message`. A request still in flight holds the
/// message back until it is answered.
fn send_action(core: &mut SessionCore, action: Action, message: &Message) -> bool {
    let Some(controller) = core.controller.as_mut() else {
        tracing::warn!(?action, "no negotiation running");
        return false;
    };
    match controller.action(action) {
        Ok(()) => true,
        Err(CastError::RequestPending(method)) => {
            tracing::debug!(?action, pending = %method, "action waits for answer");
            core.stall(message);
            false
        }
        Err(e) => {
            tracing::warn!(?action, error = %e, "action not sent");
            false
        }
    }
}

fn process_play(core: &mut SessionCore, message: &Message) -> bool {
    send_action(core, Action::Play, message)
}

fn process_pause(core: &mut SessionCore, message: &Message) -> bool {
    send_action(core, Action::Pause, message)
}

fn process_play_req(core: &mut SessionCore, _message: &Message) -> bool {
    tracing::info!(session_id = core.session_id, "peer requested play");
    true
}

fn process_pause_req(core: &mut SessionCore, _message: &Message) -> bool {
    tracing::info!(session_id = core.session_id, "peer requested pause");
    true
}

fn process_disconnect(core: &mut SessionCore, message: &Message) -> bool {
    let from_peer = message.event_code == EventCode::PeerDisconnected;
    if !from_peer
        && core
            .controller
            .as_ref()
            .is_some_and(|c| c.is_established())
    {
        send_action(core, Action::Teardown, message);
    }
    core.pending_event = message.event_code;
    tracing::info!(session_id = core.session_id, from_peer, "disconnect");
    true
}

fn process_connect_timeout(core: &mut SessionCore, message: &Message) -> bool {
    tracing::warn!(
        session_id = core.session_id,
        device_id = %message.str_arg,
        "connect attempt timed out"
    );
    core.pending_event = EventCode::ConnectionFailed;
    true
}

fn process_error(core: &mut SessionCore, message: &Message) -> bool {
    let code = match message.event_code {
        EventCode::None => EventCode::ProtocolError,
        code => code,
    };
    tracing::error!(
        session_id = core.session_id,
        event_code = code.code(),
        module = message.arg1,
        detail = %message.str_arg,
        "session error"
    );
    core.pending_event = code;
    true
}

fn process_trigger_req(core: &mut SessionCore, message: &Message) -> bool {
    tracing::info!(session_id = core.session_id, method = %message.str_arg, "peer trigger ignored");
    true
}

fn process_peer_render_ready(core: &mut SessionCore, _message: &Message) -> bool {
    if !core.is_support_feature(feature::RENDER_READY) {
        tracing::debug!("render ready not negotiated");
        return false;
    }
    if let Some(manager) = core.shared.stream_manager() {
        manager.on_render_ready();
    }
    let json = serde_json::json!({ "sessionId": core.session_id });
    core.shared
        .listeners
        .notify_event(event::RENDER_READY, &json.to_string());
    true
}

fn process_set_surface(core: &mut SessionCore, message: &Message) -> bool {
    match core.shared.renderer() {
        Some(renderer) => {
            renderer.set_surface(&message.str_arg);
            true
        }
        None => {
            tracing::warn!("surface set without a renderer");
            false
        }
    }
}

fn process_deliver_input_event(core: &mut SessionCore, message: &Message) -> bool {
    if core.rc_state != ModuleState::Success {
        tracing::debug!("remote control not ready, dropping input event");
        return false;
    }
    let Some(channel) = core.channels.channel(ModuleType::RemoteControl) else {
        return false;
    };
    match channel.send(message.str_arg.as_bytes()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "input event not sent");
            false
        }
    }
}

fn process_rtsp_data(core: &mut SessionCore, message: &Message) -> bool {
    match core.controller.as_mut() {
        Some(controller) => {
            controller.on_data(message.str_arg.as_bytes());
            true
        }
        None => {
            tracing::debug!("negotiation data without a controller");
            false
        }
    }
}

/// Start a stream channel: listen when `port` is 0, else connect to it.
/// Returns the bound or target port.
pub(crate) fn create_stream_channel(core: &mut SessionCore, port: u16) -> Option<u16> {
    let device = core.shared.devices.first()?.device;
    let role = if port == 0 {
        ChannelRole::Sender
    } else {
        ChannelRole::Receiver
    };
    match core.open_channel(ModuleType::Stream, role, &device, port) {
        Ok(port) => Some(port),
        Err(e) => {
            tracing::error!(port, error = %e, "stream channel request failed");
            None
        }
    }
}

pub(crate) fn stream_manager_action(core: &SessionCore, action: &str) {
    if let Some(manager) = core.shared.stream_manager() {
        manager.on_peer_action(action);
    }
    core.shared
        .listeners
        .notify_event(event::STREAM_ACTION, action);
}
