//! Per-state message handlers.
//!
//! Each handler returns `true` when it consumed the message; otherwise the
//! message is offered to the parent state. `Default` consumes everything.

use crate::device::DeviceState;
use crate::error::{CastError, EventCode};
use crate::session::worker::SessionCore;
use crate::session::dispatch::{self, process_state_event};
use crate::session::message::{Message, MessageId};
use crate::session::properties::CastMode;
use crate::session::state::SessionState;

pub(crate) fn process(core: &mut SessionCore, state: SessionState, message: &Message) -> bool {
    match state {
        SessionState::Default => default_state(core, message),
        SessionState::Disconnected => disconnected(core, message),
        SessionState::Authing => authing(core, message),
        SessionState::Connecting => connecting(core, message),
        SessionState::Connected => connected(core, message),
        SessionState::Paused => paused(core, message),
        SessionState::Playing => playing(core, message),
        SessionState::Stream => stream(core, message),
        SessionState::Disconnecting => disconnecting(core, message),
    }
}

fn default_state(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::RtspData | MessageId::SetSurface | MessageId::DeliverInputEvent => {
            process_state_event(core, message);
        }
        id => tracing::warn!(state = %core.state, message = ?id, "message dropped"),
    }
    true
}

fn disconnected(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::Connect => {
            if core.connect_device(&message.str_arg) {
                core.transfer_state(SessionState::Connecting);
            }
            true
        }
        MessageId::Auth => {
            if process_state_event(core, message) {
                core.transfer_state(SessionState::Authing);
            }
            true
        }
        _ => false,
    }
}

fn authing(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::Connect => {
            if core.connect_device(&message.str_arg) {
                core.emit_consult_data();
                core.transfer_state(SessionState::Connecting);
            } else {
                core.transfer_state(SessionState::Disconnected);
            }
            true
        }
        MessageId::Auth => {
            process_state_event(core, message);
            true
        }
        MessageId::Disconnect | MessageId::ConnectTimeout | MessageId::Error => {
            process_state_event(core, message);
            core.transfer_state(SessionState::Disconnecting);
            true
        }
        _ => false,
    }
}

fn connecting(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::Connect | MessageId::Play | MessageId::PlayReq => {
            core.defer(message.clone());
            true
        }
        MessageId::Setup => {
            if !process_state_event(core, message) {
                core.pending_event = EventCode::ConnectionFailed;
                core.transfer_state(SessionState::Disconnecting);
            }
            true
        }
        MessageId::SetupDone => {
            if core.on_setup_done() {
                core.check_ready(None);
            } else {
                core.pending_event = EventCode::ConnectionFailed;
                core.transfer_state(SessionState::Disconnecting);
            }
            true
        }
        MessageId::SetupSuccess => {
            process_state_event(core, message);
            core.check_ready(Some(message));
            true
        }
        MessageId::SetupFailed => {
            tracing::error!(module = message.arg1, reason = message.arg2, "module channel failed");
            core.pending_event = EventCode::ConnectionFailed;
            core.transfer_state(SessionState::Disconnecting);
            true
        }
        MessageId::Disconnect | MessageId::ConnectTimeout | MessageId::Error => {
            core.shared.queue.remove(MessageId::ConnectTimeout);
            process_state_event(core, message);
            core.transfer_state(SessionState::Disconnecting);
            true
        }
        MessageId::PeerRenderReady => {
            let established = core.controller.as_ref().is_some_and(|c| c.is_established());
            if core.cast_mode == CastMode::Stream && established {
                core.transfer_state(SessionState::Stream);
            } else {
                tracing::debug!("render ready before stream setup, ignored");
            }
            true
        }
        _ => false,
    }
}

fn connected(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::SetupSuccess => {
            if core.state == SessionState::Connected {
                let target = match core.cast_mode {
                    CastMode::Mirror => SessionState::Paused,
                    CastMode::Stream => SessionState::Stream,
                };
                core.transfer_state(target);
            } else {
                process_state_event(core, message);
            }
            true
        }
        MessageId::Connect => {
            let device_id = message.str_arg.as_str();
            if core.shared.devices.contains(device_id) {
                tracing::info!(device_id, "already connected, re-reporting");
                core.notify_device(device_id, DeviceState::Connected, EventCode::None);
                if core.state != SessionState::Paused {
                    core.transfer_state(SessionState::Paused);
                }
            } else {
                tracing::warn!(device_id, "session busy with another device");
                core.shared.listeners.notify_device_state(
                    DeviceState::Disconnected,
                    device_id,
                    EventCode::SessionBusy,
                );
            }
            true
        }
        MessageId::UpdateFeatures => {
            core.update_features(message);
            true
        }
        MessageId::Play | MessageId::PlayReq if core.state == SessionState::Connected => {
            core.defer(message.clone());
            true
        }
        MessageId::Disconnect | MessageId::ConnectTimeout | MessageId::Error => {
            process_state_event(core, message);
            core.transfer_state(SessionState::Disconnecting);
            true
        }
        _ => false,
    }
}

fn paused(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::Play => {
            if process_state_event(core, message) {
                core.transfer_state(SessionState::Playing);
            }
            true
        }
        MessageId::PlayReq | MessageId::SetupSuccess => {
            process_state_event(core, message);
            if core.is_allow_transfer_state(SessionState::Playing) {
                core.transfer_state(SessionState::Playing);
            }
            true
        }
        MessageId::ProcessTriggerReq => {
            process_state_event(core, message);
            true
        }
        _ => false,
    }
}

fn playing(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::Pause => {
            if process_state_event(core, message) {
                core.transfer_state(SessionState::Paused);
            }
            true
        }
        MessageId::PauseReq => {
            process_state_event(core, message);
            core.transfer_state(SessionState::Paused);
            true
        }
        MessageId::Play | MessageId::PlayReq => {
            tracing::debug!("already playing");
            true
        }
        MessageId::SetCastMode => {
            core.set_cast_mode(message);
            true
        }
        _ => false,
    }
}

fn stream(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::StreamChannelCreate => {
            let Ok(port) = u16::try_from(message.arg1) else {
                tracing::warn!(port = message.arg1, "invalid stream port");
                return true;
            };
            if let Some(bound) = dispatch::create_stream_channel(core, port)
                && port == 0
            {
                let action = serde_json::json!({ "streamPort": bound }).to_string();
                let announce = Message::new(MessageId::StreamSendActionEventToPeers).with_str(action);
                send_stream_action(core, &announce);
            }
            true
        }
        MessageId::StreamRecvActionEventFromPeers => {
            dispatch::stream_manager_action(core, &message.str_arg);
            true
        }
        MessageId::StreamSendActionEventToPeers => {
            send_stream_action(core, message);
            true
        }
        MessageId::PeerRenderReady => {
            process_state_event(core, message);
            true
        }
        _ => false,
    }
}

fn send_stream_action(core: &mut SessionCore, message: &Message) {
    let Some(controller) = core.controller.as_mut() else {
        tracing::warn!("no negotiation running, stream action dropped");
        return;
    };
    match controller.send_parameter("cast_stream_action", &message.str_arg) {
        Ok(()) => {}
        Err(CastError::RequestPending(_)) => core.stall(message),
        Err(e) => tracing::warn!(error = %e, "stream action not sent"),
    }
}

fn disconnecting(core: &mut SessionCore, message: &Message) -> bool {
    match message.id {
        MessageId::Connect => {
            core.defer(message.clone());
            true
        }
        _ => false,
    }
}
