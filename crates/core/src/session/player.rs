//! Player façades.
//!
//! The media pipelines live outside this crate. A [`MirrorRenderer`] is the
//! embedding application's mirror pipeline; a [`StreamManager`] drives URL
//! projection. Both receive channel data and state hooks from the session,
//! and [`MirrorPlayer`] turns player calls into session messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::channel::ModuleType;
use crate::error::{CastError, Result};
use crate::session::handle::SessionHandle;
use crate::session::message::{Message, MessageId};

/// External mirror pipeline.
pub trait MirrorRenderer: Send + Sync {
    fn set_surface(&self, surface: &str);
    /// Playback started (`true`) or paused (`false`).
    fn on_playback(&self, playing: bool);
    fn on_media_data(&self, module: ModuleType, data: &[u8]);
}

/// External stream (URL projection) controller.
pub trait StreamManager: Send + Sync {
    /// Advertised as `cast_player_capability` during negotiation.
    fn player_capability(&self) -> String;
    fn on_peer_action(&self, action: &str);
    fn on_render_ready(&self);
    fn on_stream_data(&self, data: &[u8]);
}

/// Mirror player bound to one session.
pub struct MirrorPlayer {
    session: SessionHandle,
    renderer: Arc<dyn MirrorRenderer>,
    released: AtomicBool,
}

impl MirrorPlayer {
    pub(crate) fn new(session: SessionHandle, renderer: Arc<dyn MirrorRenderer>) -> Self {
        MirrorPlayer {
            session,
            renderer,
            released: AtomicBool::new(false),
        }
    }

    pub fn play(&self) -> Result<()> {
        self.post(Message::new(MessageId::Play))
    }

    pub fn pause(&self) -> Result<()> {
        self.post(Message::new(MessageId::Pause))
    }

    pub fn set_surface(&self, surface: &str) -> Result<()> {
        self.post(Message::new(MessageId::SetSurface).with_str(surface))
    }

    /// Forward an input event to the source over the remote-control
    /// channel.
    pub fn deliver_input_event(&self, event: &str) -> Result<()> {
        self.post(Message::new(MessageId::DeliverInputEvent).with_str(event))
    }

    /// Detach the renderer from the session. Later calls fail.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.session.shared() {
            let current = shared.renderer();
            if current.is_some_and(|r| Arc::ptr_eq(&r, &self.renderer)) {
                shared.set_renderer(None);
            }
        }
        tracing::debug!("mirror player released");
    }

    fn post(&self, message: Message) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CastError::InvalidRequest(
                "mirror player released".to_string(),
            ));
        }
        self.session.post(message)
    }
}

impl Drop for MirrorPlayer {
    fn drop(&mut self) {
        self.release();
    }
}
