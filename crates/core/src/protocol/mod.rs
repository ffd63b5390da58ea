//! Session negotiation protocol.
//!
//! An RTSP/1.0-style offer/answer exchange over the session's `Rtsp`
//! channel. The text syntax follows RFC 2326 (request or status line,
//! `Name: value` headers, blank line, `Content-Length` body) but the
//! method semantics are this engine's own:
//!
//! ```text
//! offerer                                    responder
//!    │── OPTIONS * (Require: org.cast.session) ──▶│
//!    │◀──────────────── 200 (Public) ─────────────│
//!    │── SETUP (Session-Key, text/parameters) ───▶│  on_setup
//!    │◀──── 200 (Session, text/parameters) ───────│
//! on_setup
//!    │── PLAY / PAUSE / SET_PARAMETER ───────────▶│  on_play / on_pause / ...
//!    │── TEARDOWN ───────────────────────────────▶│  on_teardown
//! ```
//!
//! | Method | Purpose |
//! |--------|---------|
//! | OPTIONS | Capability query before the offer |
//! | SETUP | Offer/answer of [`ParamInfo`] |
//! | PLAY, PAUSE | Playback intent, either direction |
//! | TEARDOWN | End the negotiation |
//! | GET_PARAMETER | Keepalive or query of negotiated keys |
//! | SET_PARAMETER | Trigger, feature update, stream action, cast mode |

pub mod controller;
pub mod param;
pub mod request;
pub mod response;

pub use controller::{Action, ControllerRole, ControllerState, ProtocolController, ProtocolListener};
pub use param::{
    FeatureSet, MediaPort, ParamInfo, VtpSupport, feature, get_media_port, pack_media_port,
};
pub use request::RtspRequest;
pub use response::RtspResponse;
