//! Error types for the cast session engine.

use std::fmt;

use crate::channel::{LinkType, ModuleType};

/// Errors returned by the cast session engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Precondition**: [`NoListener`](Self::NoListener),
///   [`DeviceNotFound`](Self::DeviceNotFound), [`DeviceExists`](Self::DeviceExists),
///   [`InvalidRequest`](Self::InvalidRequest),
///   [`PropertiesTimeout`](Self::PropertiesTimeout).
/// - **Protocol**: [`Parse`](Self::Parse), [`RequestPending`](Self::RequestPending),
///   [`ProtocolState`](Self::ProtocolState).
/// - **Transport**: [`Io`](Self::Io), [`ConnectionUnavailable`](Self::ConnectionUnavailable),
///   [`ChannelNotFound`](Self::ChannelNotFound).
/// - **Session**: [`SessionClosed`](Self::SessionClosed).
#[derive(Debug, thiserror::Error)]
pub enum CastError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Consult data or event payload was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to parse a negotiation message.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The device manager does not know the device.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device is already part of this session.
    #[error("device already in session: {0}")]
    DeviceExists(String),

    /// No session listener registered within the wait window.
    #[error("no session listener registered")]
    NoListener,

    /// The peer never supplied session properties within the wait window.
    #[error("timed out waiting for peer session properties")]
    PropertiesTimeout,

    /// A request was rejected before any state mutation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No connection implementation registered for the link type.
    #[error("no connection registered for link type {0:?}")]
    ConnectionUnavailable(LinkType),

    /// No live channel for the module type.
    #[error("channel not found: {0:?}")]
    ChannelNotFound(ModuleType),

    /// A negotiation request is already awaiting its response.
    #[error("request already pending: {0}")]
    RequestPending(String),

    /// Operation not allowed in the protocol controller's current state.
    #[error("protocol controller is {actual}, expected {expected}")]
    ProtocolState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The session's message loop has stopped.
    #[error("session closed")]
    SessionClosed,
}

/// Specific kind of negotiation parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A parameter body line was malformed or had an unparseable value.
    InvalidParameter(String),
    /// A required parameter was absent.
    MissingParameter(&'static str),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidParameter(line) => write!(f, "invalid parameter `{line}`"),
            Self::MissingParameter(name) => write!(f, "missing parameter `{name}`"),
        }
    }
}

/// Event code attached to device-state notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum EventCode {
    #[default]
    None = 0,
    /// Connect attempt failed or timed out.
    ConnectionFailed = 1001,
    /// Negotiation failed or the peer sent a malformed message.
    ProtocolError = 1002,
    /// A channel reported a transport error.
    TransportError = 1003,
    /// The device manager could not resolve the device.
    DeviceNotFound = 1004,
    /// The peer tore the session down.
    PeerDisconnected = 1005,
    /// The session is already casting to another device.
    SessionBusy = 1006,
}

impl EventCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1001 => Self::ConnectionFailed,
            1002 => Self::ProtocolError,
            1003 => Self::TransportError,
            1004 => Self::DeviceNotFound,
            1005 => Self::PeerDisconnected,
            1006 => Self::SessionBusy,
            _ => Self::None,
        }
    }
}

/// Convenience alias for `Result<T, CastError>`.
pub type Result<T> = std::result::Result<T, CastError>;
