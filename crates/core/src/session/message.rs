use crate::error::EventCode;

/// Identifies what a [`Message`] asks the state machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Connect,
    Auth,
    /// The negotiation channel opened; start negotiating.
    Setup,
    /// A module channel opened (`arg1` = module code), or the session is
    /// fully set up when replayed.
    SetupSuccess,
    /// A module channel failed to open (`arg1` = module code).
    SetupFailed,
    /// Negotiation finished; negotiated parameters are available.
    SetupDone,
    Play,
    Pause,
    /// The peer asked to play.
    PlayReq,
    /// The peer asked to pause.
    PauseReq,
    Disconnect,
    ConnectTimeout,
    Error,
    ProcessTriggerReq,
    PeerRenderReady,
    /// `arg1` = cast mode code, `arg2` = 1 when the peer initiated it.
    SetCastMode,
    StreamRecvActionEventFromPeers,
    StreamSendActionEventToPeers,
    /// `arg1` = remote port to connect to, 0 to listen.
    StreamChannelCreate,
    SetSurface,
    DeliverInputEvent,
    /// Inbound negotiation bytes in `str_arg`.
    RtspData,
    /// Propose the feature set in `str_arg` (comma list) after setup.
    UpdateFeatures,
}

/// The unit of work posted to a session's message loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub arg1: i32,
    pub arg2: i32,
    pub str_arg: String,
    pub event_code: EventCode,
}

impl Message {
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            arg1: 0,
            arg2: 0,
            str_arg: String::new(),
            event_code: EventCode::None,
        }
    }

    pub fn with_args(mut self, arg1: i32, arg2: i32) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    pub fn with_str(mut self, str_arg: impl Into<String>) -> Self {
        self.str_arg = str_arg.into();
        self
    }

    pub fn with_event(mut self, event_code: EventCode) -> Self {
        self.event_code = event_code;
        self
    }
}
