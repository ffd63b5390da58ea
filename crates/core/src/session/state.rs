use std::fmt;

/// States of the session state machine.
///
/// ```text
/// Default
/// ├── Disconnected
/// ├── Authing
/// ├── Connecting
/// ├── Connected
/// │   ├── Paused
/// │   ├── Playing
/// │   └── Stream
/// └── Disconnecting
/// ```
///
/// A message the active state does not handle is offered to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Default,
    Disconnected,
    Authing,
    Connecting,
    Connected,
    Paused,
    Playing,
    Stream,
    Disconnecting,
}

impl SessionState {
    pub fn parent(self) -> Option<SessionState> {
        match self {
            Self::Default => None,
            Self::Paused | Self::Playing | Self::Stream => Some(Self::Connected),
            _ => Some(Self::Default),
        }
    }

    /// This state followed by its ancestors, innermost first.
    pub fn chain(self) -> Vec<SessionState> {
        std::iter::successors(Some(self), |s| s.parent()).collect()
    }

    /// Whether `self` is `other` or one of its descendants.
    pub fn is_within(self, other: SessionState) -> bool {
        self.chain().contains(&other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Disconnected => "disconnected",
            Self::Authing => "authing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Paused => "paused",
            Self::Playing => "playing",
            Self::Stream => "stream",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
