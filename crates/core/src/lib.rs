//! Session layer of a casting engine.
//!
//! A [`Session`] drives one cast between a source and a sink: it opens the
//! channels the cast needs through a [`ChannelManager`], negotiates
//! parameters with an RTSP-style [`ProtocolController`], and reports device
//! state changes to registered [`SessionListener`]s.

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod session;

pub use channel::{ChannelManager, ConnectionRegistry, LinkType, ModuleType};
pub use config::{SessionConfig, SessionRole};
pub use device::{DeviceManager, DeviceRegistry, DeviceState, RemoteDevice, RemoteDeviceInfo};
pub use error::{CastError, EventCode, Result};
pub use protocol::{ParamInfo, ProtocolController};
pub use session::{
    CastMode, MirrorPlayer, MirrorRenderer, Session, SessionListener, SessionProperties,
    SessionState, StreamManager,
};
