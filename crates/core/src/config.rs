use std::sync::Arc;
use std::time::Duration;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::channel::{DeviceSnapshot, LinkType};
use crate::protocol::ParamInfo;
use crate::session::CastMode;

/// Default bound on a connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default wait for a session listener before `add_device` fails.
pub const DEFAULT_LISTENER_WAIT: Duration = Duration::from_secs(5);
/// Default wait for peer session properties before a sink connects.
pub const DEFAULT_PROPERTIES_WAIT: Duration = Duration::from_secs(1);

const SESSION_KEY_LEN: usize = 16;

/// Which end of the cast this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Projects its screen or media; listens and offers.
    Source,
    /// Renders what the source sends; connects and answers.
    Sink,
}

/// Source of session ids and session keys.
pub trait IdGenerator: Send + Sync {
    fn session_id(&self) -> u32;
    /// Base64 session key.
    fn session_key(&self) -> String;
}

/// [`IdGenerator`] backed by the thread-local RNG.
#[derive(Debug, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn session_id(&self) -> u32 {
        // Kept positive so the id survives as a signed integer on the peer.
        rand::random::<u32>() & 0x7FFF_FFFF
    }

    fn session_key(&self) -> String {
        let key: [u8; SESSION_KEY_LEN] = rand::random();
        BASE64_STANDARD.encode(key)
    }
}

/// Session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    pub role: SessionRole,
    /// This device. `port` is unused.
    pub local_device: DeviceSnapshot,
    pub link_type: LinkType,
    pub cast_mode: CastMode,
    /// Bound on a connect attempt, from CONNECT until Connected.
    pub connect_timeout: Duration,
    /// How long `add_device` waits for a registered listener.
    pub listener_wait: Duration,
    /// How long a sink waits for the source's session properties.
    pub properties_wait: Duration,
    /// Parameters proposed (source) or answered (sink) during negotiation.
    /// Media and remote-control ports are filled in by the session.
    pub local_params: ParamInfo,
    pub id_generator: Arc<dyn IdGenerator>,
}

impl SessionConfig {
    pub fn new(role: SessionRole, local_device_id: &str) -> Self {
        SessionConfig {
            role,
            local_device: DeviceSnapshot {
                device_id: local_device_id.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: SessionRole::Source,
            local_device: DeviceSnapshot::default(),
            link_type: LinkType::Tcp,
            cast_mode: CastMode::Mirror,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            listener_wait: DEFAULT_LISTENER_WAIT,
            properties_wait: DEFAULT_PROPERTIES_WAIT,
            local_params: ParamInfo::default(),
            id_generator: Arc::new(RandomIdGenerator),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("role", &self.role)
            .field("local_device", &self.local_device)
            .field("link_type", &self.link_type)
            .field("cast_mode", &self.cast_mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("listener_wait", &self.listener_wait)
            .field("properties_wait", &self.properties_wait)
            .field("local_params", &self.local_params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_keys_decode_to_sixteen_bytes() {
        let generator = RandomIdGenerator;
        let key = generator.session_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), SESSION_KEY_LEN);
        assert_ne!(key, generator.session_key());
        assert!(generator.session_id() <= i32::MAX as u32);
    }

    #[test]
    fn defaults_match_documented_waits() {
        let config = SessionConfig::new(SessionRole::Sink, "tv");
        assert_eq!(config.local_device.device_id, "tv");
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert_eq!(config.listener_wait, Duration::from_secs(5));
        assert_eq!(config.properties_wait, Duration::from_secs(1));
    }
}
