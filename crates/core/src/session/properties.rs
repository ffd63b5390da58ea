use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::channel::LinkType;
use crate::error::{CastError, ParseErrorKind, Result};

/// What the session projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastMode {
    /// Screen mirroring.
    #[default]
    Mirror,
    /// URL/player projection driven by a stream manager.
    Stream,
}

impl CastMode {
    pub fn code(self) -> i32 {
        match self {
            Self::Mirror => 0,
            Self::Stream => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Mirror),
            1 => Some(Self::Stream),
            _ => None,
        }
    }
}

impl fmt::Display for CastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mirror => f.write_str("mirror"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

impl FromStr for CastMode {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "mirror" => Ok(Self::Mirror),
            "stream" => Ok(Self::Stream),
            other => Err(CastError::Parse {
                kind: ParseErrorKind::InvalidParameter(other.to_string()),
            }),
        }
    }
}

/// Consult data the source hands to the sink out of band, before the
/// negotiation channel exists.
///
/// ```json
/// {"sessionId":1234,"deviceId":"phone","ipAddress":"192.168.1.5",
///  "rtspPort":40123,"sessionKey":"q83v...","castMode":"mirror","linkType":"tcp"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionProperties {
    pub session_id: u32,
    /// The source's device id.
    pub device_id: String,
    pub ip_address: String,
    pub rtsp_port: u16,
    /// Base64 session key.
    pub session_key: String,
    pub cast_mode: CastMode,
    pub link_type: LinkType,
}

impl SessionProperties {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Session properties slot with a bounded wait for the first value.
#[derive(Default)]
pub(crate) struct PropertiesSlot {
    value: Mutex<Option<SessionProperties>>,
    available: Condvar,
}

impl PropertiesSlot {
    pub(crate) fn set(&self, properties: SessionProperties) {
        *self.value.lock() = Some(properties);
        self.available.notify_all();
    }

    pub(crate) fn get(&self) -> Option<SessionProperties> {
        self.value.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.value.lock().take();
    }

    /// Wait up to `timeout` for properties to be set.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<SessionProperties> {
        let mut value = self.value.lock();
        if value.is_none() {
            self.available
                .wait_while_for(&mut value, |v| v.is_none(), timeout);
        }
        value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn consult_json_uses_camel_case_keys() {
        let props = SessionProperties {
            session_id: 7,
            device_id: "phone".into(),
            rtsp_port: 40123,
            session_key: "a2V5".into(),
            cast_mode: CastMode::Stream,
            ..Default::default()
        };
        let json = props.to_json().unwrap();
        assert!(json.contains("\"rtspPort\":40123"));
        assert!(json.contains("\"castMode\":\"stream\""));
        assert!(json.contains("\"linkType\":\"tcp\""));
        assert_eq!(SessionProperties::from_json(&json).unwrap(), props);
    }

    #[test]
    fn missing_consult_fields_default() {
        let props = SessionProperties::from_json(r#"{"rtspPort":9}"#).unwrap();
        assert_eq!(props.rtsp_port, 9);
        assert_eq!(props.cast_mode, CastMode::Mirror);
        assert!(SessionProperties::from_json("{").is_err());
    }

    #[test]
    fn wait_times_out_then_sees_late_value() {
        let slot = Arc::new(PropertiesSlot::default());
        assert!(slot.wait(Duration::from_millis(10)).is_none());

        let setter = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                slot.set(SessionProperties {
                    rtsp_port: 1,
                    ..Default::default()
                });
            })
        };
        let props = slot.wait(Duration::from_secs(2));
        setter.join().unwrap();
        assert_eq!(props.map(|p| p.rtsp_port), Some(1));
    }
}
