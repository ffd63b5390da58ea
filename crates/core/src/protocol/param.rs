//! Negotiated media and capability parameters.
//!
//! Parameters travel as a `text/parameters` body, one `key: value` per line:
//!
//! ```text
//! cast_version: 2
//! cast_vtp_support: 2
//! cast_video_format: H264,1920,1080,60
//! cast_audio_format: AAC,48000,2
//! cast_window: 1920,1080
//! cast_device_type: 1,3
//! cast_feature_set: 1,2,5
//! cast_player_capability: {"hdr":false}
//! cast_projection_mode: mirror
//! cast_media_port: 393222150
//! cast_rc_port: 6004
//! ```
//!
//! On a SoftBus link the media ports share one field (see
//! [`get_media_port`]); other links carry `cast_video_port` and
//! `cast_audio_port` separately.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::channel::LinkType;
use crate::error::{CastError, ParseErrorKind, Result};
use crate::session::CastMode;

/// Current negotiation version.
pub const PROTOCOL_VERSION: u32 = 2;

/// Bit width of one port inside a packed media port.
pub const SOCKET_PORT_BITS: u32 = 16;
/// Mask selecting the audio (low) half of a packed media port.
pub const SOCKET_PORT_MASK: u32 = 0xFFFF;

/// Well-known capability flags.
pub mod feature {
    /// Peer may drive the source through the remote-control channel.
    pub const REMOTE_CONTROL: u32 = 1;
    /// Stream (URL/player) projection in addition to mirroring.
    pub const STREAM_MODE: u32 = 2;
    /// Double-frame rendering on capable devices.
    pub const DOUBLE_FRAME: u32 = 3;
    /// Feature set may be renegotiated after setup.
    pub const CUSTOM_PARAMS: u32 = 4;
    /// Sink reports render-ready before playback.
    pub const RENDER_READY: u32 = 5;
}

/// VTP support tier advertised by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VtpSupport {
    #[default]
    None = 0,
    Basic = 1,
    /// Separate audio/video ports packed in a single field.
    SplitPort = 2,
}

impl VtpSupport {
    fn from_code(code: u32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Basic,
            _ => Self::SplitPort,
        }
    }
}

/// Set of integer capability flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet(BTreeSet<u32>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, feature: u32) -> bool {
        self.0.insert(feature)
    }

    pub fn remove(&mut self, feature: u32) -> bool {
        self.0.remove(&feature)
    }

    pub fn contains(&self, feature: u32) -> bool {
        self.0.contains(&feature)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Features present in both sets.
    pub fn intersect(&self, other: &FeatureSet) -> FeatureSet {
        FeatureSet(self.0.intersection(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<u32> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        FeatureSet(iter.into_iter().collect())
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", joined.join(","))
    }
}

impl FromStr for FeatureSet {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| f.parse::<u32>().map_err(|_| invalid(s)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoProperty {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoProperty {
    fn default() -> Self {
        Self {
            codec: "H264".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioProperty {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
}

impl Default for AudioProperty {
    fn default() -> Self {
        Self {
            codec: "AAC".to_string(),
            sample_rate: 48000,
            channels: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowProperty {
    pub width: u32,
    pub height: u32,
}

/// Device category codes exchanged in `cast_device_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Unknown = 0,
    Phone = 1,
    Tablet = 2,
    Tv = 3,
    Pc = 4,
    Car = 5,
}

impl DeviceType {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Phone,
            2 => Self::Tablet,
            3 => Self::Tv,
            4 => Self::Pc,
            5 => Self::Car,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceTypePair {
    pub local: DeviceType,
    pub peer: DeviceType,
}

/// Video and audio ports of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaPort {
    pub video: u16,
    pub audio: u16,
}

/// Pack `video` into the upper and `audio` into the lower 16 bits.
pub fn pack_media_port(port: MediaPort) -> u32 {
    ((port.video as u32) << SOCKET_PORT_BITS) | (port.audio as u32 & SOCKET_PORT_MASK)
}

/// Decode the single media-port field of a SoftBus link.
///
/// With split ports the value is packed (`video = high16`, `audio = low16`);
/// without, both media share the one port. Other links carry independent
/// ports and never use the packed field.
pub fn get_media_port(link_type: LinkType, split: bool, port: u32) -> MediaPort {
    match link_type {
        LinkType::SoftBus if split => MediaPort {
            video: (port >> SOCKET_PORT_BITS) as u16,
            audio: (port & SOCKET_PORT_MASK) as u16,
        },
        _ => MediaPort {
            video: port as u16,
            audio: port as u16,
        },
    }
}

/// Proposed or negotiated session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub version: u32,
    pub vtp_support: VtpSupport,
    pub video: VideoProperty,
    pub audio: AudioProperty,
    pub window: WindowProperty,
    pub device_type: DeviceTypePair,
    pub features: FeatureSet,
    pub player_capability: String,
    pub projection_mode: CastMode,
    pub media_port: MediaPort,
    pub rc_port: u16,
}

impl Default for ParamInfo {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            vtp_support: VtpSupport::None,
            video: VideoProperty::default(),
            audio: AudioProperty::default(),
            window: WindowProperty::default(),
            device_type: DeviceTypePair::default(),
            features: FeatureSet::new(),
            player_capability: String::new(),
            projection_mode: CastMode::Mirror,
            media_port: MediaPort::default(),
            rc_port: 0,
        }
    }
}

impl ParamInfo {
    /// Whether this side packs split media ports on a SoftBus link.
    pub fn split_ports(&self) -> bool {
        self.vtp_support >= VtpSupport::SplitPort
    }

    /// Encode as a `text/parameters` body for `link_type`.
    pub fn encode(&self, link_type: LinkType) -> String {
        let mut lines = vec![
            format!("cast_version: {}", self.version),
            format!("cast_vtp_support: {}", self.vtp_support as u32),
            format!(
                "cast_video_format: {},{},{},{}",
                self.video.codec, self.video.width, self.video.height, self.video.fps
            ),
            format!(
                "cast_audio_format: {},{},{}",
                self.audio.codec, self.audio.sample_rate, self.audio.channels
            ),
            format!("cast_window: {},{}", self.window.width, self.window.height),
            format!(
                "cast_device_type: {},{}",
                self.device_type.local as u32, self.device_type.peer as u32
            ),
            format!("cast_feature_set: {}", self.features),
            format!("cast_projection_mode: {}", self.projection_mode),
        ];
        if !self.player_capability.is_empty() {
            lines.push(format!("cast_player_capability: {}", self.player_capability));
        }
        match link_type {
            LinkType::SoftBus => {
                let port = if self.split_ports() {
                    pack_media_port(self.media_port)
                } else {
                    self.media_port.video as u32
                };
                lines.push(format!("cast_media_port: {port}"));
            }
            LinkType::Tcp | LinkType::Vtp => {
                lines.push(format!("cast_video_port: {}", self.media_port.video));
                lines.push(format!("cast_audio_port: {}", self.media_port.audio));
            }
        }
        if self.rc_port != 0 {
            lines.push(format!("cast_rc_port: {}", self.rc_port));
        }
        format!("{}\r\n", lines.join("\r\n"))
    }

    /// Decode a `text/parameters` body received over `link_type`.
    ///
    /// `cast_version` and `cast_projection_mode` are required.
    pub fn decode(body: &str, link_type: LinkType) -> Result<Self> {
        let mut info = ParamInfo::default();
        let mut version = None;
        let mut mode = None;
        let mut packed_port = None;

        for (key, value) in parameter_lines(body)? {
            match key {
                "cast_version" => version = Some(parse_num(value)?),
                "cast_vtp_support" => info.vtp_support = VtpSupport::from_code(parse_num(value)?),
                "cast_video_format" => {
                    let f = fields::<4>(value)?;
                    info.video = VideoProperty {
                        codec: f[0].to_string(),
                        width: parse_num(f[1])?,
                        height: parse_num(f[2])?,
                        fps: parse_num(f[3])?,
                    };
                }
                "cast_audio_format" => {
                    let f = fields::<3>(value)?;
                    info.audio = AudioProperty {
                        codec: f[0].to_string(),
                        sample_rate: parse_num(f[1])?,
                        channels: parse_num(f[2])?,
                    };
                }
                "cast_window" => {
                    let f = fields::<2>(value)?;
                    info.window = WindowProperty {
                        width: parse_num(f[0])?,
                        height: parse_num(f[1])?,
                    };
                }
                "cast_device_type" => {
                    let f = fields::<2>(value)?;
                    info.device_type = DeviceTypePair {
                        local: DeviceType::from_code(parse_num(f[0])?),
                        peer: DeviceType::from_code(parse_num(f[1])?),
                    };
                }
                "cast_feature_set" => info.features = value.parse()?,
                "cast_player_capability" => info.player_capability = value.to_string(),
                "cast_projection_mode" => mode = Some(value.parse::<CastMode>()?),
                "cast_media_port" => packed_port = Some(parse_num::<u32>(value)?),
                "cast_video_port" => info.media_port.video = parse_num(value)?,
                "cast_audio_port" => info.media_port.audio = parse_num(value)?,
                "cast_rc_port" => info.rc_port = parse_num(value)?,
                other => tracing::debug!(key = other, "ignoring unknown parameter"),
            }
        }

        info.version = version.ok_or(CastError::Parse {
            kind: ParseErrorKind::MissingParameter("cast_version"),
        })?;
        info.projection_mode = mode.ok_or(CastError::Parse {
            kind: ParseErrorKind::MissingParameter("cast_projection_mode"),
        })?;
        if let (LinkType::SoftBus, Some(port)) = (link_type, packed_port) {
            info.media_port = get_media_port(link_type, info.split_ports(), port);
        }
        Ok(info)
    }
}

/// Split a parameter body into (key, value) pairs.
pub fn parameter_lines(body: &str) -> Result<Vec<(&str, &str)>> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| invalid(line))
        })
        .collect()
}

fn fields<const N: usize>(value: &str) -> Result<[&str; N]> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    parts.try_into().map_err(|_| invalid(value))
}

fn parse_num<T: FromStr>(value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(value))
}

fn invalid(value: &str) -> CastError {
    CastError::Parse {
        kind: ParseErrorKind::InvalidParameter(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(list: &[u32]) -> FeatureSet {
        list.iter().copied().collect()
    }

    #[test]
    fn packed_port_layout_is_video_high_audio_low() {
        let port = MediaPort {
            video: 0x1F90,
            audio: 0x1F91,
        };
        let packed = pack_media_port(port);
        assert_eq!(packed, 0x1F90_1F91);
        assert_eq!(get_media_port(LinkType::SoftBus, true, packed), port);
    }

    #[test]
    fn packed_port_round_trip_extremes() {
        for (video, audio) in [(0u16, 0u16), (u16::MAX, 0), (0, u16::MAX), (u16::MAX, u16::MAX)] {
            let port = MediaPort { video, audio };
            assert_eq!(
                get_media_port(LinkType::SoftBus, true, pack_media_port(port)),
                port
            );
        }
    }

    #[test]
    fn unsplit_softbus_port_is_shared() {
        let port = get_media_port(LinkType::SoftBus, false, 7000);
        assert_eq!(port, MediaPort { video: 7000, audio: 7000 });
    }

    #[test]
    fn feature_intersection_is_commutative_and_idempotent() {
        let local = features(&[1, 2, 3, 5]);
        let peer = features(&[2, 3, 4]);
        let negotiated = local.intersect(&peer);
        assert_eq!(negotiated, peer.intersect(&local));
        assert_eq!(negotiated.intersect(&peer), negotiated);
        assert_eq!(negotiated, features(&[2, 3]));
    }

    #[test]
    fn feature_set_text_form() {
        let set: FeatureSet = " 5, 1 ,3".parse().unwrap();
        assert_eq!(set.to_string(), "1,3,5");
        assert!("".parse::<FeatureSet>().unwrap().is_empty());
        assert!("1,x".parse::<FeatureSet>().is_err());
    }

    #[test]
    fn softbus_encoding_packs_ports_when_split() {
        let info = ParamInfo {
            vtp_support: VtpSupport::SplitPort,
            media_port: MediaPort {
                video: 6001,
                audio: 6002,
            },
            features: features(&[feature::REMOTE_CONTROL]),
            ..Default::default()
        };
        let body = info.encode(LinkType::SoftBus);
        assert!(body.contains(&format!("cast_media_port: {}", (6001u32 << 16) | 6002)));
        assert!(!body.contains("cast_video_port"));

        let decoded = ParamInfo::decode(&body, LinkType::SoftBus).unwrap();
        assert_eq!(decoded.media_port, info.media_port);
        assert_eq!(decoded.features, info.features);
    }

    #[test]
    fn tcp_encoding_keeps_ports_independent() {
        let info = ParamInfo {
            media_port: MediaPort {
                video: 40000,
                audio: 40002,
            },
            rc_port: 40004,
            projection_mode: CastMode::Stream,
            player_capability: "{\"hdr\":true}".to_string(),
            ..Default::default()
        };
        let decoded = ParamInfo::decode(&info.encode(LinkType::Tcp), LinkType::Tcp).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn decode_requires_version_and_mode() {
        let err = ParamInfo::decode("cast_projection_mode: mirror\r\n", LinkType::Tcp).unwrap_err();
        assert!(matches!(
            err,
            CastError::Parse {
                kind: ParseErrorKind::MissingParameter("cast_version")
            }
        ));
        let err = ParamInfo::decode("cast_version: 2\r\n", LinkType::Tcp).unwrap_err();
        assert!(matches!(
            err,
            CastError::Parse {
                kind: ParseErrorKind::MissingParameter("cast_projection_mode")
            }
        ));
    }

    #[test]
    fn decode_rejects_malformed_lines() {
        assert!(ParamInfo::decode("cast_version 2", LinkType::Tcp).is_err());
        assert!(
            ParamInfo::decode(
                "cast_version: 2\r\ncast_projection_mode: mirror\r\ncast_window: 10",
                LinkType::Tcp
            )
            .is_err()
        );
    }
}
