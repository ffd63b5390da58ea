use std::sync::Arc;

use crate::channel::{Channel, LinkType, ModuleType};
use crate::error::{CastError, ParseErrorKind, Result};
use crate::protocol::param::{self, FeatureSet, MediaPort, ParamInfo, feature};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;

const REQUIRE_TAG: &str = "org.cast.session";
const PUBLIC_METHODS: &str = "OPTIONS, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER";
const PARAMETERS_CONTENT_TYPE: &str = "text/parameters";

/// Internal state of a [`ProtocolController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    /// Channel bound, handshake in progress.
    Started,
    /// SETUP completed on this side.
    Established,
    /// TEARDOWN sent, awaiting the answer.
    Stopping,
}

impl ControllerState {
    fn name(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Started => "started",
            Self::Established => "established",
            Self::Stopping => "stopping",
        }
    }
}

/// Which side of the handshake this controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRole {
    /// Sends OPTIONS and the SETUP offer.
    Offerer,
    /// Answers the offer.
    Responder,
}

/// Requests a caller can issue once the session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Play,
    Pause,
    Teardown,
}

impl Action {
    fn method(self) -> &'static str {
        match self {
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
        }
    }
}

/// Asynchronous negotiation events.
///
/// Called on the thread that feeds [`ProtocolController::on_data`].
pub trait ProtocolListener: Send + Sync {
    /// SETUP completed; `params` are the negotiated parameters.
    fn on_setup(&self, params: &ParamInfo);
    fn on_play(&self);
    fn on_pause(&self);
    fn on_teardown(&self);
    /// Reported at most once per negotiation.
    fn on_error(&self, error: &CastError);
    fn on_trigger(&self, method: &str);
    fn on_event(&self, key: &str, value: &str);
}

struct Awaiting {
    cseq: u32,
    method: String,
}

/// Listener calls produced while handling a request, delivered after the
/// response has been written.
enum Intent {
    Setup(ParamInfo),
    Play,
    Pause,
    Teardown,
    Trigger(String),
    Event(String, String),
    Error(CastError),
}

/// RTSP-style offer/answer exchange over one channel.
///
/// Holds at most one outstanding request. Both roles answer PLAY, PAUSE,
/// TEARDOWN and the parameter methods once established; only the responder
/// accepts SETUP.
pub struct ProtocolController {
    role: ControllerRole,
    link_type: LinkType,
    state: ControllerState,
    listener: Arc<dyn ProtocolListener>,
    channel: Option<Arc<dyn Channel>>,
    local: ParamInfo,
    negotiated: Option<ParamInfo>,
    session_id: String,
    session_key: String,
    next_cseq: u32,
    awaiting: Option<Awaiting>,
    /// CSeq of a request given up by TEARDOWN; its late answer is dropped.
    abandoned: Option<u32>,
    error_reported: bool,
}

impl ProtocolController {
    /// `session_id` is what a responder writes in the `Session` header; an
    /// offerer replaces it with the value the responder assigns.
    pub fn new(
        role: ControllerRole,
        link_type: LinkType,
        session_id: String,
        listener: Arc<dyn ProtocolListener>,
    ) -> Self {
        ProtocolController {
            role,
            link_type,
            state: ControllerState::Stopped,
            listener,
            channel: None,
            local: ParamInfo::default(),
            negotiated: None,
            session_id,
            session_key: String::new(),
            next_cseq: 1,
            awaiting: None,
            abandoned: None,
            error_reported: false,
        }
    }

    pub fn role(&self) -> ControllerRole {
        self.role
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ControllerState::Established
    }

    /// Whether a request is still waiting for its response.
    pub fn has_pending_request(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Bind `channel` and begin negotiating with `params` as the local
    /// proposal. An offerer sends OPTIONS immediately.
    ///
    /// On error the caller must tear the session down.
    pub fn start(
        &mut self,
        channel: Option<Arc<dyn Channel>>,
        params: ParamInfo,
        session_key: &str,
    ) -> Result<()> {
        self.expect_state(ControllerState::Stopped)?;
        let channel = channel.ok_or(CastError::ChannelNotFound(ModuleType::Rtsp))?;

        self.channel = Some(channel);
        self.local = params;
        self.session_key = session_key.to_string();
        self.negotiated = None;
        self.awaiting = None;
        self.abandoned = None;
        self.error_reported = false;
        self.state = ControllerState::Started;
        tracing::info!(role = ?self.role, link = ?self.link_type, "negotiation started");

        if self.role == ControllerRole::Offerer {
            let request = RtspRequest::new("OPTIONS", "*").add_header("Require", REQUIRE_TAG);
            self.send_request(request)?;
        }
        Ok(())
    }

    /// Send PLAY, PAUSE or TEARDOWN. PLAY and PAUSE are rejected with
    /// [`CastError::RequestPending`] while another request awaits its
    /// response; TEARDOWN abandons that request.
    pub fn action(&mut self, action: Action) -> Result<()> {
        self.expect_state(ControllerState::Established)?;
        if action == Action::Teardown
            && let Some(awaiting) = self.awaiting.take()
        {
            tracing::debug!(method = %awaiting.method, cseq = awaiting.cseq, "teardown abandons pending request");
            self.abandoned = Some(awaiting.cseq);
        }
        let request =
            RtspRequest::new(action.method(), &self.uri()).add_header("Session", &self.session_id);
        self.send_request(request)?;
        if action == Action::Teardown {
            self.state = ControllerState::Stopping;
        }
        Ok(())
    }

    /// Send one `SET_PARAMETER` key to the peer.
    pub fn send_parameter(&mut self, key: &str, value: &str) -> Result<()> {
        self.expect_state(ControllerState::Established)?;
        let request = RtspRequest::new("SET_PARAMETER", &self.uri())
            .add_header("Session", &self.session_id)
            .add_header("Content-Type", PARAMETERS_CONTENT_TYPE)
            .with_body(format!("{key}: {value}\r\n"));
        self.send_request(request)
    }

    /// Propose a new feature set after setup. Requires the custom-params
    /// feature to have been negotiated.
    pub fn renegotiate_features(&mut self, features: FeatureSet) -> Result<()> {
        if !self.is_support_feature(feature::CUSTOM_PARAMS) {
            return Err(CastError::InvalidRequest(
                "custom params not negotiated".to_string(),
            ));
        }
        self.send_parameter("cast_feature_set", &features.to_string())?;
        self.apply_features(&features);
        Ok(())
    }

    /// Release the channel and forget the negotiation.
    pub fn stop(&mut self) {
        if self.state == ControllerState::Stopped && self.channel.is_none() {
            return;
        }
        self.state = ControllerState::Stopping;
        self.awaiting = None;
        self.channel = None;
        self.negotiated = None;
        self.state = ControllerState::Stopped;
        tracing::info!(role = ?self.role, "negotiation stopped");
    }

    /// Whether `feature` is in the negotiated set. Always false before setup.
    pub fn is_support_feature(&self, feature: u32) -> bool {
        self.negotiated
            .as_ref()
            .is_some_and(|n| n.features.contains(feature))
    }

    /// Media ports of the listening (offering) side.
    pub fn get_media_port(&self) -> Option<MediaPort> {
        self.negotiated.as_ref().map(|n| n.media_port)
    }

    pub fn negotiated_params(&self) -> Option<&ParamInfo> {
        self.negotiated.as_ref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Feed one complete inbound message.
    pub fn on_data(&mut self, data: &[u8]) {
        if self.state == ControllerState::Stopped {
            tracing::debug!(len = data.len(), "negotiation stopped, dropping data");
            return;
        }
        let text = String::from_utf8_lossy(data);
        if text.starts_with("RTSP/") {
            match RtspResponse::parse(&text) {
                Ok(response) => self.handle_response(response),
                Err(e) => self.report_error(e),
            }
        } else {
            match RtspRequest::parse(&text) {
                Ok(request) => self.handle_request(request),
                Err(e) => self.report_error(e),
            }
        }
    }

    fn expect_state(&self, expected: ControllerState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CastError::ProtocolState {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }

    fn uri(&self) -> String {
        let host = self
            .channel
            .as_ref()
            .map(|c| c.request().remote_device.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        format!("rtsp://{host}/cast")
    }

    fn write(&self, text: &str) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(CastError::ChannelNotFound(ModuleType::Rtsp))?;
        channel.send(text.as_bytes())
    }

    fn send_request(&mut self, request: RtspRequest) -> Result<()> {
        if let Some(awaiting) = &self.awaiting {
            return Err(CastError::RequestPending(awaiting.method.clone()));
        }
        let cseq = self.next_cseq;
        let request = request.add_header("CSeq", &cseq.to_string());
        self.write(&request.serialize())?;
        self.next_cseq += 1;
        tracing::debug!(method = %request.method, cseq, "negotiation request sent");
        self.awaiting = Some(Awaiting {
            cseq,
            method: request.method,
        });
        Ok(())
    }

    fn report_error(&mut self, error: CastError) {
        if self.error_reported {
            tracing::debug!(%error, "negotiation error already reported");
            return;
        }
        self.error_reported = true;
        tracing::error!(role = ?self.role, %error, "negotiation failed");
        self.listener.on_error(&error);
    }

    fn apply_features(&mut self, features: &FeatureSet) {
        let updated = self.local.features.intersect(features);
        if let Some(negotiated) = self.negotiated.as_mut() {
            tracing::info!(features = %updated, "feature set renegotiated");
            negotiated.features = updated;
        }
    }

    fn handle_response(&mut self, response: RtspResponse) {
        let cseq = response.cseq().and_then(|c| c.trim().parse::<u32>().ok());
        if cseq.is_some() && cseq == self.abandoned {
            tracing::debug!(?cseq, "answer to abandoned request dropped");
            self.abandoned = None;
            return;
        }
        let Some(awaiting) = self.awaiting.take() else {
            self.report_error(CastError::InvalidRequest(format!(
                "unsolicited {} response",
                response.status_code
            )));
            return;
        };

        if cseq != Some(awaiting.cseq) {
            self.report_error(CastError::InvalidRequest(format!(
                "{} answered with CSeq {:?}, expected {}",
                awaiting.method, cseq, awaiting.cseq
            )));
            return;
        }
        if !response.is_success() {
            self.report_error(CastError::InvalidRequest(format!(
                "{} rejected: {} {}",
                awaiting.method, response.status_code, response.status_text
            )));
            return;
        }

        tracing::debug!(method = %awaiting.method, cseq = awaiting.cseq, "negotiation response");
        match awaiting.method.as_str() {
            "OPTIONS" => self.send_setup(),
            "SETUP" => self.complete_setup(&response),
            "TEARDOWN" => {
                self.state = ControllerState::Stopped;
                tracing::info!("teardown acknowledged");
            }
            _ => {}
        }
    }

    fn send_setup(&mut self) {
        let request = RtspRequest::new("SETUP", &self.uri())
            .add_header("Session-Key", &self.session_key)
            .add_header("Content-Type", PARAMETERS_CONTENT_TYPE)
            .with_body(self.local.encode(self.link_type));
        if let Err(e) = self.send_request(request) {
            self.report_error(e);
        }
    }

    fn complete_setup(&mut self, response: &RtspResponse) {
        let Some(session) = response.get_header("Session") else {
            self.report_error(missing("Session"));
            return;
        };
        let session = session.split(';').next().unwrap_or(session).trim().to_string();
        let answer = match response.body.as_deref() {
            Some(body) => ParamInfo::decode(body, self.link_type),
            None => Err(missing("cast_version")),
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                self.report_error(e);
                return;
            }
        };

        let negotiated = negotiate(&self.local, &answer);
        tracing::info!(
            session = %session,
            features = %negotiated.features,
            mode = %negotiated.projection_mode,
            "negotiation established"
        );
        self.session_id = session;
        self.negotiated = Some(negotiated.clone());
        self.state = ControllerState::Established;
        self.listener.on_setup(&negotiated);
    }

    fn handle_request(&mut self, request: RtspRequest) {
        let cseq = request.cseq().unwrap_or("0").to_string();
        let mut intents = Vec::new();

        let response = match request.method.as_str() {
            "OPTIONS" => RtspResponse::ok().add_header("Public", PUBLIC_METHODS),
            "SETUP" => self.handle_setup(&request, &mut intents),
            "PLAY" | "PAUSE" | "TEARDOWN" => self.handle_action(&request, &mut intents),
            "GET_PARAMETER" => self.handle_get_parameter(&request),
            "SET_PARAMETER" => self.handle_set_parameter(&request, &mut intents),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported negotiation method");
                RtspResponse::new(501, "Not Implemented")
            }
        }
        .add_header("CSeq", &cseq);

        tracing::debug!(method = %request.method, %cseq, status = response.status_code, "negotiation request answered");
        if let Err(e) = self.write(&response.serialize()) {
            intents.push(Intent::Error(e));
        }

        for intent in intents {
            match intent {
                Intent::Setup(params) => self.listener.on_setup(&params),
                Intent::Play => self.listener.on_play(),
                Intent::Pause => self.listener.on_pause(),
                Intent::Teardown => self.listener.on_teardown(),
                Intent::Trigger(method) => self.listener.on_trigger(&method),
                Intent::Event(key, value) => self.listener.on_event(&key, &value),
                Intent::Error(e) => self.report_error(e),
            }
        }
    }

    fn handle_setup(&mut self, request: &RtspRequest, intents: &mut Vec<Intent>) -> RtspResponse {
        if self.role != ControllerRole::Responder || self.state != ControllerState::Started {
            tracing::warn!(role = ?self.role, state = self.state.name(), "unexpected SETUP");
            return RtspResponse::method_not_valid();
        }

        let key = request.get_header("Session-Key");
        if !self.session_key.is_empty() && key != Some(self.session_key.as_str()) {
            tracing::warn!("SETUP with wrong session key");
            intents.push(Intent::Error(CastError::InvalidRequest(
                "session key mismatch".to_string(),
            )));
            return RtspResponse::new(401, "Unauthorized");
        }

        let offer = match request.body.as_deref() {
            Some(body) => ParamInfo::decode(body, self.link_type),
            None => Err(missing("cast_version")),
        };
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(error = %e, "SETUP offer rejected");
                intents.push(Intent::Error(e));
                return RtspResponse::bad_request();
            }
        };

        let negotiated = negotiate(&offer, &self.local);
        let answer = ParamInfo {
            features: negotiated.features.clone(),
            ..self.local.clone()
        };
        tracing::info!(
            session = %self.session_id,
            features = %negotiated.features,
            mode = %negotiated.projection_mode,
            "negotiation established"
        );
        self.negotiated = Some(negotiated.clone());
        self.state = ControllerState::Established;
        intents.push(Intent::Setup(negotiated));

        RtspResponse::ok()
            .add_header("Session", &self.session_id)
            .add_header("Content-Type", PARAMETERS_CONTENT_TYPE)
            .with_body(answer.encode(self.link_type))
    }

    fn handle_action(&mut self, request: &RtspRequest, intents: &mut Vec<Intent>) -> RtspResponse {
        if self.state != ControllerState::Established {
            tracing::warn!(method = %request.method, state = self.state.name(), "action before setup");
            return RtspResponse::method_not_valid();
        }
        if !self.matches_session(request) {
            tracing::warn!(method = %request.method, "action for unknown session");
            return RtspResponse::session_not_found();
        }

        match request.method.as_str() {
            "PLAY" => intents.push(Intent::Play),
            "PAUSE" => intents.push(Intent::Pause),
            _ => {
                self.state = ControllerState::Stopped;
                self.awaiting = None;
                tracing::info!(session = %self.session_id, "peer tore down negotiation");
                intents.push(Intent::Teardown);
            }
        }
        RtspResponse::ok().add_header("Session", &self.session_id)
    }

    /// Keepalive, or a query for negotiated keys listed one per body line.
    fn handle_get_parameter(&self, request: &RtspRequest) -> RtspResponse {
        let Some(negotiated) = self.negotiated.as_ref() else {
            return RtspResponse::method_not_valid();
        };
        let wanted: Vec<&str> = request
            .body
            .as_deref()
            .unwrap_or("")
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let response = RtspResponse::ok().add_header("Session", &self.session_id);
        if wanted.is_empty() {
            tracing::trace!("GET_PARAMETER keepalive");
            return response;
        }

        let encoded = negotiated.encode(self.link_type);
        let known = param::parameter_lines(&encoded).unwrap_or_default();
        let body: String = wanted
            .iter()
            .filter_map(|key| known.iter().find(|(k, _)| k == key))
            .map(|(k, v)| format!("{k}: {v}\r\n"))
            .collect();
        if body.is_empty() {
            return response;
        }
        response
            .add_header("Content-Type", PARAMETERS_CONTENT_TYPE)
            .with_body(body)
    }

    fn handle_set_parameter(
        &mut self,
        request: &RtspRequest,
        intents: &mut Vec<Intent>,
    ) -> RtspResponse {
        if self.state != ControllerState::Established {
            return RtspResponse::method_not_valid();
        }
        let lines = match param::parameter_lines(request.body.as_deref().unwrap_or("")) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(error = %e, "malformed SET_PARAMETER");
                return RtspResponse::bad_request();
            }
        };

        for (key, value) in lines {
            match key {
                "cast_trigger_method" => intents.push(Intent::Trigger(value.to_string())),
                "cast_feature_set" => {
                    if !self.is_support_feature(feature::CUSTOM_PARAMS) {
                        tracing::warn!("feature update without custom params, ignoring");
                        continue;
                    }
                    match value.parse::<FeatureSet>() {
                        Ok(features) => self.apply_features(&features),
                        Err(e) => {
                            tracing::warn!(error = %e, "bad feature set");
                            return RtspResponse::bad_request();
                        }
                    }
                }
                "cast_stream_action" | "cast_mode" => {
                    intents.push(Intent::Event(key.to_string(), value.to_string()))
                }
                other => tracing::debug!(key = other, "ignoring parameter"),
            }
        }
        RtspResponse::ok().add_header("Session", &self.session_id)
    }

    fn matches_session(&self, request: &RtspRequest) -> bool {
        request
            .get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            == Some(self.session_id.as_str())
    }
}

/// Offerer parameters with the feature set narrowed to what both sides
/// support. Ports and formats are the offerer's.
fn negotiate(offer: &ParamInfo, answer: &ParamInfo) -> ParamInfo {
    ParamInfo {
        version: offer.version.min(answer.version),
        features: offer.features.intersect(&answer.features),
        ..offer.clone()
    }
}

fn missing(name: &'static str) -> CastError {
    CastError::Parse {
        kind: ParseErrorKind::MissingParameter(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelListener, ChannelRequest, ChannelRole, DeviceSnapshot};
    use crate::session::{CastMode, SessionProperties};
    use parking_lot::Mutex;

    struct Wire {
        request: ChannelRequest,
        sent: Mutex<Vec<String>>,
    }

    impl Wire {
        fn new() -> Arc<Self> {
            Arc::new(Wire {
                request: ChannelRequest::new(
                    ModuleType::Rtsp,
                    LinkType::Tcp,
                    ChannelRole::Sender,
                    DeviceSnapshot::default(),
                    DeviceSnapshot::default(),
                    SessionProperties::default(),
                ),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Channel for Wire {
        fn request(&self) -> &ChannelRequest {
            &self.request
        }
        fn local_port(&self) -> u16 {
            0
        }
        fn send(&self, data: &[u8]) -> Result<()> {
            self.sent
                .lock()
                .push(String::from_utf8_lossy(data).into_owned());
            Ok(())
        }
        fn set_listener(&self, _listener: Arc<dyn ChannelListener>) {}
        fn close(&self) {}
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl Events {
        fn list(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl ProtocolListener for Events {
        fn on_setup(&self, params: &ParamInfo) {
            self.0.lock().push(format!("setup {}", params.features));
        }
        fn on_play(&self) {
            self.0.lock().push("play".into());
        }
        fn on_pause(&self) {
            self.0.lock().push("pause".into());
        }
        fn on_teardown(&self) {
            self.0.lock().push("teardown".into());
        }
        fn on_error(&self, _error: &CastError) {
            self.0.lock().push("error".into());
        }
        fn on_trigger(&self, method: &str) {
            self.0.lock().push(format!("trigger {method}"));
        }
        fn on_event(&self, key: &str, value: &str) {
            self.0.lock().push(format!("event {key}={value}"));
        }
    }

    struct Side {
        controller: ProtocolController,
        wire: Arc<Wire>,
        events: Arc<Events>,
    }

    fn side(role: ControllerRole, features: &[u32]) -> Side {
        let events = Arc::new(Events::default());
        let wire = Wire::new();
        let mut controller =
            ProtocolController::new(role, LinkType::Tcp, "42".to_string(), events.clone());
        let params = ParamInfo {
            features: features.iter().copied().collect(),
            media_port: MediaPort {
                video: 7000,
                audio: 7002,
            },
            ..Default::default()
        };
        controller
            .start(Some(wire.clone() as Arc<dyn Channel>), params, "a2V5")
            .unwrap();
        Side {
            controller,
            wire,
            events,
        }
    }

    /// Deliver everything `from` has written to `to`. Returns the count.
    fn pump(from: &Side, to: &mut Side) -> usize {
        let messages = from.wire.take();
        for message in &messages {
            to.controller.on_data(message.as_bytes());
        }
        messages.len()
    }

    fn handshake(offer_features: &[u32], answer_features: &[u32]) -> (Side, Side) {
        let mut offerer = side(ControllerRole::Offerer, offer_features);
        let mut responder = side(ControllerRole::Responder, answer_features);
        while pump(&offerer, &mut responder) + pump(&responder, &mut offerer) > 0 {}
        (offerer, responder)
    }

    #[test]
    fn handshake_establishes_both_sides_with_common_features() {
        let (offerer, responder) = handshake(&[1, 2, 5], &[1, 5, 6]);

        assert!(offerer.controller.is_established());
        assert!(responder.controller.is_established());
        assert_eq!(offerer.events.list(), vec!["setup 1,5"]);
        assert_eq!(responder.events.list(), vec!["setup 1,5"]);
        assert!(offerer.controller.is_support_feature(1));
        assert!(!offerer.controller.is_support_feature(2));
        assert_eq!(offerer.controller.session_id(), "42");
        assert_eq!(
            responder.controller.get_media_port(),
            Some(MediaPort {
                video: 7000,
                audio: 7002
            })
        );
    }

    #[test]
    fn action_before_setup_is_rejected() {
        let mut offerer = side(ControllerRole::Offerer, &[]);
        assert!(matches!(
            offerer.controller.action(Action::Play),
            Err(CastError::ProtocolState { .. })
        ));
    }

    #[test]
    fn second_action_while_pending_is_rejected() {
        let (mut offerer, _responder) = handshake(&[], &[]);
        offerer.controller.action(Action::Play).unwrap();
        assert!(matches!(
            offerer.controller.action(Action::Pause),
            Err(CastError::RequestPending(method)) if method == "PLAY"
        ));
    }

    #[test]
    fn play_pause_and_teardown_reach_the_peer() {
        let (mut offerer, mut responder) = handshake(&[], &[]);

        offerer.controller.action(Action::Play).unwrap();
        pump(&offerer, &mut responder);
        pump(&responder, &mut offerer);
        offerer.controller.action(Action::Pause).unwrap();
        pump(&offerer, &mut responder);
        pump(&responder, &mut offerer);
        offerer.controller.action(Action::Teardown).unwrap();
        assert_eq!(offerer.controller.state(), ControllerState::Stopping);
        pump(&offerer, &mut responder);
        pump(&responder, &mut offerer);

        assert_eq!(responder.events.list()[1..], ["play", "pause", "teardown"]);
        assert_eq!(offerer.controller.state(), ControllerState::Stopped);
        assert_eq!(responder.controller.state(), ControllerState::Stopped);
        assert!(!offerer.events.list().contains(&"error".to_string()));
    }

    #[test]
    fn teardown_goes_out_while_play_is_pending() {
        let (mut offerer, mut responder) = handshake(&[], &[]);

        offerer.controller.action(Action::Play).unwrap();
        assert!(offerer.controller.has_pending_request());
        offerer.controller.action(Action::Teardown).unwrap();
        pump(&offerer, &mut responder);
        pump(&responder, &mut offerer);

        assert_eq!(responder.events.list()[1..], ["play", "teardown"]);
        assert_eq!(offerer.controller.state(), ControllerState::Stopped);
        assert!(!offerer.controller.has_pending_request());
        assert!(!offerer.events.list().contains(&"error".to_string()));
    }

    #[test]
    fn mismatched_cseq_is_reported_once() {
        let mut offerer = side(ControllerRole::Offerer, &[]);
        offerer.wire.take();
        offerer
            .controller
            .on_data(b"RTSP/1.0 200 OK\r\nCSeq: 9\r\n\r\n");
        offerer
            .controller
            .on_data(b"RTSP/1.0 200 OK\r\nCSeq: 10\r\n\r\n");
        assert_eq!(offerer.events.list(), vec!["error"]);
    }

    #[test]
    fn setup_without_version_is_refused() {
        let mut responder = side(ControllerRole::Responder, &[]);
        let body = "cast_projection_mode: mirror\r\n";
        let request = RtspRequest::new("SETUP", "rtsp://localhost/cast")
            .add_header("CSeq", "2")
            .add_header("Session-Key", "a2V5")
            .with_body(body.to_string());
        responder.controller.on_data(request.serialize().as_bytes());

        let sent = responder.wire.take();
        let response = RtspResponse::parse(&sent[0]).unwrap();
        assert_eq!(response.status_code, 400);
        assert_eq!(response.cseq(), Some("2"));
        assert_eq!(responder.events.list(), vec!["error"]);
        assert!(!responder.controller.is_established());
    }

    #[test]
    fn setup_with_wrong_key_is_unauthorized() {
        let mut responder = side(ControllerRole::Responder, &[]);
        let request = RtspRequest::new("SETUP", "rtsp://localhost/cast")
            .add_header("CSeq", "2")
            .add_header("Session-Key", "b3RoZXI=")
            .with_body(ParamInfo::default().encode(LinkType::Tcp));
        responder.controller.on_data(request.serialize().as_bytes());

        let response = RtspResponse::parse(&responder.wire.take()[0]).unwrap();
        assert_eq!(response.status_code, 401);
    }

    #[test]
    fn set_parameter_routes_trigger_and_events() {
        let (mut offerer, mut responder) = handshake(&[], &[]);
        offerer
            .controller
            .send_parameter("cast_trigger_method", "key")
            .unwrap();
        pump(&offerer, &mut responder);
        pump(&responder, &mut offerer);
        offerer
            .controller
            .send_parameter("cast_mode", &CastMode::Stream.to_string())
            .unwrap();
        pump(&offerer, &mut responder);

        assert_eq!(
            responder.events.list()[1..],
            ["trigger key", "event cast_mode=stream"]
        );
    }

    #[test]
    fn feature_renegotiation_needs_custom_params() {
        let (mut plain, _) = handshake(&[1], &[1]);
        assert!(plain.controller.renegotiate_features([1].into_iter().collect()).is_err());

        let custom = feature::CUSTOM_PARAMS;
        let (mut offerer, mut responder) = handshake(&[1, 2, custom], &[1, 2, custom]);
        offerer
            .controller
            .renegotiate_features([1, custom].into_iter().collect())
            .unwrap();
        pump(&offerer, &mut responder);

        assert!(!offerer.controller.is_support_feature(2));
        assert!(!responder.controller.is_support_feature(2));
        assert!(responder.controller.is_support_feature(1));
    }

    #[test]
    fn get_parameter_echoes_known_keys() {
        let (mut offerer, mut responder) = handshake(&[], &[]);
        let request = RtspRequest::new("GET_PARAMETER", "rtsp://localhost/cast")
            .add_header("CSeq", "7")
            .add_header("Session", "42")
            .with_body("cast_video_port\r\ncast_unknown\r\n".to_string());
        responder.controller.on_data(request.serialize().as_bytes());
        let response = RtspResponse::parse(&responder.wire.take()[0]).unwrap();
        assert_eq!(response.body.as_deref(), Some("cast_video_port: 7000\r\n"));

        offerer.controller.stop();
        assert_eq!(offerer.controller.state(), ControllerState::Stopped);
        assert!(offerer.controller.negotiated_params().is_none());
    }
}
