use crate::error::{CastError, ParseErrorKind};
use crate::protocol::request::{
    RTSP_VERSION, find_header, parse_headers, split_head, take_body, write_headers_and_body,
};

/// A negotiation response (RTSP response syntax).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 2\r\n
/// Content-Type: text/parameters\r\n
/// Content-Length: 142\r\n
/// \r\n
/// cast_version: 2\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[derive(Debug, Clone)]
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Agent string included in every response this engine writes.
pub const SERVER_AGENT: &str = "cast-session/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK.
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request: malformed or missing required field.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 454 Session Not Found: `Session` header absent or unknown.
    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 455 Method Not Valid In This State.
    pub fn method_not_valid() -> Self {
        Self::new(455, "Method Not Valid In This State")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Parse a response from its text representation.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, body) = split_head(raw);
        let mut lines = head.lines();

        let status_line = lines.next().filter(|l| !l.trim().is_empty()).ok_or(
            CastError::Parse {
                kind: ParseErrorKind::EmptyMessage,
            },
        )?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let code = parts.next().and_then(|c| c.parse::<u16>().ok());
        let text = parts.next().unwrap_or("").trim();

        let status_code = match code {
            Some(code) if version.starts_with("RTSP/") => code,
            _ => {
                return Err(CastError::Parse {
                    kind: ParseErrorKind::InvalidStatusLine,
                });
            }
        };

        if version != RTSP_VERSION {
            tracing::warn!(version, "peer answered with non-RTSP/1.0 version");
        }

        let headers = parse_headers(lines)?;
        let body = take_body(&headers, body);

        Ok(RtspResponse {
            status_code,
            status_text: text.to_string(),
            headers,
            body,
        })
    }

    /// Serialize to the text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically.
    pub fn serialize(&self) -> String {
        let mut response = format!(
            "{} {} {}\r\n",
            RTSP_VERSION, self.status_code, self.status_text
        );
        write_headers_and_body(&mut response, &self.headers, self.body.as_deref());
        response
    }
}
