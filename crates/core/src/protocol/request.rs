use crate::error::{CastError, ParseErrorKind};

/// Protocol version written on every outbound message.
pub const RTSP_VERSION: &str = "RTSP/1.0";

/// A negotiation request (RTSP request syntax).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive. The body, when present, is sized by
/// `Content-Length`.
#[derive(Debug, Clone)]
#[must_use]
pub struct RtspRequest {
    /// Method (OPTIONS, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER).
    pub method: String,
    /// Request-URI (e.g. `rtsp://192.168.3.4/cast` or `*`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version: RTSP_VERSION.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Parse a request from its text representation.
    ///
    /// Expects a complete request: request line, headers, blank line and
    /// `Content-Length` bytes of body if that header is present.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let (head, body) = split_head(raw);
        let mut lines = head.lines();

        let request_line = lines.next().filter(|l| !l.trim().is_empty()).ok_or(
            CastError::Parse {
                kind: ParseErrorKind::EmptyMessage,
            },
        )?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err(CastError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != RTSP_VERSION {
            tracing::warn!(version, "peer sent non-RTSP/1.0 version");
        }

        let headers = parse_headers(lines)?;
        let body = take_body(&headers, body);

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body,
        })
    }

    /// Look up a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns the CSeq header value, which numbers and orders
    /// request/response pairs. Responses must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Serialize to the text wire format, appending `Content-Length` when a
    /// body is present.
    pub fn serialize(&self) -> String {
        let mut request = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        write_headers_and_body(&mut request, &self.headers, self.body.as_deref());
        request
    }
}

/// Splits a raw message at the first blank line into (head, remainder).
pub(crate) fn split_head(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, "")
    }
}

pub(crate) fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> crate::error::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();

    for line in lines {
        if line.is_empty() {
            break;
        }

        let colon_pos = line.find(':').ok_or(CastError::Parse {
            kind: ParseErrorKind::InvalidHeader,
        })?;

        let name = line[..colon_pos].trim().to_string();
        let value = line[colon_pos + 1..].trim().to_string();

        headers.push((name, value));
    }

    Ok(headers)
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Returns the body limited to `Content-Length` bytes, or `None` when the
/// header is absent or zero.
pub(crate) fn take_body(headers: &[(String, String)], rest: &str) -> Option<String> {
    let len = find_header(headers, "Content-Length")?.parse::<usize>().ok()?;
    if len == 0 {
        return None;
    }
    let end = len.min(rest.len());
    match rest.get(..end) {
        Some(body) => Some(body.to_string()),
        None => {
            tracing::warn!(len, "Content-Length splits a UTF-8 sequence, keeping full body");
            Some(rest.to_string())
        }
    }
}

pub(crate) fn write_headers_and_body(
    out: &mut String,
    headers: &[(String, String)],
    body: Option<&str>,
) {
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }

    if let Some(body) = body {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        out.push_str("\r\n");
        out.push_str(body);
    } else {
        out.push_str("\r\n");
    }
}
