//! HTTP/1.1 upgrade handshake (RFC 6455 section 4).
//!
//! The upgrader scans the inbound buffer for the end of the header block and
//! only consumes bytes once a complete request is present. Anything the
//! client sent after the blank line (frames pipelined behind the request)
//! stays in the buffer for the frame codec.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use wsgate_core::errors::HandshakeError;

/// Magic GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header block terminator.
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Default bound on the request header block.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// Handshake progress for a connection that has not upgraded yet.
#[derive(Debug, Default, Clone)]
pub struct PendingHandshake {
    /// Buffer offset already searched for the header terminator.
    scanned: usize,
}

impl PendingHandshake {
    /// Fresh handshake state.
    pub fn new() -> Self {
        Self::default()
    }
}

/// A parsed upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// HTTP method (always `GET` once validated).
    pub method: String,
    /// Request target as sent by the client.
    pub uri: String,
    /// Header fields in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// First header value matching `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct Upgrade {
    /// The validated request.
    pub request: HandshakeRequest,
    /// Encoded `101 Switching Protocols` response.
    pub response: Bytes,
}

/// Server-side handshake driver.
#[derive(Debug, Clone)]
pub struct Upgrader {
    max_header_bytes: usize,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES)
    }
}

impl Upgrader {
    /// Upgrader bounding the header block at `max_header_bytes`.
    pub fn new(max_header_bytes: usize) -> Self {
        Self { max_header_bytes }
    }

    /// Try to complete the handshake from `buf`.
    ///
    /// Returns `Ok(None)` while the header block is incomplete. On success
    /// the request bytes are consumed from `buf`.
    pub fn upgrade(
        &self,
        buf: &mut BytesMut,
        pending: &mut PendingHandshake,
    ) -> Result<Option<Upgrade>, HandshakeError> {
        let start = pending.scanned.saturating_sub(HEADER_END.len() - 1);
        let Some(found) = find(&buf[start..], HEADER_END) else {
            if buf.len() > self.max_header_bytes {
                return Err(HandshakeError::TooLarge {
                    size: buf.len(),
                    max: self.max_header_bytes,
                });
            }
            pending.scanned = buf.len();
            return Ok(None);
        };

        let end = start + found + HEADER_END.len();
        if end > self.max_header_bytes {
            return Err(HandshakeError::TooLarge {
                size: end,
                max: self.max_header_bytes,
            });
        }

        let head = buf.split_to(end);
        pending.scanned = 0;
        let request = parse_request(&head)?;
        let key = validate(&request)?;
        let response = switching_protocols(&compute_accept_key(key));
        Ok(Some(Upgrade { request, response }))
    }

    /// Render the error response sent before closing a failed handshake.
    pub fn reject(&self, err: &HandshakeError) -> Bytes {
        let body = err.to_string();
        Bytes::from(format!(
            "HTTP/1.1 400 Bad Request\r\n\
             Connection: close\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {body}",
            body.len()
        ))
    }
}

/// Split an HTTP request line into method, target and version.
pub fn parse_request_line(line: &str) -> Result<(&str, &str, &str), HandshakeError> {
    let mut parts = line.split_ascii_whitespace();
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::InvalidRequest(format!(
            "malformed request line: {line:?}"
        )));
    };
    Ok((method, uri, version))
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn parse_request(head: &[u8]) -> Result<HandshakeRequest, HandshakeError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| HandshakeError::InvalidRequest("header block is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let (method, uri, version) = parse_request_line(request_line)?;

    if version != "HTTP/1.1" {
        return Err(HandshakeError::InvalidRequest(format!(
            "unsupported HTTP version {version}"
        )));
    }

    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(HandshakeError::InvalidRequest(format!(
                "malformed header line: {line:?}"
            )));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(HandshakeRequest {
        method: method.to_string(),
        uri: uri.to_string(),
        headers,
    })
}

fn validate(request: &HandshakeRequest) -> Result<&str, HandshakeError> {
    if request.method != "GET" {
        return Err(HandshakeError::InvalidRequest(format!(
            "method {} not allowed",
            request.method
        )));
    }

    let upgrade = request
        .header("Upgrade")
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !has_token(upgrade, "websocket") {
        return Err(HandshakeError::InvalidRequest(format!(
            "Upgrade header is {upgrade:?}"
        )));
    }

    let connection = request
        .header("Connection")
        .ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !has_token(connection, "upgrade") {
        return Err(HandshakeError::InvalidRequest(format!(
            "Connection header is {connection:?}"
        )));
    }

    let version = request
        .header("Sec-WebSocket-Version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match BASE64.decode(key) {
        Ok(raw) if raw.len() == 16 => Ok(key),
        _ => Err(HandshakeError::InvalidKey),
    }
}

fn switching_protocols(accept: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    ))
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(extra: &str) -> String {
        format!(
            "GET /alice?room=1 HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {extra}\r\n"
        )
    }

    fn run(raw: &str) -> Result<Option<Upgrade>, HandshakeError> {
        let mut buf = BytesMut::from(raw.as_bytes());
        Upgrader::default().upgrade(&mut buf, &mut PendingHandshake::new())
    }

    #[test]
    fn rfc_accept_key() {
        assert_eq!(compute_accept_key(KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn complete_request_upgrades() {
        let upgrade = run(&request("")).unwrap().unwrap();
        assert_eq!(upgrade.request.uri, "/alice?room=1");
        assert_eq!(upgrade.request.path(), "/alice");
        assert_eq!(upgrade.request.header("host"), Some("localhost"));
        let response = std::str::from_utf8(&upgrade.response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn incomplete_request_waits_across_reads() {
        let raw = request("");
        let upgrader = Upgrader::default();
        let mut pending = PendingHandshake::new();
        let mut buf = BytesMut::new();

        // Split inside the terminator so the rescan offset matters.
        let cut = raw.len() - 2;
        buf.extend_from_slice(&raw.as_bytes()[..cut]);
        assert!(upgrader.upgrade(&mut buf, &mut pending).unwrap().is_none());
        assert_eq!(buf.len(), cut);

        buf.extend_from_slice(&raw.as_bytes()[cut..]);
        assert!(upgrader.upgrade(&mut buf, &mut pending).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn pipelined_bytes_stay_buffered() {
        let mut raw = request("").into_bytes();
        raw.extend_from_slice(&[0x81, 0x80, 1, 2, 3, 4]);
        let mut buf = BytesMut::from(&raw[..]);
        let _ = Upgrader::default()
            .upgrade(&mut buf, &mut PendingHandshake::new())
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..], &[0x81, 0x80, 1, 2, 3, 4]);
    }

    #[test]
    fn post_is_rejected() {
        let raw = request("").replacen("GET", "POST", 1);
        assert_matches!(run(&raw), Err(HandshakeError::InvalidRequest(_)));
    }

    #[test]
    fn missing_upgrade_header() {
        let raw = request("").replace("Upgrade: websocket\r\n", "");
        assert_matches!(run(&raw), Err(HandshakeError::MissingHeader("Upgrade")));
    }

    #[test]
    fn wrong_version() {
        let raw = request("").replace("Version: 13", "Version: 8");
        assert_matches!(run(&raw), Err(HandshakeError::UnsupportedVersion(v)) if v == "8");
    }

    #[test]
    fn short_key() {
        let raw = request("").replace(KEY, "c2hvcnQ=");
        assert_matches!(run(&raw), Err(HandshakeError::InvalidKey));
    }

    #[test]
    fn oversized_header_block() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Pad: "[..]);
        buf.extend_from_slice(&[b'a'; 200]);
        assert_matches!(
            Upgrader::new(128).upgrade(&mut buf, &mut PendingHandshake::new()),
            Err(HandshakeError::TooLarge { max: 128, .. })
        );
    }

    #[test]
    fn request_line_parsing() {
        assert_eq!(
            parse_request_line("GET /x HTTP/1.1").unwrap(),
            ("GET", "/x", "HTTP/1.1")
        );
        assert_matches!(
            parse_request_line("GET /x"),
            Err(HandshakeError::InvalidRequest(_))
        );
    }

    #[test]
    fn reject_renders_400() {
        let bytes = Upgrader::default().reject(&HandshakeError::InvalidKey);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with("invalid Sec-WebSocket-Key"));
    }
}
