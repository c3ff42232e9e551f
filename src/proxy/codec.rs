//! HTTP/1.x message codec
//!
//! Best-effort parsing of raw buffers into [`HttpMessage`] values and
//! re-emission of a buffer with a replacement header block. Parsing never
//! fails: lines that cannot be understood are skipped.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::models::{HeaderMap, HttpMessage, HttpMethod, StartLine};
use crate::proxy::error::ProxyError;

pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

const READ_CHUNK: usize = 4096;

/// Parse `buf` as an HTTP message.
///
/// With `is_continuation` the whole buffer is body and no head parsing
/// happens. Otherwise the buffer is split at the first blank line; without one
/// the whole buffer is treated as head.
pub fn parse(buf: &[u8], is_response: bool, is_continuation: bool) -> HttpMessage {
    if is_continuation {
        return HttpMessage {
            body: buf.to_vec(),
            ..HttpMessage::default()
        };
    }

    let (head, body) = match find_header_end(buf) {
        Some(end) => (&buf[..end - HEAD_TERMINATOR.len()], &buf[end..]),
        None => (buf, &buf[buf.len()..]),
    };

    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .and_then(|line| parse_start_line(line, is_response));

    let mut headers = HeaderMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            headers.append(name, value.trim());
        }
    }

    HttpMessage {
        start_line,
        headers,
        body: body.to_vec(),
    }
}

fn parse_start_line(line: &str, is_response: bool) -> Option<StartLine> {
    let mut parts = line.splitn(3, ' ');
    let first = parts.next()?;
    let second = parts.next()?;
    let third = parts.next().unwrap_or("");

    if is_response {
        if !first.starts_with("HTTP/") {
            return None;
        }
        let status_code = second.parse::<u16>().ok()?;
        Some(StartLine::Response {
            version: first.to_string(),
            status_code,
            status_text: third.to_string(),
        })
    } else {
        // Method, target and version; the version token is not validated
        if first.is_empty() || second.is_empty() || third.is_empty() {
            return None;
        }
        Some(StartLine::Request {
            method: HttpMethod::from_token(first),
            path: second.to_string(),
            version: third.to_string(),
        })
    }
}

/// Re-emit `original` with its header block replaced by `headers`.
///
/// The start line and the body are copied byte for byte.
pub fn rebuild(headers: &HeaderMap, original: &[u8]) -> Vec<u8> {
    let start_line_end = original
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(original.len());
    let body = match find_header_end(original) {
        Some(end) => &original[end..],
        None => &original[original.len()..],
    };

    let mut out = Vec::with_capacity(original.len() + 64);
    out.extend_from_slice(&original[..start_line_end]);
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Offset just past the first `\r\n\r\n`, if present.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get("content-length")?;
    // Duplicates were comma-joined; they must agree to be meaningful anyway
    raw.split(',').next()?.trim().parse().ok()
}

pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .map(|value| {
            value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

/// `Basic <base64(user:pass)>`
pub fn basic_credentials(user_pass: &str) -> String {
    format!("Basic {}", BASE64.encode(user_pass.as_bytes()))
}

/// Read until the end of a message head.
///
/// Returns the head (including the blank line) and whatever followed it in
/// the same reads. `Ok(None)` means the peer closed before sending anything.
pub async fn read_message_head<S>(
    stream: &mut S,
    max_bytes: usize,
) -> Result<Option<(Vec<u8>, Vec<u8>)>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; READ_CHUNK];

    loop {
        let bytes_read = stream.read(&mut temp).await.map_err(ProxyError::from_io)?;
        if bytes_read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::MalformedRequest(
                "connection closed before headers completed".into(),
            ));
        }
        buffer.extend_from_slice(&temp[..bytes_read]);

        if let Some(pos) = find_header_end(&buffer) {
            let remaining = buffer.split_off(pos);
            return Ok(Some((buffer, remaining)));
        }

        if buffer.len() > max_bytes {
            return Err(ProxyError::MalformedRequest(format!(
                "message head exceeds {} bytes",
                max_bytes
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_head_and_initial_body() {
        let msg = parse(
            b"POST http://example.com/submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nping",
            false,
            false,
        );
        assert_eq!(msg.method(), Some(&HttpMethod::Post));
        assert_eq!(msg.path(), Some("http://example.com/submit"));
        assert_eq!(msg.version(), Some("HTTP/1.1"));
        assert_eq!(msg.headers.get("host"), Some("example.com"));
        assert_eq!(msg.body, b"ping");
    }

    #[test]
    fn parses_response_status_text_with_spaces() {
        let msg = parse(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n", true, false);
        assert_eq!(msg.status_code(), Some(407));
        assert_eq!(msg.status_text(), Some("Proxy Authentication Required"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let msg = parse(b"garbage\r\nno-colon-here\r\nX-Ok:  fine \r\nEmpty:\r\n\r\n", false, false);
        assert!(msg.start_line.is_none());
        assert_eq!(msg.headers.get("x-ok"), Some("fine"));
        assert_eq!(msg.headers.get("empty"), Some(""));
        assert_eq!(msg.headers.len(), 2);
    }

    #[test]
    fn request_line_needs_three_tokens_only() {
        let msg = parse(b"GET http://example.com/ http/1.1\r\n\r\n", false, false);
        assert_eq!(msg.method(), Some(&HttpMethod::Get));
        assert_eq!(msg.version(), Some("http/1.1"));

        assert!(parse(b"GET /\r\n\r\n", false, false).start_line.is_none());
        assert!(parse(b"GET  HTTP/1.1\r\n\r\n", false, false).start_line.is_none());
    }

    #[test]
    fn header_value_keeps_later_colons() {
        let msg = parse(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n", false, false);
        assert_eq!(msg.headers.get("host"), Some("example.com:8080"));
    }

    #[test]
    fn continuation_is_pure_body() {
        let msg = parse(b"HTTP/1.1 200 OK\r\n\r\n", true, true);
        assert!(msg.start_line.is_none());
        assert!(msg.headers.is_empty());
        assert_eq!(msg.body, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[test]
    fn rebuild_replaces_headers_and_keeps_body() {
        let original = b"GET http://a/ HTTP/1.1\r\nHost: a\r\nProxy-Authorization: Basic eDp5\r\n\r\nbody";
        let mut headers = parse(original, false, false).headers;
        headers.remove("proxy-authorization");
        headers.insert("x-added", "1");

        let rebuilt = rebuild(&headers, original);
        assert_eq!(
            rebuilt,
            b"GET http://a/ HTTP/1.1\r\nhost: a\r\nx-added: 1\r\n\r\nbody".to_vec()
        );
    }

    #[test]
    fn parse_after_rebuild_yields_same_headers() {
        let original = b"HTTP/1.1 200 OK\r\nA: 1\r\n\r\n";
        let headers: HeaderMap = vec![("content-type", "text/plain"), ("set-cookie", "a=1, b=2")]
            .into_iter()
            .collect();
        let reparsed = parse(&rebuild(&headers, original), true, false);
        assert_eq!(reparsed.headers, headers);
        assert_eq!(reparsed.status_code(), Some(200));
    }

    #[test]
    fn framing_helpers() {
        let msg = parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 16\r\nTransfer-Encoding: gzip, Chunked\r\n\r\n",
            true,
            false,
        );
        assert_eq!(content_length(&msg.headers), Some(16));
        assert!(is_chunked(&msg.headers));
        assert_eq!(basic_credentials("user:pass"), "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn read_head_splits_pipelined_bytes() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"CONNECT example.com:443 HTTP/1.1\r\n")
            .read(b"Host: example.com:443\r\n\r\n\x16\x03\x01")
            .build();
        let (head, rest) = read_message_head(&mut reader, 1024).await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn read_head_reports_clean_eof_and_oversize() {
        let mut empty = tokio_test::io::Builder::new().build();
        assert!(read_message_head(&mut empty, 1024).await.unwrap().is_none());

        let mut big = tokio_test::io::Builder::new().read(&[b'a'; 64]).build();
        let err = read_message_head(&mut big, 16).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }
}
