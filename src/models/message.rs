//! HTTP message model
//!
//! Values produced by the codec and the per-direction reassembly state kept by
//! every session.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::proxy::codec;

/// HTTP methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Connect,
    Trace,
    /// Any other token, kept verbatim
    Extension(String),
}

impl HttpMethod {
    /// Convert from the request-line token. Matching is case-sensitive, as methods are.
    pub fn from_token(s: &str) -> Self {
        match s {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "CONNECT" => HttpMethod::Connect,
            "TRACE" => HttpMethod::Trace,
            other => HttpMethod::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Extension(token) => token,
        }
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, HttpMethod::Connect)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(HttpMethod::from_token(s))
    }
}

/// Ordered header map.
///
/// Names are stored lower-cased. Appending a name that is already present
/// joins the values with `", "` so multi-valued headers survive parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a value, comma-joining with any existing value of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.entries.push((key, value.to_string())),
        }
    }

    /// Set a value, replacing any existing value of the same name in place.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let key = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.append(name.as_ref(), value.as_ref());
        }
        map
    }
}

/// First line of an HTTP message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartLine {
    Request {
        method: HttpMethod,
        path: String,
        version: String,
    },
    Response {
        version: String,
        status_code: u16,
        status_text: String,
    },
}

/// A parsed (possibly partial) HTTP request or response.
///
/// `start_line` is `None` for pure body continuations and for input whose
/// first line could not be recognised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMessage {
    pub start_line: Option<StartLine>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpMessage {
    pub fn method(&self) -> Option<&HttpMethod> {
        match &self.start_line {
            Some(StartLine::Request { method, .. }) => Some(method),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match &self.start_line {
            Some(StartLine::Request { path, .. }) => Some(path),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match &self.start_line {
            Some(StartLine::Request { version, .. }) | Some(StartLine::Response { version, .. }) => {
                Some(version)
            }
            None => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            Some(StartLine::Response { status_code, .. }) => Some(*status_code),
            _ => None,
        }
    }

    pub fn status_text(&self) -> Option<&str> {
        match &self.start_line {
            Some(StartLine::Response { status_text, .. }) => Some(status_text),
            _ => None,
        }
    }

    pub fn has_start_line(&self) -> bool {
        self.start_line.is_some()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// What one `append` call did to an accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageProgress {
    /// Chunks observed in this direction, never reset
    pub counter: u64,
    /// Messages started in this direction
    pub messages: u64,
    /// Whether this chunk began a new message
    pub new_message: bool,
    /// Body bytes observed for the current message (not capped)
    pub body_len: u64,
    pub complete: bool,
}

/// Incremental reassembly of one direction of an HTTP exchange.
///
/// A chunk starts a new message when no message is in progress or the
/// previous one is complete and the chunk carries a recognisable start line.
/// Everything else is body continuation.
#[derive(Debug, Clone)]
pub struct MessageAccumulator {
    is_response: bool,
    message: HttpMessage,
    head_buf: Vec<u8>,
    head_done: bool,
    counter: u64,
    messages: u64,
    body_len: u64,
    tail: Vec<u8>,
    saw_terminator: bool,
    complete: bool,
    capture_limit: usize,
    max_head_bytes: usize,
}

const TERMINATOR_TAIL: usize = codec::CHUNKED_TERMINATOR.len() - 1;

impl MessageAccumulator {
    pub fn request(capture_limit: usize, max_head_bytes: usize) -> Self {
        Self::new(false, capture_limit, max_head_bytes)
    }

    pub fn response(capture_limit: usize, max_head_bytes: usize) -> Self {
        Self::new(true, capture_limit, max_head_bytes)
    }

    fn new(is_response: bool, capture_limit: usize, max_head_bytes: usize) -> Self {
        Self {
            is_response,
            message: HttpMessage::default(),
            head_buf: Vec::new(),
            head_done: false,
            counter: 0,
            messages: 0,
            body_len: 0,
            tail: Vec::new(),
            saw_terminator: false,
            complete: false,
            capture_limit,
            max_head_bytes,
        }
    }

    pub fn message(&self) -> &HttpMessage {
        &self.message
    }

    /// Drop a header from the current message, e.g. after it was consumed
    /// by the proxy itself.
    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.message.headers.remove(name)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn body_len(&self) -> u64 {
        self.body_len
    }

    pub fn progress(&self, new_message: bool) -> MessageProgress {
        MessageProgress {
            counter: self.counter,
            messages: self.messages,
            new_message,
            body_len: self.body_len,
            complete: self.complete,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) -> MessageProgress {
        self.counter += 1;

        // Still collecting a head that was split across reads
        if !self.head_done && self.message.has_start_line() {
            self.head_buf.extend_from_slice(chunk);
            let buffered = std::mem::take(&mut self.head_buf);
            let body_start = self.take_head(&buffered);
            if self.head_done {
                self.push_body(&buffered[body_start..]);
            } else {
                self.head_buf = buffered;
            }
            self.complete = self.head_done && self.evaluate();
            return self.progress(false);
        }

        let fresh = !self.message.has_start_line() || self.complete;
        if fresh {
            let parsed = codec::parse(chunk, self.is_response, false);
            if parsed.has_start_line() {
                self.reset();
                self.messages += 1;
                let body_start = self.take_head(chunk);
                if self.head_done {
                    self.push_body(&chunk[body_start..]);
                } else {
                    self.head_buf = chunk.to_vec();
                }
                self.complete = self.head_done && self.evaluate();
                return self.progress(true);
            }
        }

        self.push_body(chunk);
        self.complete = self.head_done && self.evaluate();
        self.progress(false)
    }

    /// Parse `buf` as the message head. Returns the offset where the body starts.
    fn take_head(&mut self, buf: &[u8]) -> usize {
        match codec::find_header_end(buf) {
            Some(end) => {
                let mut parsed = codec::parse(&buf[..end], self.is_response, false);
                parsed.body.clear();
                self.message = parsed;
                self.head_done = true;
                end
            }
            None => {
                let mut parsed = codec::parse(buf, self.is_response, false);
                parsed.body.clear();
                self.message = parsed;
                if buf.len() > self.max_head_bytes {
                    // Give up on this head; treat what follows as opaque body
                    self.head_done = true;
                    return buf.len();
                }
                buf.len()
            }
        }
    }

    fn reset(&mut self) {
        self.message = HttpMessage::default();
        self.head_buf.clear();
        self.head_done = false;
        self.body_len = 0;
        self.tail.clear();
        self.saw_terminator = false;
        self.complete = false;
    }

    fn push_body(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.body_len += data.len() as u64;

        let captured = self.message.body.len();
        if captured < self.capture_limit {
            let take = (self.capture_limit - captured).min(data.len());
            self.message.body.extend_from_slice(&data[..take]);
        }

        if !self.saw_terminator {
            let mut window = std::mem::take(&mut self.tail);
            window.extend_from_slice(data);
            self.saw_terminator = window
                .windows(codec::CHUNKED_TERMINATOR.len())
                .any(|w| w == codec::CHUNKED_TERMINATOR);
            let keep = window.len().min(TERMINATOR_TAIL);
            self.tail = window.split_off(window.len() - keep);
        }
    }

    fn evaluate(&self) -> bool {
        let headers = &self.message.headers;
        if let Some(expected) = codec::content_length(headers) {
            return self.body_len >= expected;
        }
        if codec::is_chunked(headers) {
            return self.saw_terminator;
        }
        // Requests without framing carry no body; responses are read until close
        !self.is_response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_acc() -> MessageAccumulator {
        MessageAccumulator::response(512 * 1024, 64 * 1024)
    }

    #[test]
    fn duplicate_headers_are_comma_joined() {
        let headers: HeaderMap = vec![("Accept", "text/html"), ("ACCEPT", "application/json")]
            .into_iter()
            .collect();
        assert_eq!(headers.get("accept"), Some("text/html, application/json"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn insert_replaces_and_remove_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Proxy-Authorization", "Basic a");
        headers.insert("proxy-authorization", "Basic b");
        assert_eq!(headers.get("PROXY-AUTHORIZATION"), Some("Basic b"));
        assert_eq!(headers.remove("Proxy-Authorization").as_deref(), Some("Basic b"));
        assert!(headers.is_empty());
    }

    #[test]
    fn content_length_completes_across_many_chunks() {
        let mut acc = response_acc();
        let first = acc.append(b"HTTP/1.1 200 OK\r\nContent-Length: 16\r\n\r\n0123");
        assert!(first.new_message);
        assert!(!first.complete);
        assert!(!acc.append(b"4567").complete);
        assert!(!acc.append(b"89ab").complete);
        let last = acc.append(b"cdef");
        assert!(last.complete);
        assert_eq!(last.body_len, 16);
        assert_eq!(last.counter, 4);
        assert_eq!(acc.message().body, b"0123456789abcdef");
        assert_eq!(acc.message().status_code(), Some(200));
    }

    #[test]
    fn chunked_completes_only_after_terminator() {
        let mut acc = response_acc();
        acc.append(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nRust\r\n");
        assert!(!acc.is_complete());
        acc.append(b"0\r\n");
        assert!(!acc.is_complete());
        // terminator split across two reads
        acc.append(b"\r\n");
        assert!(acc.is_complete());
    }

    #[test]
    fn response_without_framing_never_completes() {
        let mut acc = response_acc();
        acc.append(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nhello");
        acc.append(b" world");
        assert!(!acc.is_complete());
        assert_eq!(acc.message().body_text(), "hello world");
    }

    #[test]
    fn next_message_starts_after_completion() {
        let mut acc = MessageAccumulator::request(1024, 1024);
        let first = acc.append(b"GET /a HTTP/1.1\r\nHost: a\r\n\r\n");
        assert!(first.complete);
        let second = acc.append(b"POST /b HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\n");
        assert!(second.new_message);
        assert_eq!(second.messages, 2);
        assert_eq!(acc.message().path(), Some("/b"));
        assert!(!second.complete);
        assert!(acc.append(b"ok").complete);
    }

    #[test]
    fn head_split_across_reads_is_reassembled() {
        let mut acc = response_acc();
        acc.append(b"HTTP/1.1 404 Not Found\r\nContent-Le");
        assert!(!acc.is_complete());
        let progress = acc.append(b"ngth: 3\r\n\r\nabc");
        assert!(progress.complete);
        assert_eq!(acc.message().headers.get("content-length"), Some("3"));
        assert_eq!(acc.message().body, b"abc");
    }

    #[test]
    fn opaque_bytes_accumulate_as_body() {
        let mut acc = MessageAccumulator::request(4, 1024);
        let progress = acc.append(&[0x16, 0x03, 0x01, 0x02, 0x00]);
        assert!(!progress.new_message);
        assert_eq!(progress.body_len, 5);
        assert_eq!(acc.message().body.len(), 4, "capture is capped");
    }
}
