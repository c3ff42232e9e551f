//! Engine error taxonomy and the proxy's canned client responses

use std::io;
use thiserror::Error;

/// `200` acknowledgement for a CONNECT tunnel
pub const OK: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";
pub const BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\r\n";
pub const NOT_FOUND: &[u8] = b"HTTP/1.0 404 Not Found\r\n\r\nNot Found!";
pub const REQUEST_TIMEOUT: &[u8] = b"HTTP/1.0 408 Request Timeout\r\n\r\n";

const AUTH_REQUIRED_HEAD: &str =
    "HTTP/1.0 407 Proxy Authorization Required\r\nProxy-Authenticate: Basic realm=\"\"\r\n\r\n";

/// Challenge sent when credentials are missing; the connection stays open.
pub const AUTH_CHALLENGE: &[u8] = AUTH_REQUIRED_HEAD.as_bytes();

/// Sent once before closing when credentials are rejected.
pub const AUTH_REJECTED: &[u8] = concat!(
    "HTTP/1.0 407 Proxy Authorization Required\r\nProxy-Authenticate: Basic realm=\"\"\r\n\r\n",
    "Proxy Authorization Required!"
)
.as_bytes();

/// Every variant is terminal for the session that raised it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connection to upstream timed out")]
    ConnectTimeout,
    #[error("host not found: {0}")]
    HostNotFound(String),
    #[error("broken pipe: {0}")]
    BrokenPipe(String),
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),
    #[error("proxy authorization rejected")]
    AuthRejected,
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ProxyError {
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ProxyError::ConnectTimeout,
            io::ErrorKind::BrokenPipe => ProxyError::BrokenPipe(err.to_string()),
            _ => ProxyError::Upstream(err.to_string()),
        }
    }

    /// Response written to the client before teardown, if any.
    pub fn client_response(&self) -> Option<&'static [u8]> {
        match self {
            ProxyError::ConnectTimeout => Some(REQUEST_TIMEOUT),
            ProxyError::HostNotFound(_) => Some(NOT_FOUND),
            // The pipe is gone; writing would only fail again
            ProxyError::BrokenPipe(_) => None,
            ProxyError::AuthRejected => Some(AUTH_REJECTED),
            ProxyError::MalformedRequest(_)
            | ProxyError::TlsHandshake(_)
            | ProxyError::Upstream(_) => Some(BAD_REQUEST),
        }
    }

    /// Disconnects that happen in normal operation and only deserve debug logs.
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            ProxyError::BrokenPipe(_) => true,
            ProxyError::Upstream(msg) | ProxyError::TlsHandshake(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("eof")
                    || msg.contains("connection reset")
                    || msg.contains("connection closed")
            }
            _ => false,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::from_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(ProxyError::from(timed_out), ProxyError::ConnectTimeout));

        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(ProxyError::from_io(broken), ProxyError::BrokenPipe(_)));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ProxyError::from_io(refused), ProxyError::Upstream(_)));
    }

    #[test]
    fn responses_follow_the_mapping() {
        assert_eq!(ProxyError::ConnectTimeout.client_response(), Some(REQUEST_TIMEOUT));
        assert_eq!(
            ProxyError::HostNotFound("nowhere.invalid".into()).client_response(),
            Some(NOT_FOUND)
        );
        assert_eq!(ProxyError::BrokenPipe("x".into()).client_response(), None);
        assert_eq!(
            ProxyError::MalformedRequest("x".into()).client_response(),
            Some(BAD_REQUEST)
        );
        assert_eq!(ProxyError::Upstream("x".into()).client_response(), Some(BAD_REQUEST));
        assert_eq!(
            ProxyError::TlsHandshake("x".into()).client_response(),
            Some(BAD_REQUEST)
        );
    }

    #[test]
    fn auth_rejection_carries_body_and_challenge() {
        let response = std::str::from_utf8(AUTH_REJECTED).unwrap();
        assert!(response.starts_with("HTTP/1.0 407 Proxy Authorization Required\r\n"));
        assert!(response.contains("Proxy-Authenticate: Basic realm=\"\"\r\n"));
        assert!(response.ends_with("\r\n\r\nProxy Authorization Required!"));
        assert!(AUTH_CHALLENGE.ends_with(b"\r\n\r\n"));
    }
}
