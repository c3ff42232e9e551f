//! Target and tunnel descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Scheme of a proxied target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host to connect to, either the origin or an upstream proxy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Lower-cased host name or IP literal (IPv6 without brackets)
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    /// `user:pass` taken from the userinfo part, if any
    pub credentials: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
            credentials: None,
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// Credentials stay out of logs
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Where a session actually connects, and what it ultimately targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Address the socket is opened to (the upstream proxy when chained)
    pub endpoint: Endpoint,
    /// Original target when traffic goes through an upstream proxy
    pub upstream: Option<Endpoint>,
    /// Local address the outgoing socket binds to
    pub local_address: Option<IpAddr>,
}

impl ConnectionOptions {
    pub fn direct(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            upstream: None,
            local_address: None,
        }
    }

    pub fn is_chained(&self) -> bool {
        self.upstream.is_some()
    }

    /// The endpoint the client asked for, regardless of chaining
    pub fn target(&self) -> &Endpoint {
        self.upstream.as_ref().unwrap_or(&self.endpoint)
    }
}

/// Where a session's outbound socket points.
///
/// When chained, `address`/`port` name the next proxy and `upstream` keeps
/// the target the client asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub address: String,
    pub port: u16,
    pub scheme: Scheme,
    pub upstream: Option<Endpoint>,
}

impl Tunnel {
    pub fn from_target(target: &Endpoint) -> Self {
        Self {
            address: target.host.clone(),
            port: target.port,
            scheme: target.scheme,
            upstream: None,
        }
    }

    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            upstream: options.upstream.clone(),
            ..Self::from_target(&options.endpoint)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_brackets_ipv6() {
        assert_eq!(Endpoint::new("::1", 8080, Scheme::Http).authority(), "[::1]:8080");
        assert_eq!(
            Endpoint::new("example.com", 443, Scheme::Https).to_string(),
            "https://example.com:443"
        );
    }

    #[test]
    fn debug_hides_credentials() {
        let mut endpoint = Endpoint::new("proxy", 3128, Scheme::Http);
        endpoint.credentials = Some("user:secret".into());
        let rendered = format!("{:?}", endpoint);
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn chained_target_is_the_origin() {
        let origin = Endpoint::new("example.com", 443, Scheme::Https);
        let options = ConnectionOptions {
            endpoint: Endpoint::new("proxyhost", 9000, Scheme::Http),
            upstream: Some(origin.clone()),
            local_address: None,
        };
        assert!(options.is_chained());
        assert_eq!(options.target(), &origin);

        let tunnel = Tunnel::from_options(&options);
        assert_eq!((tunnel.address.as_str(), tunnel.port), ("proxyhost", 9000));
        assert_eq!(tunnel.upstream, Some(origin));
    }
}
