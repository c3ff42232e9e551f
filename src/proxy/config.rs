//! Proxy configuration
//!
//! [`ProxyOptions`] is the programmatic surface handed to the engine.
//! [`ProxySettings`] is its declarative counterpart, loadable from JSON.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::proxy::auth::AuthVerifier;
use crate::proxy::cert_manager::{KeyMaterial, KeySource};
use crate::proxy::inject::Injector;
use crate::proxy::session::Session;
use crate::proxy::target::UpstreamResolver;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_BODY_CAPTURE_BYTES: usize = 512 * 1024;

/// Whether and where to chain to another proxy
#[derive(Clone, Default)]
pub enum Upstream {
    #[default]
    None,
    /// Always chain to this `host:port` (userinfo allowed)
    Static(String),
    Dynamic(Arc<dyn UpstreamResolver>),
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::None => f.write_str("None"),
            Upstream::Static(target) => f.debug_tuple("Static").field(target).finish(),
            Upstream::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

pub type OutgoingAddressFn = Arc<dyn Fn(&[u8], &Session) -> Option<IpAddr> + Send + Sync>;

/// Local address outbound sockets bind to
#[derive(Clone, Default)]
pub enum OutgoingAddress {
    #[default]
    Any,
    Fixed(IpAddr),
    Dynamic(OutgoingAddressFn),
}

impl OutgoingAddress {
    pub fn resolve(&self, data: &[u8], session: &Session) -> Option<IpAddr> {
        match self {
            OutgoingAddress::Any => None,
            OutgoingAddress::Fixed(addr) => Some(*addr),
            OutgoingAddress::Dynamic(f) => f(data, session),
        }
    }
}

impl fmt::Debug for OutgoingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutgoingAddress::Any => f.write_str("Any"),
            OutgoingAddress::Fixed(addr) => f.debug_tuple("Fixed").field(addr).finish(),
            OutgoingAddress::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Runtime options for the engine
#[derive(Clone)]
pub struct ProxyOptions {
    pub upstream: Upstream,
    pub tcp_outgoing_address: OutgoingAddress,
    /// Transform for client-to-upstream bytes
    pub inject_data: Option<Arc<dyn Injector>>,
    /// Transform for upstream-to-client bytes
    pub inject_response: Option<Arc<dyn Injector>>,
    pub auth: Option<Arc<dyn AuthVerifier>>,
    /// Terminate TLS inside CONNECT tunnels
    pub intercept: bool,
    pub keys: KeySource,
    /// Verify upstream certificates against webpki roots when intercepting
    pub verify_upstream_tls: bool,
    pub connect_timeout: Duration,
    pub max_header_bytes: usize,
    pub max_body_capture_bytes: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            upstream: Upstream::None,
            tcp_outgoing_address: OutgoingAddress::Any,
            inject_data: None,
            inject_response: None,
            auth: None,
            intercept: false,
            keys: KeySource::Default,
            verify_upstream_tls: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_header_bytes: MAX_HEADER_BYTES,
            max_body_capture_bytes: MAX_BODY_CAPTURE_BYTES,
        }
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("upstream", &self.upstream)
            .field("tcp_outgoing_address", &self.tcp_outgoing_address)
            .field("inject_data", &self.inject_data.is_some())
            .field("inject_response", &self.inject_response.is_some())
            .field("auth", &self.auth.is_some())
            .field("intercept", &self.intercept)
            .field("keys", &self.keys)
            .field("verify_upstream_tls", &self.verify_upstream_tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// File/CLI configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub port: u16,
    pub bind_address: String,
    pub intercept: bool,
    pub verbose: bool,
    /// Static upstream proxy, `[user:pass@]host:port`
    pub upstream: Option<String>,
    pub tcp_outgoing_address: Option<IpAddr>,
    /// PEM certificate chain for interception
    pub cert_path: Option<PathBuf>,
    /// PEM private key for interception
    pub key_path: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub verify_upstream_tls: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            intercept: false,
            verbose: false,
            upstream: None,
            tcp_outgoing_address: None,
            cert_path: None,
            key_path: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            verify_upstream_tls: false,
            log_dir: None,
        }
    }
}

impl ProxySettings {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Invalid proxy settings JSON")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn into_options(&self) -> anyhow::Result<ProxyOptions> {
        let keys = match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => KeySource::Static(KeyMaterial::from_pem_files(cert, key)?),
            (None, None) => KeySource::Default,
            _ => return Err(anyhow!("cert_path and key_path must be set together")),
        };

        let upstream = match self.upstream.as_deref().map(str::trim) {
            Some(target) if !target.is_empty() => Upstream::Static(target.to_string()),
            _ => Upstream::None,
        };

        Ok(ProxyOptions {
            upstream,
            tcp_outgoing_address: self
                .tcp_outgoing_address
                .map(OutgoingAddress::Fixed)
                .unwrap_or_default(),
            intercept: self.intercept,
            keys,
            verify_upstream_tls: self.verify_upstream_tls,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            ..ProxyOptions::default()
        })
    }
}
