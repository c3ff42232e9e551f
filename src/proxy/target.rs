//! Target resolution
//!
//! Turns a request-target (absolute URI, `host:port`, or bare host) plus an
//! optional upstream-proxy decision into [`ConnectionOptions`].

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

use crate::models::{ConnectionOptions, Endpoint, Scheme};
use crate::proxy::config::Upstream;
use crate::proxy::session::Session;

/// Decision value meaning "do not chain, connect directly".
pub const DIRECT_SENTINEL: &str = "localhost";

/// Parse a target string into an endpoint.
///
/// Returns `None` for non-ASCII input, an empty host, or a port that is not a
/// number in `0..=65535`.
pub fn resolve_initial(target: &str) -> Option<Endpoint> {
    let target = target.trim();
    if !target.is_ascii() {
        return None;
    }

    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, target),
    };

    let authority_end = rest
        .find(|c: char| matches!(c, '/' | '?' | '#'))
        .unwrap_or(rest.len());
    let authority = &rest[..authority_end];

    let (credentials, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => (Some(userinfo.to_string()), host_port),
        None => (None, authority),
    };

    let (host, port_literal) = split_host_port(host_port)?;
    if host.is_empty() {
        return None;
    }

    let port = match port_literal {
        Some(literal) => Some(parse_port(literal)?),
        None => None,
    };

    let scheme = match scheme.as_deref() {
        Some("https") | Some("wss") => Scheme::Https,
        Some(_) => Scheme::Http,
        None if port_literal == Some("443") => Scheme::Https,
        None => Scheme::Http,
    };

    Some(Endpoint {
        host: host.to_ascii_lowercase(),
        port: port.unwrap_or_else(|| scheme.default_port()),
        scheme,
        credentials: credentials.filter(|c| !c.is_empty()),
    })
}

/// Split `host[:port]`, honouring `[v6]:port`.
fn split_host_port(input: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after.strip_prefix(':') {
            Some(port) => Some((host, Some(port))),
            None if after.is_empty() => Some((host, None)),
            None => None,
        };
    }
    match input.rsplit_once(':') {
        // Unbracketed IPv6 literal, no port
        Some((host, _)) if host.contains(':') => Some((input, None)),
        Some((host, port)) => Some((host, Some(port))),
        None => Some((input, None)),
    }
}

fn parse_port(literal: &str) -> Option<u16> {
    if literal.is_empty() || !literal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    literal.parse::<u16>().ok()
}

/// Combine an upstream decision with the original target.
///
/// A non-empty decision other than [`DIRECT_SENTINEL`] becomes the socket
/// endpoint and the original target is kept as `upstream`.
pub fn resolve_with_upstream(decision: Option<&str>, target: &str) -> Option<ConnectionOptions> {
    let original = resolve_initial(target)?;
    match decision.map(str::trim) {
        Some(proxy) if !proxy.is_empty() && proxy != DIRECT_SENTINEL => {
            let endpoint = resolve_initial(proxy)?;
            Some(ConnectionOptions {
                endpoint,
                upstream: Some(original),
                local_address: None,
            })
        }
        _ => Some(ConnectionOptions::direct(original)),
    }
}

/// Decides, per session, whether to chain through another proxy.
///
/// Receives the raw bytes of the first request. Returning `None`, an empty
/// string or `"localhost"` means "connect directly".
pub trait UpstreamResolver: Send + Sync {
    fn resolve<'a>(&'a self, data: &'a [u8], session: &'a Session) -> BoxFuture<'a, Option<String>>;
}

struct SyncUpstream<F>(F);

impl<F> UpstreamResolver for SyncUpstream<F>
where
    F: Fn(&[u8], &Session) -> Option<String> + Send + Sync,
{
    fn resolve<'a>(&'a self, data: &'a [u8], session: &'a Session) -> BoxFuture<'a, Option<String>> {
        let decision = (self.0)(data, session);
        async move { decision }.boxed()
    }
}

struct AsyncUpstream<F>(F);

impl<F, Fut> UpstreamResolver for AsyncUpstream<F>
where
    F: Fn(Vec<u8>, Session) -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    fn resolve<'a>(&'a self, data: &'a [u8], session: &'a Session) -> BoxFuture<'a, Option<String>> {
        (self.0)(data.to_vec(), session.clone()).boxed()
    }
}

/// Upstream decision from a synchronous closure
pub fn upstream_fn<F>(f: F) -> Arc<dyn UpstreamResolver>
where
    F: Fn(&[u8], &Session) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(SyncUpstream(f))
}

/// Upstream decision from an async closure
pub fn upstream_async<F, Fut>(f: F) -> Arc<dyn UpstreamResolver>
where
    F: Fn(Vec<u8>, Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    Arc::new(AsyncUpstream(f))
}

/// Evaluate the configured upstream policy for a session.
pub async fn decide_upstream(upstream: &Upstream, data: &[u8], session: &Session) -> Option<String> {
    let decision = match upstream {
        Upstream::None => None,
        Upstream::Static(target) => Some(target.clone()),
        Upstream::Dynamic(resolver) => resolver.resolve(data, session).await,
    };
    decision.filter(|d| !d.trim().is_empty() && d.trim() != DIRECT_SENTINEL)
}
