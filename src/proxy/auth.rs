//! Basic proxy authentication
//!
//! The gate only looks at `Proxy-Authorization`; deciding whether a pair of
//! credentials is valid is left to a pluggable [`AuthVerifier`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

use crate::models::HttpMessage;
use crate::proxy::session::Session;

pub const PROXY_AUTHORIZATION: &str = "proxy-authorization";

pub trait AuthVerifier: Send + Sync {
    fn verify<'a>(&'a self, user: &'a str, pass: &'a str, session: &'a Session) -> BoxFuture<'a, bool>;
}

struct SyncVerifier<F>(F);

impl<F> AuthVerifier for SyncVerifier<F>
where
    F: Fn(&str, &str, &Session) -> bool + Send + Sync,
{
    fn verify<'a>(&'a self, user: &'a str, pass: &'a str, session: &'a Session) -> BoxFuture<'a, bool> {
        let accepted = (self.0)(user, pass, session);
        async move { accepted }.boxed()
    }
}

struct AsyncVerifier<F>(F);

impl<F, Fut> AuthVerifier for AsyncVerifier<F>
where
    F: Fn(String, String, Session) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn verify<'a>(&'a self, user: &'a str, pass: &'a str, session: &'a Session) -> BoxFuture<'a, bool> {
        (self.0)(user.to_string(), pass.to_string(), session.clone()).boxed()
    }
}

/// Verifier from a synchronous predicate
pub fn auth_fn<F>(f: F) -> Arc<dyn AuthVerifier>
where
    F: Fn(&str, &str, &Session) -> bool + Send + Sync + 'static,
{
    Arc::new(SyncVerifier(f))
}

/// Verifier from an async predicate
pub fn auth_async<F, Fut>(f: F) -> Arc<dyn AuthVerifier>
where
    F: Fn(String, String, Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(AsyncVerifier(f))
}

/// Result of gating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No credentials supplied; challenge and keep the connection
    Challenge,
    Accepted { user: String },
    /// Credentials supplied but refused (or not decodable)
    Rejected,
}

/// Decode `Basic <base64(user:pass)>` into `(user, pass)`.
pub fn decode_basic(value: &str) -> Option<(String, String)> {
    let value = value.trim();
    let (scheme, encoded) = value.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Check the credentials carried by `request`.
///
/// On acceptance the session is marked authenticated.
pub async fn authenticate(
    verifier: &dyn AuthVerifier,
    request: &HttpMessage,
    session: &Session,
) -> AuthOutcome {
    let Some(header) = request.headers.get(PROXY_AUTHORIZATION) else {
        return AuthOutcome::Challenge;
    };
    let Some((user, pass)) = decode_basic(header) else {
        tracing::debug!(id = %session.id(), "undecodable proxy credentials");
        return AuthOutcome::Rejected;
    };

    if verifier.verify(&user, &pass, session).await {
        session.set_user_authentication(&user);
        AuthOutcome::Accepted { user }
    } else {
        tracing::debug!(id = %session.id(), user = %user, "proxy credentials rejected");
        AuthOutcome::Rejected
    }
}
