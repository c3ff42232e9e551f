//! Per-connection session state
//!
//! A [`Session`] is a cheap, cloneable handle onto the state of one accepted
//! connection. The connection task that owns the sockets drives it; everyone
//! else (injectors, verifiers, the registry) only observes it, or asks for it
//! to be destroyed.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::models::{HttpMessage, MessageAccumulator, MessageProgress, Tunnel};

const DEFAULT_CAPTURE_BYTES: usize = 512 * 1024;
const DEFAULT_HEAD_BYTES: usize = 64 * 1024;

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Unauthenticated,
    ResolvingTarget,
    TunnelPending,
    Relaying,
    TlsRelaying,
    Closed,
}

/// Point-in-time copy of the observable session fields
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub phase: SessionPhase,
    pub tunnel: Option<Tunnel>,
    pub is_https: bool,
    pub intercepted: bool,
    pub user: Option<String>,
    pub request_chunks: u64,
    pub response_chunks: u64,
}

struct SessionState {
    phase: SessionPhase,
    tunnel: Option<Tunnel>,
    is_https: bool,
    intercepted: bool,
    authenticated: bool,
    user: Option<String>,
    request: MessageAccumulator,
    response: MessageAccumulator,
}

struct Shared {
    id: String,
    state: Mutex<SessionState>,
    destroyed: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_limits(id, DEFAULT_CAPTURE_BYTES, DEFAULT_HEAD_BYTES)
    }

    pub fn with_limits(id: impl Into<String>, capture_limit: usize, max_head_bytes: usize) -> Self {
        let (destroyed, _) = watch::channel(false);
        let state = SessionState {
            phase: SessionPhase::ResolvingTarget,
            tunnel: None,
            is_https: false,
            intercepted: false,
            authenticated: false,
            user: None,
            request: MessageAccumulator::request(capture_limit, max_head_bytes),
            response: MessageAccumulator::response(capture_limit, max_head_bytes),
        };
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                state: Mutex::new(state),
                destroyed,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // Accumulator updates cannot leave the state half-written
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether both handles refer to the same session
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    pub fn tunnel(&self) -> Option<Tunnel> {
        self.state().tunnel.clone()
    }

    pub fn is_https(&self) -> bool {
        self.state().is_https
    }

    pub fn is_intercepted(&self) -> bool {
        self.state().intercepted
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().authenticated
    }

    pub fn user(&self) -> Option<String> {
        self.state().user.clone()
    }

    /// Current (possibly partial) request in the client-to-upstream direction
    pub fn request(&self) -> HttpMessage {
        self.state().request.message().clone()
    }

    /// Current (possibly partial) response in the upstream-to-client direction
    pub fn response(&self) -> HttpMessage {
        self.state().response.message().clone()
    }

    pub fn request_complete(&self) -> bool {
        self.state().request.is_complete()
    }

    pub fn response_complete(&self) -> bool {
        self.state().response.is_complete()
    }

    pub fn append_request_bytes(&self, chunk: &[u8]) -> MessageProgress {
        self.state().request.append(chunk)
    }

    pub fn append_response_bytes(&self, chunk: &[u8]) -> MessageProgress {
        self.state().response.append(chunk)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            id: self.shared.id.clone(),
            phase: state.phase,
            tunnel: state.tunnel.clone(),
            is_https: state.is_https,
            intercepted: state.intercepted,
            user: state.user.clone(),
            request_chunks: state.request.counter(),
            response_chunks: state.response.counter(),
        }
    }

    pub(crate) fn advance(&self, phase: SessionPhase) {
        let mut state = self.state();
        if state.phase != SessionPhase::Closed {
            tracing::trace!(id = %self.shared.id, from = ?state.phase, to = ?phase, "session phase");
            state.phase = phase;
        }
    }

    pub(crate) fn set_tunnel(&self, tunnel: Tunnel) {
        self.state().tunnel = Some(tunnel);
    }

    pub(crate) fn set_https(&self, is_https: bool) {
        self.state().is_https = is_https;
    }

    /// Flag the session as intercepted. Returns false if it already was.
    pub(crate) fn mark_intercepted(&self) -> bool {
        let mut state = self.state();
        if state.intercepted {
            return false;
        }
        state.intercepted = true;
        true
    }

    /// Remove a header from the recorded request once the proxy consumed it.
    pub(crate) fn strip_request_header(&self, name: &str) {
        self.state().request.remove_header(name);
    }

    pub(crate) fn set_user_authentication(&self, user: &str) {
        let mut state = self.state();
        state.authenticated = true;
        state.user = Some(user.to_string());
    }

    /// Request teardown. Safe to call any number of times; returns true only
    /// for the call that actually flipped the session to destroyed.
    pub fn destroy(&self) -> bool {
        let flipped = self.shared.destroyed.send_if_modified(|destroyed| {
            if *destroyed {
                false
            } else {
                *destroyed = true;
                true
            }
        });
        if flipped {
            self.state().phase = SessionPhase::Closed;
            tracing::debug!(id = %self.shared.id, "session destroyed");
        }
        flipped
    }

    pub fn is_destroyed(&self) -> bool {
        *self.shared.destroyed.borrow()
    }

    /// Resolves once [`Session::destroy`] has been called.
    pub async fn destroyed(&self) {
        let mut rx = self.shared.destroyed.subscribe();
        // The sender lives as long as `self`, so this only ends on `true`
        let _ = rx.wait_for(|destroyed| *destroyed).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("phase", &state.phase)
            .field("tunnel", &state.tunnel)
            .field("is_https", &state.is_https)
            .field("intercepted", &state.intercepted)
            .field("authenticated", &state.authenticated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scheme;
    use std::time::Duration;

    #[test]
    fn destroy_is_idempotent_and_terminal() {
        let session = Session::new("127.0.0.1:5000");
        session.advance(SessionPhase::Relaying);
        assert!(session.destroy());
        assert!(!session.destroy());
        assert!(session.is_destroyed());
        session.advance(SessionPhase::TlsRelaying);
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[test]
    fn interception_is_marked_once() {
        let session = Session::new("a");
        assert!(session.mark_intercepted());
        assert!(!session.mark_intercepted());
        assert!(session.is_intercepted());
    }

    #[test]
    fn clones_share_state() {
        let session = Session::new("a");
        let observer = session.clone();
        session.set_tunnel(Tunnel {
            address: "example.com".into(),
            port: 443,
            scheme: Scheme::Https,
            upstream: None,
        });
        session.set_user_authentication("alice");
        session.append_request_bytes(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

        assert_eq!(observer.tunnel().map(|t| t.port), Some(443));
        assert_eq!(observer.user().as_deref(), Some("alice"));
        assert!(observer.is_authenticated());
        assert!(observer.request_complete());
        assert_eq!(observer.snapshot().request_chunks, 1);
    }

    #[tokio::test]
    async fn destroyed_future_wakes_waiters() {
        let session = Session::new("a");
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.destroyed().await })
        };
        tokio::task::yield_now().await;
        session.destroy();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();

        // Already destroyed: returns immediately
        tokio::time::timeout(Duration::from_millis(100), session.destroyed())
            .await
            .unwrap();
    }
}
