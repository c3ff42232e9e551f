//! Table of live sessions
//!
//! The only state shared between connections. Each connection task inserts
//! its own session and removes it when its [`Registration`] guard drops.

use dashmap::DashMap;
use std::sync::Arc;

use crate::proxy::session::{Session, SessionSnapshot};

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<DashMap<String, Session>>,
}

/// Keeps a session registered for as long as it is alive.
#[must_use = "the session is unregistered when the registration drops"]
pub struct Registration {
    sessions: Arc<DashMap<String, Session>>,
    session: Session,
}

impl Registration {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Only remove our own entry; a reused id may belong to a newer session
        let removed = self
            .sessions
            .remove_if(self.session.id(), |_, current| {
                current.same_as(&self.session)
            });
        if removed.is_some() {
            tracing::trace!(id = %self.session.id(), "session unregistered");
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Session) -> Registration {
        if let Some(previous) = self.sessions.insert(session.id().to_string(), session.clone()) {
            tracing::warn!(id = %previous.id(), "replacing session with duplicate id");
        }
        Registration {
            sessions: self.sessions.clone(),
            session,
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Ask a session to tear down. Removal still happens from its own task.
    pub fn destroy(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => session.destroy(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_removes_entry_once() {
        let registry = ConnectionRegistry::new();
        let registration = registry.register(Session::new("127.0.0.1:1000"));
        assert!(registry.contains("127.0.0.1:1000"));
        assert_eq!(registry.len(), 1);
        drop(registration);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_guard_does_not_remove_newer_session() {
        let registry = ConnectionRegistry::new();
        let old = registry.register(Session::new("dup"));
        let newer = registry.register(Session::new("dup"));
        drop(old);
        assert!(registry.contains("dup"));
        drop(newer);
        assert!(!registry.contains("dup"));
    }

    #[test]
    fn destroy_signals_but_keeps_entry_until_guard_drops() {
        let registry = ConnectionRegistry::new();
        let registration = registry.register(Session::new("a"));
        assert!(registry.destroy("a"));
        assert!(!registry.destroy("a"));
        assert!(registration.session().is_destroyed());
        assert_eq!(registry.ids(), vec!["a".to_string()]);
        assert!(!registry.destroy("missing"));
    }
}
