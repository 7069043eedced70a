//! Registry of live server sessions.
//!
//! `SessionRegistry` stores non-owning weak references to per-connection
//! session state, allowing other threads to publish events to connected
//! clients without keeping closed connections alive. Dead entries are pruned
//! whenever the live sessions are collected.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;

use crate::connection::ConnectionId;

/// Concurrent registry of session state keyed by [`ConnectionId`].
pub struct SessionRegistry<S>(DashMap<ConnectionId, Weak<S>>);

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self { Self(DashMap::new()) }
}

impl<S> std::fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("entries", &self.0.len())
            .finish()
    }
}

impl<S> SessionRegistry<S> {
    /// Insert the session of a newly established connection.
    pub fn insert(&self, id: ConnectionId, session: &Arc<S>) { self.0.insert(id, Arc::downgrade(session)); }

    /// Remove a session, typically on connection teardown.
    pub fn remove(&self, id: &ConnectionId) { self.0.remove(id); }

    /// Number of entries, live or not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether the registry holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Prune stale weak references, then collect the remaining live sessions.
    ///
    /// This holds per-bucket write locks while iterating.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<(ConnectionId, Arc<S>)> {
        let mut sessions = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if let Some(session) = weak.upgrade() {
                sessions.push((*id, session));
                true
            } else {
                false
            }
        });
        sessions
    }
}

/// Server-side event fan-out to connected clients.
pub trait EventPublisher: Send + Sync {
    /// Deliver `payload` to every session interested in `destination`.
    /// Returns the number of sessions it was queued for.
    fn publish(&self, destination: &str, payload: Bytes) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_sessions_disappear() {
        let registry = SessionRegistry::<String>::default();
        let live = Arc::new("live".to_owned());
        let dead = Arc::new("dead".to_owned());
        registry.insert(ConnectionId::new(1), &live);
        registry.insert(ConnectionId::new(2), &dead);
        drop(dead);
        assert_eq!(registry.len(), 2);

        let sessions = registry.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].0, ConnectionId::new(1));
        assert_eq!(*sessions[0].1, "live");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removed_sessions_are_forgotten() {
        let registry = SessionRegistry::<u8>::default();
        let a = Arc::new(1);
        registry.insert(ConnectionId::new(1), &a);
        registry.remove(&ConnectionId::new(1));
        assert!(registry.is_empty());
        assert!(registry.active_sessions().is_empty());
    }
}
