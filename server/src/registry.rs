//! Tunnel registry (Connection Manager).
//!
//! Subdomain → live session, one active session per subdomain.
//! `by_id` and `by_subdomain` are always kept consistent: a session is
//! in `by_id` iff it is in `by_subdomain` under its own subdomain.

use cok_shared::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// An outbound frame, already encoded for the transport.
pub type OutboundFrame = Vec<u8>;

/// A live tunnel: the registry's view of one connected client.
#[derive(Clone)]
pub struct TunnelSession {
    pub id: Uuid,
    pub subdomain: String,
    pub api_key_fingerprint: String,
    pub connected_at: std::time::SystemTime,
    sink: mpsc::Sender<OutboundFrame>,
    /// request_ids currently in flight on this session, so teardown
    /// can fail exactly the waiters this session owns.
    owned_requests: Arc<DashMap<Uuid, ()>>,
}

impl TunnelSession {
    /// Enqueue a frame for delivery to the client. Fails fast with
    /// `Backpressure` if the bounded sink is full or `TransportClosed`
    /// if the connection has already torn down.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        match self.sink.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::TransportClosed),
        }
    }

    pub fn track_request(&self, request_id: Uuid) {
        self.owned_requests.insert(request_id, ());
    }

    pub fn untrack_request(&self, request_id: Uuid) {
        self.owned_requests.remove(&request_id);
    }

    pub fn owned_request_ids(&self) -> Vec<Uuid> {
        self.owned_requests.iter().map(|e| *e.key()).collect()
    }
}

/// Default bound on a session's outbound sink.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

struct Inner {
    by_id: DashMap<Uuid, TunnelSession>,
    by_subdomain: DashMap<String, Uuid>,
    max_tunnels: usize,
}

/// Registry of live tunnel sessions, shared across the server.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(max_tunnels: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                by_id: DashMap::new(),
                by_subdomain: DashMap::new(),
                max_tunnels,
            }),
        }
    }

    /// Register a new session, allocating its outbound sink. Returns
    /// the session and the receiving half the control connection
    /// should drain to write frames to the transport.
    pub fn register(
        &self,
        subdomain: String,
        api_key_fingerprint: String,
    ) -> Result<(TunnelSession, mpsc::Receiver<OutboundFrame>)> {
        if self.inner.by_id.len() >= self.inner.max_tunnels {
            return Err(Error::CapacityReached);
        }
        if self.inner.by_subdomain.contains_key(&subdomain) {
            return Err(Error::SubdomainTaken);
        }

        let (tx, rx) = mpsc::channel(DEFAULT_SINK_CAPACITY);
        let id = Uuid::new_v4();
        let session = TunnelSession {
            id,
            subdomain: subdomain.clone(),
            api_key_fingerprint,
            connected_at: std::time::SystemTime::now(),
            sink: tx,
            owned_requests: Arc::new(DashMap::new()),
        };

        // Re-check under a fresh entry call to avoid a race between two
        // concurrent registrations for the same subdomain.
        match self.inner.by_subdomain.entry(subdomain.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(Error::SubdomainTaken),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(id);
            }
        }
        self.inner.by_id.insert(id, session.clone());

        Ok((session, rx))
    }

    /// Idempotent: removes from both maps.
    pub fn unregister(&self, id: Uuid) {
        if let Some((_, session)) = self.inner.by_id.remove(&id) {
            self.inner.by_subdomain.remove(&session.subdomain);
        }
    }

    pub fn get_by_subdomain(&self, subdomain: &str) -> Option<TunnelSession> {
        let id = *self.inner.by_subdomain.get(subdomain)?;
        self.inner.by_id.get(&id).map(|s| s.clone())
    }

    pub fn count(&self) -> usize {
        self.inner.by_id.len()
    }

    pub fn list(&self) -> Vec<TunnelSession> {
        self.inner.by_id.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_by_subdomain() {
        let registry = Registry::new(10);
        let (session, _rx) = registry.register("demo".into(), "fp".into()).unwrap();
        let found = registry.get_by_subdomain("demo").unwrap();
        assert_eq!(found.id, session.id);
    }

    #[test]
    fn rejects_duplicate_subdomain() {
        let registry = Registry::new(10);
        let (_s, _rx) = registry.register("demo".into(), "fp".into()).unwrap();
        let err = registry.register("demo".into(), "fp2".into()).unwrap_err();
        assert!(matches!(err, Error::SubdomainTaken));
    }

    #[test]
    fn rejects_past_capacity() {
        let registry = Registry::new(1);
        let (_s, _rx) = registry.register("a".into(), "fp".into()).unwrap();
        let err = registry.register("b".into(), "fp".into()).unwrap_err();
        assert!(matches!(err, Error::CapacityReached));
    }

    #[test]
    fn unregister_is_idempotent_and_frees_subdomain() {
        let registry = Registry::new(10);
        let (session, _rx) = registry.register("demo".into(), "fp".into()).unwrap();
        registry.unregister(session.id);
        registry.unregister(session.id);
        assert!(registry.get_by_subdomain("demo").is_none());
        assert_eq!(registry.count(), 0);

        let (_s2, _rx2) = registry.register("demo".into(), "fp".into()).unwrap();
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn maps_stay_consistent_across_operations() {
        let registry = Registry::new(10);
        let (a, _rx_a) = registry.register("a".into(), "fp".into()).unwrap();
        let (_b, _rx_b) = registry.register("b".into(), "fp".into()).unwrap();
        registry.unregister(a.id);

        for session in registry.list() {
            assert_eq!(
                registry.get_by_subdomain(&session.subdomain).unwrap().id,
                session.id
            );
        }
        assert!(registry.get_by_subdomain("a").is_none());
    }
}
