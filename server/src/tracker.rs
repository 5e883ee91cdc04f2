//! Request tracker.
//!
//! Correlates outstanding `request_id`s with blocked public HTTP
//! handlers via oneshot channels, independent of any one transport.
//! Owns the deadline timer and the `Timeout`/`orphan-response`
//! outcomes.

use cok_shared::protocol::HttpResponseMessage;
use cok_shared::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::warn;
use uuid::Uuid;

struct Inner {
    pending: DashMap<Uuid, oneshot::Sender<Result<HttpResponseMessage>>>,
    timeout: Duration,
}

/// Tracks in-flight requests across all sessions.
#[derive(Clone)]
pub struct RequestTracker {
    inner: Arc<Inner>,
}

impl RequestTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                timeout,
            }),
        }
    }

    /// Register `request_id` and return a future resolving to its
    /// response, a tracker-reported error, or `Timeout` once
    /// `self.timeout` elapses. The entry is always removed before this
    /// future resolves, so a `complete`/`fail` racing the deadline
    /// will observe a missing waiter and log `orphan-response`.
    pub async fn track(&self, request_id: Uuid) -> Result<HttpResponseMessage> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id, tx);

        let inner = self.inner.clone();
        tokio::select! {
            result = rx => result.unwrap_or(Err(Error::TransportClosed)),
            _ = tokio::time::sleep(inner.timeout) => {
                inner.pending.remove(&request_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Resolve a waiter with a successful response. Logs
    /// `orphan-response` and drops silently if no waiter exists.
    pub fn complete(&self, request_id: Uuid, response: HttpResponseMessage) {
        self.resolve(request_id, Ok(response));
    }

    /// Resolve a waiter with an error (e.g. on transport teardown).
    pub fn fail(&self, request_id: Uuid, err: Error) {
        self.resolve(request_id, Err(err));
    }

    fn resolve(&self, request_id: Uuid, outcome: Result<HttpResponseMessage>) {
        match self.inner.pending.remove(&request_id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => warn!(request_id = %request_id, "orphan-response"),
        }
    }

    /// Fail every pending waiter for requests that belonged to a
    /// session whose transport just closed.
    pub fn fail_all(&self, request_ids: &[Uuid], err_factory: impl Fn() -> Error) {
        for id in request_ids {
            self.fail(*id, err_factory());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(request_id: Uuid) -> HttpResponseMessage {
        HttpResponseMessage {
            request_id,
            status: 200,
            headers: vec![],
            body: b"pong".to_vec(),
        }
    }

    #[tokio::test]
    async fn completes_with_response() {
        let tracker = RequestTracker::new(Duration::from_secs(5));
        let id = Uuid::new_v4();
        let tracker_clone = tracker.clone();
        let handle = tokio::spawn(async move { tracker_clone.track(id).await });

        tokio::task::yield_now().await;
        tracker.complete(id, sample_response(id));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, 200);
    }

    #[tokio::test]
    async fn times_out_when_nothing_completes_it() {
        let tracker = RequestTracker::new(Duration::from_millis(20));
        let id = Uuid::new_v4();
        let err = tracker.track(id).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn late_completion_after_timeout_is_dropped_not_panicking() {
        let tracker = RequestTracker::new(Duration::from_millis(10));
        let id = Uuid::new_v4();
        let err = tracker.track(id).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // Arrives after the waiter already resolved via timeout.
        tracker.complete(id, sample_response(id));
    }

    #[tokio::test]
    async fn fail_resolves_waiter_with_error() {
        let tracker = RequestTracker::new(Duration::from_secs(5));
        let id = Uuid::new_v4();
        let tracker_clone = tracker.clone();
        let handle = tokio::spawn(async move { tracker_clone.track(id).await });

        tokio::task::yield_now().await;
        tracker.fail(id, Error::TransportClosed);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }
}
