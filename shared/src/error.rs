//! Error kinds shared between the relay and the client.
//!
//! Structural failures
//! (bad frame, auth) are meant to close the connection, while
//! request-scoped failures (origin down, timeout) are meant to be
//! turned into an HTTP-style response by the caller rather than
//! propagated as a transport error.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed handshake or frame; connection must close.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid or expired API key.
    #[error("authentication failed")]
    Auth,

    /// Rejected by a rate limiter or capacity check (429/503).
    #[error("admission rejected: {0}")]
    Admission(String),

    /// No live session for the requested subdomain (502).
    #[error("no tunnel for subdomain '{0}'")]
    TunnelNotFound(String),

    /// A tracked request's deadline elapsed before a response arrived (504).
    #[error("request timed out")]
    Timeout,

    /// The session's outbound queue is full (503).
    #[error("backpressure: outbound queue full")]
    Backpressure,

    /// The local origin failed or timed out; the tunnel itself stays up.
    #[error("origin error: {0}")]
    Origin(String),

    /// The control channel closed while requests were still outstanding.
    #[error("transport closed")]
    TransportClosed,

    #[error("subdomain taken")]
    SubdomainTaken,

    #[error("tunnel capacity reached")]
    CapacityReached,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}
