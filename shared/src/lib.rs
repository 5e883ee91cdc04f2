//! Cok shared library.
//!
//! Wire protocol, subdomain validation, authentication, rate limiting,
//! the reconnect circuit breaker, and graceful shutdown plumbing
//! shared between the relay server and the tunnel client.

pub mod auth;
pub mod circuit;
pub mod error;
pub mod protocol;
pub mod ratelimit;
pub mod shutdown;
pub mod subdomain;

pub use error::{Error, Result};
