//! Shared application state.

use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::tracker::RequestTracker;
use cok_shared::auth::AuthService;
use cok_shared::ratelimit::RateLimiter;
use cok_shared::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tokio::time::Duration;

/// Default timeout a tracked request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect-rate limiter: 5 requests/second, burst of 10.
const CONNECT_RATE_CAPACITY: u32 = 10;
const CONNECT_RATE_REFILL_PER_SECOND: f64 = 5.0;

/// Default HTTP ingress rate limiter: generous per-IP burst so normal
/// browsing isn't throttled, still bounding abuse.
const HTTP_RATE_CAPACITY: u32 = 100;
const HTTP_RATE_REFILL_PER_SECOND: f64 = 50.0;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Registry,
    pub tracker: RequestTracker,
    pub auth: Arc<AuthService>,
    pub connect_rate_limiter: Arc<RateLimiter>,
    pub http_rate_limiter: Arc<RateLimiter>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let auth = Arc::new(AuthService::new(config.api_key_secret.clone().into_bytes()));
        let registry = Registry::new(config.max_tunnels);
        let tracker = RequestTracker::new(DEFAULT_REQUEST_TIMEOUT);

        Self {
            config: Arc::new(config),
            registry,
            tracker,
            auth,
            connect_rate_limiter: Arc::new(RateLimiter::new(
                CONNECT_RATE_CAPACITY,
                CONNECT_RATE_REFILL_PER_SECOND,
            )),
            http_rate_limiter: Arc::new(RateLimiter::new(
                HTTP_RATE_CAPACITY,
                HTTP_RATE_REFILL_PER_SECOND,
            )),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }
}
