//! Reconnect circuit breaker.
//!
//! Unlike a server-side breaker that queues requests while a backend
//! is down, this one gates the *client's* reconnect attempts: repeated
//! connect failures open the circuit so the client stops hammering a
//! relay that is down, then probes with a single half-open attempt
//! once the cooldown elapses.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(b: u8) -> Self {
        match b {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a half-open probe.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Gates reconnect attempts for a single client session.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// May the caller attempt a reconnect right now?
    ///
    /// Transitions `Open -> HalfOpen` once the cooldown has elapsed,
    /// admitting exactly that one probing attempt.
    pub async fn allow_attempt(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false, // a probe is already in flight
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock().await;
                if opened_at.elapsed() >= self.config.open_timeout {
                    self.state.store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                    info!("circuit breaker: Open -> HalfOpen (probing)");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state() != CircuitState::Closed {
            self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
            info!("circuit breaker: -> Closed");
        }
    }

    pub async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        match self.state() {
            CircuitState::HalfOpen => {
                *self.opened_at.lock().await = Instant::now();
                self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
                warn!("circuit breaker: HalfOpen -> Open (probe failed)");
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                *self.opened_at.lock().await = Instant::now();
                self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
                warn!("circuit breaker: Closed -> Open (after {failures} failures)");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_millis(20),
        })
    }

    #[tokio::test]
    async fn stays_closed_below_threshold() {
        let cb = breaker();
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_attempt().await);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_denies_attempts() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_attempt().await);
    }

    #[tokio::test]
    async fn half_opens_after_cooldown_and_closes_on_success() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.allow_attempt().await);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.allow_attempt().await);
        cb.record_failure().await;
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
