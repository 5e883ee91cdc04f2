//! Graceful shutdown coordination.
//!
//! Waits for Ctrl+C or SIGTERM, then runs a list of registered async
//! handlers in registration order, each bounded by a timeout so one
//! stuck handler can't hang the whole process.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};

type Handler = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Default time budget for a single shutdown handler.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Collects ordered shutdown handlers and fires them once, on signal.
pub struct ShutdownCoordinator {
    handlers: std::sync::Mutex<Vec<(&'static str, Handler)>>,
    handler_timeout: Duration,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            handlers: std::sync::Mutex::new(Vec::new()),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Register a handler to run, in order, when shutdown is triggered.
    pub fn register<F, Fut>(&self, name: &'static str, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Handler = Box::new(move || Box::pin(handler()));
        self.handlers
            .lock()
            .expect("shutdown handler list poisoned")
            .push((name, boxed));
    }

    /// Wait for Ctrl+C or SIGTERM, then run all handlers in order.
    pub async fn wait_and_run(&self) {
        wait_for_signal().await;
        self.run().await;
    }

    /// Run all registered handlers now, in registration order. Safe to
    /// call more than once; only the first call does anything.
    pub async fn run(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("graceful shutdown starting");
        let handlers = std::mem::take(&mut *self.handlers.lock().expect("shutdown handler list poisoned"));
        for (name, handler) in handlers {
            info!(handler = name, "running shutdown handler");
            match tokio::time::timeout(self.handler_timeout, handler()).await {
                Ok(()) => info!(handler = name, "shutdown handler completed"),
                Err(_) => warn!(handler = name, "shutdown handler timed out"),
            }
        }
        info!("graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler, falling back to Ctrl+C only");
                ctrl_c.await.ok();
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_handlers_in_registration_order() {
        let coordinator = ShutdownCoordinator::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order_a = order.clone();
        coordinator.register("a", move || {
            let order_a = order_a.clone();
            async move {
                order_a.lock().unwrap().push("a");
            }
        });
        let order_b = order.clone();
        coordinator.register("b", move || {
            let order_b = order_b.clone();
            async move {
                order_b.lock().unwrap().push("b");
            }
        });

        coordinator.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn only_runs_once() {
        let coordinator = ShutdownCoordinator::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        coordinator.register("once", move || {
            let calls_clone = calls_clone.clone();
            async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        coordinator.run().await;
        coordinator.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_handler_times_out_without_blocking_others() {
        let coordinator = ShutdownCoordinator::new().with_handler_timeout(Duration::from_millis(10));
        let ran_after = Arc::new(AtomicBool::new(false));

        coordinator.register("slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let ran_after_clone = ran_after.clone();
        coordinator.register("after", move || {
            let ran_after_clone = ran_after_clone.clone();
            async move {
                ran_after_clone.store(true, Ordering::SeqCst);
            }
        });

        coordinator.run().await;
        assert!(ran_after.load(Ordering::SeqCst));
    }
}
