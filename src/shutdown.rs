//! Shutdown coordination.
//!
//! A `Shutdown` handle is shared by the signal task, the accept loop and
//! every connection handler. The running flag is only ever written by
//! `stop()`; everyone else reads it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug)]
struct Inner {
    running: AtomicBool,
    notify: Notify,
}

/// Cloneable shutdown token.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a token in the running state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Request shutdown. Returns `true` only for the call that flipped the
    /// flag; repeated calls do nothing.
    pub fn stop(&self) -> bool {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!("Stopping server...");
            self.inner.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Resolve once `stop()` has been called.
    pub async fn stopped(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent stop() can't slip
        // between the check and the await.
        notified.as_mut().enable();
        if !self.is_running() {
            return;
        }
        notified.await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT or, on unix, SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(shutdown.is_running());

        assert!(shutdown.stop());
        assert!(!shutdown.is_running());

        assert!(!shutdown.stop());
        assert!(!shutdown.clone().stop());
        assert!(!shutdown.is_running());
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiters() {
        let shutdown = Shutdown::new();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.stopped().await })
            })
            .collect();

        tokio::task::yield_now().await;
        shutdown.stop();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not woken")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_stopped_after_stop_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.stop();
        tokio::time::timeout(Duration::from_millis(100), shutdown.stopped())
            .await
            .expect("already stopped");
    }
}
