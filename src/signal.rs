//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM trip a [`ShutdownToken`], which the reconciliation
//! loop both polls between passes and awaits while idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A token that can be shared across tasks to request and observe shutdown.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake every task waiting in [`Self::cancelled`].
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a cancel() in between
            // still wakes us.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that cancels `token` on the first SIGINT or SIGTERM.
///
/// The handlers are installed before this returns, so a signal delivered
/// right after the call is never left to the default (terminating) action.
/// Must be called from within a tokio runtime.
///
/// If signal handlers cannot be registered (e.g., in restricted environments)
/// the task logs a warning and the token can only be cancelled manually.
pub fn spawn_signal_listener(token: ShutdownToken) -> JoinHandle<()> {
    let sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGINT handler: {}", e);
            None
        }
    };

    let sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            None
        }
    };

    tokio::spawn(async move {
        match (sigint, sigterm) {
            (Some(mut int), Some(mut term)) => {
                tokio::select! {
                    _ = int.recv() => info!("Received SIGINT, shutting down"),
                    _ = term.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            (Some(mut int), None) => {
                int.recv().await;
                info!("Received SIGINT, shutting down");
            }
            (None, Some(mut term)) => {
                term.recv().await;
                info!("Received SIGTERM, shutting down");
            }
            (None, None) => {
                warn!("No signal handlers registered - graceful shutdown disabled");
                return;
            }
        }
        token.cancel();
    })
}
