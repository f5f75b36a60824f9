//! Run cancellation and signal handling

use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation token shared between a run and the activities it spawns.
///
/// Cloning yields a handle to the same token; cancelling any handle is
/// observed by all of them.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Cancel the token
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                // Sender is kept alive by every clone, so this only happens
                // while the whole token is being dropped.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM
pub async fn setup_signal_handlers(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                tracing::warn!("received SIGINT, aborting run");
            }
            _ = sigterm.recv() => {
                tracing::warn!("received SIGTERM, aborting run");
            }
        }

        token.cancel();
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            return;
        }
        tracing::warn!("received Ctrl+C, aborting run");
        token.cancel();
    }
}

/// Run `future` unless the token is cancelled first
pub async fn with_cancellation<F, T>(token: &CancellationToken, future: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = future => Some(result),
    }
}
