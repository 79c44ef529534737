//! Shutdown handling
//!
//! The first signal cancels the root token so every race winds down through
//! its normal cancellation path. A second signal, or SIGQUIT, asks for an
//! immediate exit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Stop waiting for monitors and exit
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Monitors are cancelled and finishing their current step
    Draining,
    /// Exit without waiting any longer
    Forced,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::Draining => write!(f, "draining"),
            ShutdownPhase::Forced => write!(f, "forced"),
        }
    }
}

/// Owns the root cancellation token of a run
pub struct GracefulShutdown {
    root: CancellationToken,
    requests: AtomicU32,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            root: CancellationToken::new(),
            requests: AtomicU32::new(0),
            phase_tx,
        }
    }

    /// Token every race derives its child token from
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let previous = self.requests.fetch_add(1, Ordering::SeqCst);

        if signal == ShutdownSignal::Urgent || previous > 0 {
            warn!("Shutdown forced ({})", signal);
            self.root.cancel();
            self.phase_tx.send_replace(ShutdownPhase::Forced);
            return;
        }

        info!("Shutdown requested: {}, cancelling monitors", signal);
        self.root.cancel();
        self.phase_tx.send_replace(ShutdownPhase::Draining);
    }

    /// Resolves once a forced exit has been requested
    pub async fn forced(&self) {
        let mut rx = self.phase_receiver();
        let _ = rx.wait_for(|phase| *phase == ShutdownPhase::Forced).await;
    }
}

/// Install OS signal handlers
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, level) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                        return;
                    }
                };
                while stream.recv().await.is_some() {
                    info!("Received {}", name);
                    shutdown.request_shutdown(level);
                }
            });
        }
    }

    #[cfg(windows)]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
        });
    }
}
