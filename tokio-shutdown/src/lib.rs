//! Signal-driven graceful shutdown for tokio servers.
//!
//! A single [`Shutdown`] is created at startup and shared by `Arc`. Signal
//! handlers, failing background tasks or tests trigger it; everything that must
//! stop derives a child [`CancellationToken`] from it. Cleanup that runs after
//! the trigger is bounded with [`with_grace`] so the process never hangs on the
//! way out.

use nix::sys::signal::{
    self as nix_signal, SaFlags, SigAction, SigHandler as NixSigHandler, SigSet,
};
use nix::unistd;

// Re-export Signal for consumers that want to inspect the trigger
pub use nix::sys::signal::Signal;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cleanup did not finish within its grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("shutdown cleanup did not finish within {grace:?}")]
pub struct ShutdownTimeout {
    pub grace: Duration,
}

/// Run `fut` to completion unless `grace` elapses first.
pub async fn with_grace<F>(grace: Duration, fut: F) -> Result<F::Output, ShutdownTimeout>
where
    F: Future,
{
    tokio::time::timeout(grace, fut)
        .await
        .map_err(|_| ShutdownTimeout { grace })
}

/// A graceful shutdown manager for tokio applications
pub struct Shutdown {
    token: CancellationToken,
    last_signal: AtomicI32,
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("token", &self.token)
            .field("last_signal", &self.last_signal)
            .finish()
    }
}

impl Shutdown {
    /// Create a new Shutdown instance wrapped in Arc
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            last_signal: AtomicI32::new(0),
        })
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Install SIGINT, SIGTERM and SIGHUP handlers.
    ///
    /// The first signal triggers a graceful shutdown; a second one exits
    /// immediately.
    pub fn install_signals(self: &Arc<Self>) -> std::io::Result<()> {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => Signal::SIGINT,
                    _ = sigterm.recv() => Signal::SIGTERM,
                    _ = sighup.recv() => Signal::SIGHUP,
                };

                if shutdown.last_signal().is_some() {
                    warn!("Received second signal, forcing exit...");
                    shutdown.exit_process();
                }

                info!(signal = ?received, "Received signal, shutting down gracefully...");
                shutdown.set_last_signal(received);
                shutdown.shutdown();
            }
        });

        Ok(())
    }

    /// Wait for shutdown to be requested
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Check if shutdown has been triggered
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Get a clone of the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Get the last signal that was received, if any.
    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            i => Signal::try_from(i).ok(),
        }
    }

    pub fn set_last_signal(&self, signal: Signal) {
        self.last_signal.store(signal as i32, Ordering::Relaxed);
    }

    /// Restore the default handler for the last received signal and re-raise it
    /// so the process terminates with the matching status.
    pub fn exit_process(&self) -> ! {
        let signal = self.last_signal().unwrap_or(Signal::SIGTERM);
        let action = SigAction::new(NixSigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: installing SIG_DFL has no handler that could observe
        // inconsistent state.
        let restored = unsafe { nix_signal::sigaction(signal, &action) };
        if restored.is_ok() {
            let _ = nix_signal::kill(unistd::getpid(), signal);
        }

        // Only reached if re-raising failed
        std::process::exit(128 + signal as i32);
    }
}
