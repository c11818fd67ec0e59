// Shutdown coordinator - maps termination signals onto one cancellation

use crate::Result;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// OS signals that request shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Owns the process-wide cancellation token.
///
/// The first termination signal cancels the token; every later one is a
/// no-op. Work completion is not timed out here: the elector waits for
/// protected work before releasing the lease, however long that takes.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The token to hand to the elector and anything else that must stop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Cancels the token. Returns `false` if shutdown was already triggered.
    pub fn trigger(&self, signal: TerminationSignal) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!(%signal, "already shutting down; ignoring signal");
            return false;
        }
        info!(%signal, "received termination, signaling shutdown");
        self.token.cancel();
        true
    }

    /// Triggers on each received signal until the channel closes.
    ///
    /// Returns how many signals activated the cancellation (0 or 1).
    pub async fn drive(&self, mut signals: mpsc::Receiver<TerminationSignal>) -> usize {
        let mut activations = 0;
        while let Some(signal) = signals.recv().await {
            if self.trigger(signal) {
                activations += 1;
            }
        }
        activations
    }

    /// Installs SIGINT/SIGTERM handlers and drives them into this coordinator.
    #[cfg(unix)]
    pub fn listen(&self) -> Result<JoinHandle<usize>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => TerminationSignal::Interrupt,
                    Some(()) = terminate.recv() => TerminationSignal::Terminate,
                    else => break,
                };
                if tx.send(received).await.is_err() {
                    break;
                }
            }
        });

        let coordinator = self.clone();
        Ok(tokio::spawn(async move { coordinator.drive(rx).await }))
    }

    /// Ctrl-C only on platforms without Unix signals.
    #[cfg(not(unix))]
    pub fn listen(&self) -> Result<JoinHandle<usize>> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(TerminationSignal::Interrupt).await.is_err() {
                    break;
                }
            }
        });

        let coordinator = self.clone();
        Ok(tokio::spawn(async move { coordinator.drive(rx).await }))
    }
}
