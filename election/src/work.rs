// Protected work - runs caller-supplied work for one leadership interval

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Work that may only run while this process holds the lease.
///
/// `execute` is called once per leadership interval. The token is cancelled
/// when leadership ends or the process shuts down, and the lease is not
/// released until `execute` returns. Nothing preempts the work: it must watch
/// the token and return promptly.
#[async_trait]
pub trait ProtectedWork: Send + Sync {
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Default work: holds leadership and does nothing until cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

#[async_trait]
impl ProtectedWork for Idle {
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

/// Logs a line on every tick while leading.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub interval: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl ProtectedWork for Heartbeat {
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => info!("leader loop running"),
            }
        }
    }
}

/// Adapts an async closure into [`ProtectedWork`].
pub struct FnWork<F>(F);

/// Wraps `f` so it can be registered as protected work.
pub fn work_fn<F, Fut>(f: F) -> FnWork<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnWork(f)
}

#[async_trait]
impl<F, Fut> ProtectedWork for FnWork<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        (self.0)(cancel).await
    }
}

/// Starts the registered work at the beginning of each leadership interval.
#[derive(Clone)]
pub struct WorkRunner {
    identity: String,
    work: Arc<dyn ProtectedWork>,
}

impl WorkRunner {
    pub fn new(identity: impl Into<String>, work: Arc<dyn ProtectedWork>) -> Self {
        Self {
            identity: identity.into(),
            work,
        }
    }

    /// Spawns the work for leadership term `term`, scoped to `cancel`.
    pub fn start(&self, term: u64, cancel: CancellationToken) -> WorkHandle {
        let work = Arc::clone(&self.work);
        let token = cancel.clone();
        let span = info_span!("protected_work", identity = %self.identity, term);
        let join = tokio::spawn(async move { work.execute(token).await }.instrument(span));
        debug!(term, "protected work started");
        WorkHandle { term, cancel, join }
    }
}

/// A running leadership interval's work.
#[derive(Debug)]
pub struct WorkHandle {
    term: u64,
    cancel: CancellationToken,
    join: JoinHandle<anyhow::Result<()>>,
}

impl WorkHandle {
    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the interval and waits until the work has returned.
    ///
    /// Errors and panics inside the work are logged; they never skip the wait.
    pub async fn stop(self) {
        let term = self.term;
        self.cancel.cancel();
        match self.join.await {
            Ok(Ok(())) => debug!(term, "protected work finished"),
            Ok(Err(e)) => error!(term, error = ?e, "protected work failed"),
            Err(e) if e.is_panic() => error!(term, "protected work panicked"),
            Err(e) => warn!(term, error = %e, "protected work aborted"),
        }
    }
}
