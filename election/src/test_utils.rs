use crate::{
    config::ElectionConfig,
    elector::LeaderElector,
    error::StoreError,
    lease::{LeaseKey, LeaseRecord, LeaseSpec},
    machine::LeaderCallbacks,
    store::{InMemoryLeaseStore, LeaseStore, WriteOutcome},
    time::Clock,
    work::ProtectedWork,
    CandidateId, Role,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Something a candidate did, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    NewLeader(String),
    StartedLeading,
    WorkFinished,
    StoppedLeading,
    LeaseWritten { holder: Option<String> },
}

#[derive(Debug, Clone)]
pub struct Trace {
    /// Time since the log was created
    pub at: Duration,
    pub candidate: String,
    pub event: TraceEvent,
}

/// Shared, ordered record of what every candidate did.
#[derive(Debug, Clone)]
pub struct TraceLog {
    origin: Instant,
    entries: Arc<Mutex<Vec<Trace>>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, candidate: &str, event: TraceEvent) {
        self.entries.lock().push(Trace {
            at: self.origin.elapsed(),
            candidate: candidate.to_string(),
            event,
        });
    }

    pub fn entries(&self) -> Vec<Trace> {
        self.entries.lock().clone()
    }

    /// Events of one candidate, dropping lease writes.
    pub fn callbacks_of(&self, candidate: &str) -> Vec<TraceEvent> {
        self.entries
            .lock()
            .iter()
            .filter(|trace| trace.candidate == candidate)
            .filter(|trace| !matches!(trace.event, TraceEvent::LeaseWritten { .. }))
            .map(|trace| trace.event.clone())
            .collect()
    }

    /// When `candidate` first recorded `event`.
    pub fn first(&self, candidate: &str, event: &TraceEvent) -> Option<Duration> {
        self.entries
            .lock()
            .iter()
            .find(|trace| trace.candidate == candidate && &trace.event == event)
            .map(|trace| trace.at)
    }

    /// Position of the first matching entry in the whole log.
    pub fn position(&self, candidate: &str, event: &TraceEvent) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|trace| trace.candidate == candidate && &trace.event == event)
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts protected work running at the same time across all candidates.
#[derive(Debug, Clone, Default)]
pub struct LeadershipLedger {
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    intervals: Arc<AtomicUsize>,
}

impl LeadershipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.intervals.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous leaders ever observed.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Total leadership intervals started.
    pub fn intervals(&self) -> usize {
        self.intervals.load(Ordering::SeqCst)
    }
}

/// Stand-in for protected work.
///
/// Records start and finish, counts itself in a ledger, and after
/// cancellation keeps "running" for `drain` before returning.
#[derive(Debug, Clone)]
pub struct ObservedWork {
    pub candidate: String,
    pub log: TraceLog,
    pub ledger: LeadershipLedger,
    pub drain: Duration,
    pub running: Arc<AtomicBool>,
}

#[async_trait]
impl ProtectedWork for ObservedWork {
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.ledger.enter();
        self.log.record(&self.candidate, TraceEvent::StartedLeading);

        cancel.cancelled().await;
        if !self.drain.is_zero() {
            sleep(self.drain).await;
        }

        self.ledger.exit();
        self.running.store(false, Ordering::SeqCst);
        self.log.record(&self.candidate, TraceEvent::WorkFinished);
        Ok(())
    }
}

/// Store wrapper that can be cut off from the backend.
///
/// While partitioned every call fails with [`StoreError::Unavailable`].
/// Writes can be slowed down, and reads can yield before returning so that
/// concurrent candidates interleave between read and write.
/// Successful writes are recorded in the trace log if one is attached.
#[derive(Debug, Clone)]
pub struct PartitionableStore<S> {
    inner: S,
    partitioned: Arc<AtomicBool>,
    write_delay: Arc<Mutex<Duration>>,
    yield_after_get: Arc<AtomicBool>,
    trace: Option<(String, TraceLog)>,
}

impl<S: LeaseStore> PartitionableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            partitioned: Arc::new(AtomicBool::new(false)),
            write_delay: Arc::new(Mutex::new(Duration::ZERO)),
            yield_after_get: Arc::new(AtomicBool::new(false)),
            trace: None,
        }
    }

    pub fn traced(mut self, candidate: &str, log: &TraceLog) -> Self {
        self.trace = Some((candidate.to_string(), log.clone()));
        self
    }

    pub fn partition(&self) {
        self.partitioned.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.partitioned.store(false, Ordering::SeqCst);
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    /// Every write waits `delay` before reaching the backend.
    pub fn slow_writes(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Reads hand control back to the runtime before returning.
    pub fn yield_after_get(&self) {
        self.yield_after_get.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: LeaseStore> LeaseStore for PartitionableStore<S> {
    async fn get(&self, key: &LeaseKey) -> Result<Option<LeaseRecord>, StoreError> {
        if self.is_partitioned() {
            return Err(StoreError::Unavailable("partitioned".into()));
        }
        let record = self.inner.get(key).await?;
        if self.yield_after_get.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(record)
    }

    async fn create_or_update(
        &self,
        key: &LeaseKey,
        spec: LeaseSpec,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError> {
        if self.is_partitioned() {
            return Err(StoreError::Unavailable("partitioned".into()));
        }
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let outcome = self.inner.create_or_update(key, spec, expected_version).await?;
        if let (WriteOutcome::Written(record), Some((candidate, log))) = (&outcome, &self.trace) {
            log.record(
                candidate,
                TraceEvent::LeaseWritten {
                    holder: record.holder().map(str::to_string),
                },
            );
        }
        Ok(outcome)
    }
}

/// Timing and shutdown knobs for a test candidate.
#[derive(Debug, Clone, Copy)]
pub struct CandidateOptions {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub release_on_cancel: bool,
    pub drain: Duration,
}

impl Default for CandidateOptions {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
            release_on_cancel: true,
            drain: Duration::ZERO,
        }
    }
}

/// A running candidate with handles to poke at it.
#[derive(Debug)]
pub struct TestCandidate {
    pub id: String,
    pub store: PartitionableStore<InMemoryLeaseStore>,
    pub role: watch::Receiver<Role>,
    pub cancel: CancellationToken,
    pub work_running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TestCandidate {
    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Cancels the candidate and waits for its election loop to return.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.handle.await.expect("election task panicked");
    }

    pub async fn join(self) {
        self.handle.await.expect("election task panicked");
    }
}

pub fn test_lease() -> LeaseKey {
    LeaseKey::new("agent-lock", "proxysql")
}

/// Starts a candidate contending for [`test_lease`] through `backend`.
pub fn spawn_candidate(
    id: &str,
    backend: &InMemoryLeaseStore,
    clock: Arc<dyn Clock>,
    log: &TraceLog,
    ledger: &LeadershipLedger,
    options: CandidateOptions,
) -> TestCandidate {
    spawn_candidate_with(id, backend, clock, log, ledger, options, CancellationToken::new())
}

/// Like [`spawn_candidate`], stopping when `cancel` fires.
pub fn spawn_candidate_with(
    id: &str,
    backend: &InMemoryLeaseStore,
    clock: Arc<dyn Clock>,
    log: &TraceLog,
    ledger: &LeadershipLedger,
    options: CandidateOptions,
    cancel: CancellationToken,
) -> TestCandidate {
    let config = ElectionConfig::new(test_lease(), CandidateId::new(id).expect("test identity"))
        .with_lease_duration(options.lease_duration)
        .with_renew_deadline(options.renew_deadline)
        .with_retry_period(options.retry_period)
        .with_release_on_cancel(options.release_on_cancel);

    let store = PartitionableStore::new(backend.clone()).traced(id, log);
    let running = Arc::new(AtomicBool::new(false));
    let work = ObservedWork {
        candidate: id.to_string(),
        log: log.clone(),
        ledger: ledger.clone(),
        drain: options.drain,
        running: running.clone(),
    };

    let stopped_log = log.clone();
    let stopped_id = id.to_string();
    let leader_log = log.clone();
    let leader_id = id.to_string();
    let callbacks = LeaderCallbacks::on_started_leading(work)
        .on_stopped_leading(move || stopped_log.record(&stopped_id, TraceEvent::StoppedLeading))
        .on_new_leader(move |holder| {
            leader_log.record(&leader_id, TraceEvent::NewLeader(holder.to_string()));
        });

    let elector = LeaderElector::new(config, Arc::new(store.clone()), callbacks)
        .expect("test config is valid")
        .with_clock(clock);
    let role = elector.subscribe();
    let handle = tokio::spawn(elector.run(cancel.clone()));

    TestCandidate {
        id: id.to_string(),
        store,
        role,
        cancel,
        work_running: running,
        handle,
    }
}
