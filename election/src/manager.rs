// Lease manager - acquire, renew and release timing loop

use crate::{
    config::ElectionConfig,
    error::StoreError,
    lease::{LeaseKey, LeaseRecord, LeaseSpec},
    store::{LeaseStore, WriteOutcome},
    time::{Clock, Timestamp},
    CandidateId,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the lease manager reports to the election state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    /// The record names this holder (may be self)
    HolderObserved(String),
    /// This candidate won the lease
    Acquired,
    /// Renewal failed or another holder took over; no longer leading
    Lost,
    /// Cancelled while leading; the lease is released once this returns
    Relinquishing,
    /// The loop has exited for good
    Stopped,
}

/// Receives lease events. Each call completes before the manager moves on.
#[async_trait]
pub trait LeaseObserver: Send {
    async fn lease_event(&mut self, event: LeaseEvent);
}

/// Outcome of a single read-then-conditional-write round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// This candidate holds the lease; carries the record it wrote
    Held(LeaseRecord),
    /// Another candidate holds an unexpired lease
    HeldByOther(String),
    /// The conditional write lost a race
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Renewal {
    Lost,
    Cancelled,
}

/// Contends for one lease on behalf of this process.
#[derive(Debug)]
pub struct LeaseManager {
    key: LeaseKey,
    identity: CandidateId,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    release_on_cancel: bool,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    /// Last record read or written by this candidate
    observed: Option<LeaseRecord>,
    /// Monotonic instant matching the `renew_time` of our last successful write
    renewed_at: Option<Instant>,
}

impl LeaseManager {
    pub fn new(config: &ElectionConfig, store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: config.lease.clone(),
            identity: config.identity.clone(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
            release_on_cancel: config.release_on_cancel,
            store,
            clock,
            observed: None,
            renewed_at: None,
        }
    }

    /// Runs acquire/renew cycles until `cancel` fires, then reports `Stopped`.
    ///
    /// When cancelled while leading, the observer handles `Relinquishing`
    /// (stopping protected work) before the lease is released.
    pub async fn run<O: LeaseObserver>(&mut self, cancel: &CancellationToken, observer: &mut O) {
        info!(lease = %self.key, identity = %self.identity, "attempting to acquire leader lease");
        loop {
            if !self.acquire(cancel, observer).await {
                break;
            }
            observer.lease_event(LeaseEvent::Acquired).await;

            match self.renew(cancel, observer).await {
                Renewal::Lost => {
                    observer.lease_event(LeaseEvent::Lost).await;
                }
                Renewal::Cancelled => {
                    observer.lease_event(LeaseEvent::Relinquishing).await;
                    if self.release_on_cancel {
                        self.release().await;
                    }
                    break;
                }
            }
        }
        observer.lease_event(LeaseEvent::Stopped).await;
        info!(lease = %self.key, identity = %self.identity, "leader election stopped");
    }

    /// Polls every retry period until the lease is won. `false` on cancellation.
    async fn acquire<O: LeaseObserver>(&mut self, cancel: &CancellationToken, observer: &mut O) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return false,
                attempt = self.attempt(self.renew_deadline) => attempt,
            };
            match attempt {
                Ok(Attempt::Held(record)) => {
                    info!(
                        lease = %self.key,
                        identity = %self.identity,
                        transitions = record.spec.leader_transitions,
                        "successfully acquired lease"
                    );
                    observer.lease_event(LeaseEvent::HolderObserved(self.identity.to_string())).await;
                    return true;
                }
                Ok(Attempt::HeldByOther(holder)) => {
                    debug!(lease = %self.key, %holder, "lease is held by another candidate");
                    observer.lease_event(LeaseEvent::HolderObserved(holder)).await;
                }
                Ok(Attempt::Conflict) => {
                    debug!(lease = %self.key, "lost race to acquire lease");
                    if let Some(holder) = self.reread_holder().await {
                        observer.lease_event(LeaseEvent::HolderObserved(holder)).await;
                    }
                }
                Err(e) => {
                    warn!(lease = %self.key, error = %e, "error acquiring lease; retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(self.retry_period) => {}
            }
        }
    }

    /// Renews every retry period while leading.
    ///
    /// The renew deadline runs from the instant the last successful write was
    /// stamped, not from when the store answered. Transient errors are retried
    /// until that deadline; a conflict or a foreign holder demotes at once.
    async fn renew<O: LeaseObserver>(&mut self, cancel: &CancellationToken, observer: &mut O) -> Renewal {
        loop {
            let deadline = self.renewed_at.unwrap_or_else(Instant::now) + self.renew_deadline;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Renewal::Cancelled,
                _ = sleep_until(deadline) => {
                    warn!(
                        lease = %self.key,
                        deadline = ?self.renew_deadline,
                        "failed to renew lease within renew deadline; stepping down"
                    );
                    return Renewal::Lost;
                }
                _ = sleep(self.retry_period) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Renewal::Cancelled,
                attempt = self.attempt(remaining) => attempt,
            };
            match attempt {
                Ok(Attempt::Held(_)) => {
                    debug!(lease = %self.key, "renewed lease");
                }
                Ok(Attempt::HeldByOther(holder)) => {
                    warn!(lease = %self.key, %holder, "lease taken over by another candidate");
                    observer.lease_event(LeaseEvent::HolderObserved(holder)).await;
                    return Renewal::Lost;
                }
                Ok(Attempt::Conflict) => {
                    warn!(lease = %self.key, "lease modified during renewal; stepping down");
                    if let Some(holder) = self.reread_holder().await {
                        observer.lease_event(LeaseEvent::HolderObserved(holder)).await;
                    }
                    return Renewal::Lost;
                }
                Err(e) => {
                    warn!(lease = %self.key, error = %e, "failed to renew lease; retrying");
                }
            }
        }
    }

    async fn attempt(&mut self, bound: Duration) -> Result<Attempt, StoreError> {
        timeout(bound, self.try_acquire_or_renew())
            .await
            .map_err(|_| StoreError::Timeout(bound))?
    }

    /// After losing a conditional write, reads who won. `None` if the
    /// record cannot be read or names no other holder.
    async fn reread_holder(&mut self) -> Option<String> {
        match timeout(self.renew_deadline, self.store.get(&self.key)).await {
            Ok(Ok(Some(record))) => {
                let holder = record.holder().filter(|h| *h != self.identity.as_str()).map(str::to_string);
                self.observed = Some(record);
                holder
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!(lease = %self.key, error = %e, "could not read lease after conflict");
                None
            }
            Err(_) => {
                debug!(lease = %self.key, "timed out reading lease after conflict");
                None
            }
        }
    }

    /// Reads the lease and, if it is ours or available, writes self as holder.
    ///
    /// The renew time written is taken before the read, together with the
    /// monotonic instant the renew deadline is measured from.
    pub async fn try_acquire_or_renew(&mut self) -> Result<Attempt, StoreError> {
        let stamped = Instant::now();
        let now = self.clock.now();

        let Some(current) = self.store.get(&self.key).await? else {
            let spec = self.desired_spec(now, None);
            return self.write(spec, None, stamped).await;
        };

        if !current.is_held_by(self.identity.as_str()) && !current.is_available(now) {
            let holder = current.holder().unwrap_or_default().to_string();
            self.observed = Some(current);
            return Ok(Attempt::HeldByOther(holder));
        }

        let spec = self.desired_spec(now, Some(&current));
        let expected = current.version;
        self.observed = Some(current);
        self.write(spec, Some(expected), stamped).await
    }

    async fn write(&mut self, spec: LeaseSpec, expected: Option<u64>, stamped: Instant) -> Result<Attempt, StoreError> {
        match self.store.create_or_update(&self.key, spec, expected).await? {
            WriteOutcome::Written(record) => {
                self.renewed_at = Some(stamped);
                self.observed = Some(record.clone());
                Ok(Attempt::Held(record))
            }
            WriteOutcome::Conflict => Ok(Attempt::Conflict),
        }
    }

    fn desired_spec(&self, now: Timestamp, current: Option<&LeaseRecord>) -> LeaseSpec {
        let mut spec = LeaseSpec {
            holder: Some(self.identity.to_string()),
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            acquire_time: Some(now),
            renew_time: Some(now),
            leader_transitions: 0,
        };
        if let Some(current) = current {
            if current.is_held_by(self.identity.as_str()) {
                spec.acquire_time = current.spec.acquire_time;
                spec.leader_transitions = current.spec.leader_transitions;
            } else {
                spec.leader_transitions = current.spec.leader_transitions.saturating_add(1);
            }
        }
        spec
    }

    /// Clears the holder with a compare-and-swap on the last version we wrote.
    ///
    /// Returns `true` if the release was written. If the record changed since,
    /// it is left alone to expire.
    pub async fn release(&mut self) -> bool {
        let Some(current) = self
            .observed
            .as_ref()
            .filter(|record| record.is_held_by(self.identity.as_str()))
        else {
            debug!(lease = %self.key, "not holding the lease; nothing to release");
            return false;
        };

        let spec = LeaseSpec {
            holder: None,
            renew_time: Some(self.clock.now()),
            ..current.spec.clone()
        };
        let expected = current.version;

        match timeout(self.renew_deadline, self.store.create_or_update(&self.key, spec, Some(expected))).await {
            Ok(Ok(WriteOutcome::Written(record))) => {
                info!(lease = %self.key, identity = %self.identity, "released lease");
                self.observed = Some(record);
                true
            }
            Ok(Ok(WriteOutcome::Conflict)) => {
                warn!(lease = %self.key, "lease changed before release; leaving it to expire");
                false
            }
            Ok(Err(e)) => {
                warn!(lease = %self.key, error = %e, "failed to release lease; leaving it to expire");
                false
            }
            Err(_) => {
                warn!(lease = %self.key, "timed out releasing lease; leaving it to expire");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::InMemoryLeaseStore, time::AnchoredClock};

    #[derive(Default)]
    struct Events(Vec<LeaseEvent>);

    #[async_trait]
    impl LeaseObserver for Events {
        async fn lease_event(&mut self, event: LeaseEvent) {
            self.0.push(event);
        }
    }

    fn manager(identity: &str, store: &InMemoryLeaseStore, clock: &Arc<AnchoredClock>) -> LeaseManager {
        let config = ElectionConfig::new(
            LeaseKey::new("agent-lock", "proxysql"),
            CandidateId::new(identity).unwrap(),
        );
        LeaseManager::new(&config, Arc::new(store.clone()), clock.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_candidate_creates_the_lease() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let mut a = manager("pod-a", &store, &clock);

        let attempt = a.try_acquire_or_renew().await.unwrap();
        let Attempt::Held(record) = attempt else {
            panic!("expected pod-a to acquire, got {attempt:?}");
        };
        assert_eq!(record.holder(), Some("pod-a"));
        assert_eq!(record.spec.leader_transitions, 0);
        assert_eq!(record.spec.lease_duration, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_sees_holder_until_expiry() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let mut a = manager("pod-a", &store, &clock);
        let mut b = manager("pod-b", &store, &clock);

        a.try_acquire_or_renew().await.unwrap();
        assert_eq!(
            b.try_acquire_or_renew().await.unwrap(),
            Attempt::HeldByOther("pod-a".to_string())
        );

        // still valid at exactly renew + duration
        sleep(Duration::from_secs(60)).await;
        assert_eq!(
            b.try_acquire_or_renew().await.unwrap(),
            Attempt::HeldByOther("pod-a".to_string())
        );

        sleep(Duration::from_secs(1)).await;
        let Attempt::Held(record) = b.try_acquire_or_renew().await.unwrap() else {
            panic!("expected pod-b to take over an expired lease");
        };
        assert_eq!(record.holder(), Some("pod-b"));
        assert_eq!(record.spec.leader_transitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_acquire_time() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let mut a = manager("pod-a", &store, &clock);

        let Attempt::Held(first) = a.try_acquire_or_renew().await.unwrap() else {
            panic!("expected acquire");
        };
        sleep(Duration::from_secs(5)).await;
        let Attempt::Held(renewed) = a.try_acquire_or_renew().await.unwrap() else {
            panic!("expected renew");
        };

        assert_eq!(renewed.spec.acquire_time, first.spec.acquire_time);
        assert!(renewed.spec.renew_time > first.spec.renew_time);
        assert!(renewed.version > first.version);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_clears_holder_only_when_ours() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let mut a = manager("pod-a", &store, &clock);
        let mut b = manager("pod-b", &store, &clock);

        a.try_acquire_or_renew().await.unwrap();
        b.try_acquire_or_renew().await.unwrap();

        assert!(!b.release().await);
        assert!(a.release().await);

        let record = store.snapshot(&LeaseKey::new("agent-lock", "proxysql")).unwrap();
        assert_eq!(record.holder(), None);

        // released lease is free for the next candidate right away
        let Attempt::Held(taken) = b.try_acquire_or_renew().await.unwrap() else {
            panic!("expected pod-b to take the released lease");
        };
        assert_eq!(taken.spec.leader_transitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_is_skipped() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let mut a = manager("pod-a", &store, &clock);
        let mut b = manager("pod-b", &store, &clock);

        a.try_acquire_or_renew().await.unwrap();
        sleep(Duration::from_secs(61)).await;
        b.try_acquire_or_renew().await.unwrap();

        // pod-a's view is stale; its CAS must not clear pod-b's lease
        assert!(!a.release().await);
        let record = store.snapshot(&LeaseKey::new("agent-lock", "proxysql")).unwrap();
        assert_eq!(record.holder(), Some("pod-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_acquire_and_release_on_cancel() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let mut a = manager("pod-a", &store, &clock);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(12)).await;
            canceller.cancel();
        });

        let mut events = Events::default();
        a.run(&cancel, &mut events).await;

        assert_eq!(
            events.0,
            vec![
                LeaseEvent::HolderObserved("pod-a".to_string()),
                LeaseEvent::Acquired,
                LeaseEvent::Relinquishing,
                LeaseEvent::Stopped,
            ]
        );
        let record = store.snapshot(&LeaseKey::new("agent-lock", "proxysql")).unwrap();
        assert_eq!(record.holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_without_release_leaves_lease_to_expire() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let config = ElectionConfig::new(
            LeaseKey::new("agent-lock", "proxysql"),
            CandidateId::new("pod-a").unwrap(),
        )
        .with_release_on_cancel(false);
        let mut a = LeaseManager::new(&config, Arc::new(store.clone()), clock.clone());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(7)).await;
            canceller.cancel();
        });
        a.run(&cancel, &mut Events::default()).await;

        let record = store.snapshot(&LeaseKey::new("agent-lock", "proxysql")).unwrap();
        assert_eq!(record.holder(), Some("pod-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_never_touches_store() {
        let store = InMemoryLeaseStore::new();
        let clock = Arc::new(AnchoredClock::new());
        let mut a = manager("pod-a", &store, &clock);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut events = Events::default();
        a.run(&cancel, &mut events).await;

        assert_eq!(events.0, vec![LeaseEvent::Stopped]);
        assert!(store.snapshot(&LeaseKey::new("agent-lock", "proxysql")).is_none());
    }
}
