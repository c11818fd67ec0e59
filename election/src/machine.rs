// Election state machine - turns lease events into role transitions and callbacks

use crate::{
    manager::{LeaseEvent, LeaseObserver},
    work::{Idle, ProtectedWork, WorkHandle, WorkRunner},
    CandidateId, Role,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type StoppedLeadingFn = dyn Fn() + Send + Sync;
type NewLeaderFn = dyn Fn(&str) + Send + Sync;

/// The three hooks a candidate registers before the election starts.
pub struct LeaderCallbacks {
    work: Arc<dyn ProtectedWork>,
    stopped_leading: Option<Box<StoppedLeadingFn>>,
    new_leader: Option<Box<NewLeaderFn>>,
}

impl LeaderCallbacks {
    /// Runs `work` at the start of every leadership interval.
    pub fn on_started_leading(work: impl ProtectedWork + 'static) -> Self {
        Self::with_work(Arc::new(work))
    }

    pub fn with_work(work: Arc<dyn ProtectedWork>) -> Self {
        Self {
            work,
            stopped_leading: None,
            new_leader: None,
        }
    }

    /// Called once per leadership interval, after the work has returned.
    pub fn on_stopped_leading(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.stopped_leading = Some(Box::new(f));
        self
    }

    /// Called with the holder identity whenever it changes, including to self.
    pub fn on_new_leader(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.new_leader = Some(Box::new(f));
        self
    }
}

impl Default for LeaderCallbacks {
    fn default() -> Self {
        Self::on_started_leading(Idle)
    }
}

impl fmt::Debug for LeaderCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderCallbacks")
            .field("stopped_leading", &self.stopped_leading.is_some())
            .field("new_leader", &self.new_leader.is_some())
            .finish_non_exhaustive()
    }
}

/// Owns this process's role and the callbacks tied to it.
///
/// Only lease events move the role; `Stopped` is terminal.
pub struct ElectionStateMachine {
    identity: CandidateId,
    role: watch::Sender<Role>,
    observed_holder: Option<String>,
    term: u64,
    runner: WorkRunner,
    active: Option<WorkHandle>,
    stopped_leading: Option<Box<StoppedLeadingFn>>,
    new_leader: Option<Box<NewLeaderFn>>,
    cancel: CancellationToken,
}

impl ElectionStateMachine {
    /// `cancel` is the process-wide token; each interval gets a child of it.
    pub fn new(
        identity: CandidateId,
        callbacks: LeaderCallbacks,
        role: watch::Sender<Role>,
        cancel: CancellationToken,
    ) -> Self {
        role.send_replace(Role::Unknown);
        Self {
            runner: WorkRunner::new(identity.as_str(), callbacks.work),
            identity,
            role,
            observed_holder: None,
            term: 0,
            active: None,
            stopped_leading: callbacks.stopped_leading,
            new_leader: callbacks.new_leader,
            cancel,
        }
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn observed_holder(&self) -> Option<&str> {
        self.observed_holder.as_deref()
    }

    fn transition(&mut self, to: Role) {
        let from = self.role.send_replace(to);
        if from != to {
            debug!(identity = %self.identity, ?from, ?to, "role transition");
        }
    }

    fn holder_observed(&mut self, holder: String) {
        if self.role() == Role::Unknown && holder != self.identity.as_str() {
            self.transition(Role::Follower);
        }
        if self.observed_holder.as_deref() == Some(holder.as_str()) {
            return;
        }

        if holder == self.identity.as_str() {
            info!(identity = %self.identity, "this candidate was elected leader");
        } else {
            info!(identity = %self.identity, leader = %holder, "new leader elected");
        }
        if let Some(new_leader) = &self.new_leader {
            new_leader(&holder);
        }
        self.observed_holder = Some(holder);
    }

    fn start_leading(&mut self) {
        match self.role() {
            Role::Leader => warn!(identity = %self.identity, "acquired while already leading; ignoring"),
            Role::Stopped => debug!(identity = %self.identity, "acquired after stop; ignoring"),
            Role::Unknown | Role::Follower => {
                self.term += 1;
                self.transition(Role::Leader);
                info!(identity = %self.identity, term = self.term, "started leading");
                self.active = Some(self.runner.start(self.term, self.cancel.child_token()));
            }
        }
    }

    /// Cancels the current interval's work and waits for it to return.
    async fn stop_work(&mut self) {
        if let Some(handle) = self.active.take() {
            debug!(identity = %self.identity, term = handle.term(), "waiting for protected work to stop");
            handle.stop().await;
        }
    }

    fn fire_stopped_leading(&self) {
        info!(identity = %self.identity, term = self.term, "no longer leader");
        if let Some(stopped_leading) = &self.stopped_leading {
            stopped_leading();
        }
    }

    async fn lost(&mut self) {
        if self.role() != Role::Leader {
            debug!(identity = %self.identity, role = ?self.role(), "lost event while not leading; ignoring");
            return;
        }
        self.stop_work().await;
        self.transition(Role::Follower);
        self.fire_stopped_leading();
    }

    async fn stopped(&mut self) {
        let was_leader = self.role() == Role::Leader;
        self.stop_work().await;
        self.transition(Role::Stopped);
        if was_leader {
            self.fire_stopped_leading();
        }
    }
}

#[async_trait]
impl LeaseObserver for ElectionStateMachine {
    async fn lease_event(&mut self, event: LeaseEvent) {
        if self.role() == Role::Stopped {
            debug!(identity = %self.identity, ?event, "event after stop; ignoring");
            return;
        }
        match event {
            LeaseEvent::HolderObserved(holder) => self.holder_observed(holder),
            LeaseEvent::Acquired => self.start_leading(),
            LeaseEvent::Lost => self.lost().await,
            LeaseEvent::Relinquishing => self.stop_work().await,
            LeaseEvent::Stopped => self.stopped().await,
        }
    }
}

impl fmt::Debug for ElectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectionStateMachine")
            .field("identity", &self.identity)
            .field("role", &self.role())
            .field("observed_holder", &self.observed_holder)
            .field("term", &self.term)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::work_fn;
    use parking_lot::Mutex;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn machine(calls: &Calls) -> (ElectionStateMachine, watch::Receiver<Role>, CancellationToken) {
        let started = calls.clone();
        let stopped = calls.clone();
        let observed = calls.clone();
        let callbacks = LeaderCallbacks::on_started_leading(work_fn(move |cancel: CancellationToken| {
            let started = started.clone();
            async move {
                started.lock().push("started".to_string());
                cancel.cancelled().await;
                started.lock().push("work-finished".to_string());
                Ok(())
            }
        }))
        .on_stopped_leading(move || stopped.lock().push("stopped".to_string()))
        .on_new_leader(move |holder| observed.lock().push(format!("leader:{holder}")));

        let (tx, rx) = watch::channel(Role::Unknown);
        let cancel = CancellationToken::new();
        let machine = ElectionStateMachine::new(
            CandidateId::new("pod-a").unwrap(),
            callbacks,
            tx,
            cancel.clone(),
        );
        (machine, rx, cancel)
    }

    #[tokio::test]
    async fn test_follower_then_leader_then_lost() {
        let calls = Calls::default();
        let (mut machine, role, _cancel) = machine(&calls);

        machine.lease_event(LeaseEvent::HolderObserved("pod-b".into())).await;
        assert_eq!(*role.borrow(), Role::Follower);

        machine.lease_event(LeaseEvent::HolderObserved("pod-a".into())).await;
        machine.lease_event(LeaseEvent::Acquired).await;
        assert_eq!(*role.borrow(), Role::Leader);
        assert_eq!(machine.term(), 1);
        tokio::task::yield_now().await;

        machine.lease_event(LeaseEvent::Lost).await;
        assert_eq!(*role.borrow(), Role::Follower);

        assert_eq!(
            *calls.lock(),
            vec!["leader:pod-b", "leader:pod-a", "started", "work-finished", "stopped"]
        );
    }

    #[tokio::test]
    async fn test_new_leader_deduplicates_on_holder() {
        let calls = Calls::default();
        let (mut machine, _role, _cancel) = machine(&calls);

        for _ in 0..3 {
            machine.lease_event(LeaseEvent::HolderObserved("pod-b".into())).await;
        }
        machine.lease_event(LeaseEvent::HolderObserved("pod-c".into())).await;
        machine.lease_event(LeaseEvent::HolderObserved("pod-c".into())).await;

        assert_eq!(*calls.lock(), vec!["leader:pod-b", "leader:pod-c"]);
        assert_eq!(machine.observed_holder(), Some("pod-c"));
    }

    #[tokio::test]
    async fn test_second_acquire_does_not_start_work_twice() {
        let calls = Calls::default();
        let (mut machine, _role, _cancel) = machine(&calls);

        machine.lease_event(LeaseEvent::Acquired).await;
        machine.lease_event(LeaseEvent::Acquired).await;
        tokio::task::yield_now().await;
        assert_eq!(machine.term(), 1);

        machine.lease_event(LeaseEvent::Stopped).await;
        let started = calls.lock().iter().filter(|c| *c == "started").count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_relinquish_then_stop_fires_stopped_once() {
        let calls = Calls::default();
        let (mut machine, role, _cancel) = machine(&calls);

        machine.lease_event(LeaseEvent::Acquired).await;
        tokio::task::yield_now().await;

        machine.lease_event(LeaseEvent::Relinquishing).await;
        assert_eq!(*role.borrow(), Role::Leader);
        assert_eq!(calls.lock().last().map(String::as_str), Some("work-finished"));

        machine.lease_event(LeaseEvent::Stopped).await;
        assert_eq!(*role.borrow(), Role::Stopped);

        // terminal: nothing moves the role afterwards
        machine.lease_event(LeaseEvent::Acquired).await;
        assert_eq!(*role.borrow(), Role::Stopped);

        let stopped = calls.lock().iter().filter(|c| *c == "stopped").count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_lost_while_follower_is_ignored() {
        let calls = Calls::default();
        let (mut machine, role, _cancel) = machine(&calls);

        machine.lease_event(LeaseEvent::HolderObserved("pod-b".into())).await;
        machine.lease_event(LeaseEvent::Lost).await;
        assert_eq!(*role.borrow(), Role::Follower);
        assert_eq!(*calls.lock(), vec!["leader:pod-b"]);
    }

    #[tokio::test]
    async fn test_process_cancel_reaches_running_work() {
        let calls = Calls::default();
        let (mut machine, _role, cancel) = machine(&calls);

        machine.lease_event(LeaseEvent::Acquired).await;
        tokio::task::yield_now().await;
        cancel.cancel();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(calls.lock().contains(&"work-finished".to_string()));
        machine.lease_event(LeaseEvent::Stopped).await;
    }
}
