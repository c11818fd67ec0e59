use crate::{
    config::ElectionConfig,
    machine::{ElectionStateMachine, LeaderCallbacks},
    manager::LeaseManager,
    store::LeaseStore,
    time::{AnchoredClock, Clock},
    Result, Role,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One candidate: validated configuration, lease store, and its callbacks.
///
/// Construction validates the configuration, so an elector that exists can
/// always run. Callbacks are fixed at construction.
#[derive(Debug)]
pub struct LeaderElector {
    config: ElectionConfig,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    callbacks: LeaderCallbacks,
    role: watch::Sender<Role>,
}

impl LeaderElector {
    pub fn new(
        config: ElectionConfig,
        store: Arc<dyn LeaseStore>,
        callbacks: LeaderCallbacks,
    ) -> Result<Self> {
        config.validate()?;
        let (role, _) = watch::channel(Role::Unknown);
        Ok(Self {
            config,
            store,
            clock: Arc::new(AnchoredClock::new()),
            callbacks,
            role,
        })
    }

    /// Replaces the wall clock used to stamp and judge the lease.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Follows this candidate's role. The receiver keeps working after `run` ends.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    /// Contends for the lease until `cancel` fires.
    ///
    /// Returns once protected work has stopped and, if configured, the lease
    /// has been released.
    pub async fn run(self, cancel: CancellationToken) {
        let mut manager = LeaseManager::new(&self.config, self.store, self.clock);
        let mut machine = ElectionStateMachine::new(
            self.config.identity,
            self.callbacks,
            self.role,
            cancel.clone(),
        );
        manager.run(&cancel, &mut machine).await;
    }
}
