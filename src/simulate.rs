// In-process election demo: several candidates share one in-memory lease store

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use election::{
    work_fn, CandidateId, ElectionConfig, InMemoryLeaseStore, LeaderCallbacks, LeaderElector, LeaseKey, LeaseRecord,
    Role,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::SimulateArgs;
use crate::settings::lock_name;

/// What `baton simulate` prints when it finishes.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Candidates in the order they started leading
    pub leaders: Vec<String>,
    /// Lease record as left in the store
    pub record: Option<LeaseRecord>,
}

struct SimCandidate {
    identity: CandidateId,
    role: watch::Receiver<Role>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub async fn simulate(args: &SimulateArgs, shutdown: CancellationToken) -> Result<SimulationReport> {
    let store = InMemoryLeaseStore::new();
    let key = LeaseKey::new(lock_name("simulation"), "local");
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let mut candidates = Vec::with_capacity(usize::from(args.candidates));
    for i in 0..args.candidates {
        let identity = CandidateId::new(format!("candidate-{i}"))?;
        let config = ElectionConfig::new(key.clone(), identity.clone())
            .with_lease_duration(Duration::from_secs(args.lease_duration))
            .with_renew_deadline(Duration::from_secs(args.renew_deadline))
            .with_retry_period(Duration::from_secs(args.retry_period));

        let tx = started_tx.clone();
        let id = identity.to_string();
        let callbacks = LeaderCallbacks::on_started_leading(work_fn(move |cancel: CancellationToken| {
            let tx = tx.clone();
            let id = id.clone();
            async move {
                // receiver only goes away once every candidate has stopped
                let _ = tx.send(id);
                cancel.cancelled().await;
                Ok::<(), anyhow::Error>(())
            }
        }));

        let elector = LeaderElector::new(config, Arc::new(store.clone()), callbacks)
            .context("invalid simulation timings")?;
        let role = elector.subscribe();
        let cancel = shutdown.child_token();
        let handle = tokio::spawn(elector.run(cancel.clone()));
        candidates.push(SimCandidate {
            identity,
            role,
            cancel,
            handle,
        });
    }
    drop(started_tx);

    let run_for = sleep(Duration::from_secs(args.duration));
    tokio::pin!(run_for);

    if let Some(after) = args.fail_leader_after {
        tokio::select! {
            _ = sleep(Duration::from_secs(after)) => {
                if let Some(leader) = candidates.iter().find(|c| *c.role.borrow() == Role::Leader) {
                    info!(leader = %leader.identity, "cancelling current leader");
                    leader.cancel.cancel();
                }
            }
            _ = &mut run_for => {}
            _ = shutdown.cancelled() => {}
        }
    }

    tokio::select! {
        _ = &mut run_for => {}
        _ = shutdown.cancelled() => {}
    }

    for candidate in &candidates {
        candidate.cancel.cancel();
    }
    for candidate in candidates {
        candidate
            .handle
            .await
            .with_context(|| format!("candidate {} did not stop cleanly", candidate.identity))?;
    }

    let mut leaders = Vec::new();
    while let Ok(id) = started_rx.try_recv() {
        leaders.push(id);
    }

    Ok(SimulationReport {
        leaders,
        record: store.snapshot(&key),
    })
}
