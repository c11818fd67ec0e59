//! Lease-based leader election for a fleet of identical replicas.
//!
//! Exactly one candidate at a time holds the lease and runs its protected
//! work. The [`manager::LeaseManager`] drives acquire/renew/release against a
//! [`store::LeaseStore`], the [`machine::ElectionStateMachine`] turns its
//! events into role changes and callbacks, and the
//! [`shutdown::ShutdownCoordinator`] turns termination signals into one
//! cancellation that stops the work before the lease is released.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod capability;
pub mod config;
pub mod elector;
pub mod error;
pub mod lease;
pub mod machine;
pub mod manager;
pub mod shutdown;
pub mod store;
pub mod time;
pub mod work;

pub mod test_utils;

pub use capability::WorkloadRegistry;
pub use config::ElectionConfig;
pub use elector::LeaderElector;
pub use error::{Error, Result, StoreError};
pub use lease::{LeaseKey, LeaseRecord, LeaseSpec};
pub use machine::LeaderCallbacks;
pub use shutdown::{ShutdownCoordinator, TerminationSignal};
pub use store::{InMemoryLeaseStore, LeaseStore, WriteOutcome};
pub use work::{work_fn, ProtectedWork};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of this process in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Unknown,
    Follower,
    Leader,
    Stopped,
}

/// Identity written into the lease by this process. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::MissingIdentity);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CandidateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
