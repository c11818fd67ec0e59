// Lease record shared by every candidate of a coordinated group

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies one lease record in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseKey {
    pub name: String,
    pub scope: String,
}

impl LeaseKey {
    pub fn new(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: scope.into(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::InvalidLease {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.scope.trim().is_empty() {
            return Err(crate::Error::InvalidLease {
                field: "scope",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// The writable body of a lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSpec {
    /// Current holder; `None` or empty once released
    pub holder: Option<String>,

    /// How long the lease stays valid after `renew_time`
    pub lease_duration: Duration,

    /// How long the holder keeps retrying a renewal before demoting itself
    pub renew_deadline: Duration,

    /// When the current holder first acquired the lease
    pub acquire_time: Option<Timestamp>,

    /// Last successful write by the holder
    pub renew_time: Option<Timestamp>,

    /// Number of times the holder changed to a different candidate
    pub leader_transitions: u32,
}

/// A lease record as stored, with the version used for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: LeaseKey,
    pub spec: LeaseSpec,
    pub version: u64,
}

impl LeaseRecord {
    /// The holder identity, treating an empty string as unheld.
    pub fn holder(&self) -> Option<&str> {
        self.spec.holder.as_deref().filter(|holder| !holder.is_empty())
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder() == Some(identity)
    }

    /// When the lease stops being valid, if it was ever renewed.
    pub fn expires_at(&self) -> Option<Timestamp> {
        let renewed = self.spec.renew_time?;
        let ttl = chrono::Duration::from_std(self.spec.lease_duration).ok()?;
        renewed.checked_add_signed(ttl)
    }

    /// `now > last-renew + duration`. Records without a renew time count as expired.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at().map_or(true, |expiry| now > expiry)
    }

    /// Whether a candidate other than the holder may take this lease at `now`.
    pub fn is_available(&self, now: Timestamp) -> bool {
        self.holder().is_none() || self.is_expired(now)
    }
}
