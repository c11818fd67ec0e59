// Election configuration and startup validation

use crate::{lease::LeaseKey, CandidateId, Error, Result};
use std::time::Duration;

/// Default lease duration (60 seconds)
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Default renew deadline (15 seconds)
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(15);

/// Default retry period (5 seconds)
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Everything a candidate needs to contend for one lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Which lease record to contend for
    pub lease: LeaseKey,

    /// This process's identity, written as the holder
    pub identity: CandidateId,

    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,

    /// How long the leader keeps retrying renewal before demoting itself
    pub renew_deadline: Duration,

    /// Wait between acquire and renew attempts
    pub retry_period: Duration,

    /// Clear the holder on cancellation instead of letting the lease expire
    pub release_on_cancel: bool,
}

impl ElectionConfig {
    pub fn new(lease: LeaseKey, identity: CandidateId) -> Self {
        Self {
            lease,
            identity,
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_renew_deadline(mut self, renew_deadline: Duration) -> Self {
        self.renew_deadline = renew_deadline;
        self
    }

    pub fn with_retry_period(mut self, retry_period: Duration) -> Self {
        self.retry_period = retry_period;
        self
    }

    pub fn with_release_on_cancel(mut self, release_on_cancel: bool) -> Self {
        self.release_on_cancel = release_on_cancel;
        self
    }

    /// Checks the lease key and `retry period < renew deadline < lease duration`.
    pub fn validate(&self) -> Result<()> {
        self.lease.validate()?;

        if self.retry_period.is_zero() {
            return Err(Error::InvalidTiming("retry period must be greater than zero".into()));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::InvalidTiming(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::InvalidTiming(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}
