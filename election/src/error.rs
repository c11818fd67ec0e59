use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Candidate identity is missing or empty")]
    MissingIdentity,

    #[error("Invalid lease {field}: {reason}")]
    InvalidLease { field: &'static str, reason: String },

    #[error("Invalid election timing: {0}")]
    InvalidTiming(String),

    #[error("Unknown workload {name:?} (available: {available})")]
    UnknownWorkload { name: String, available: String },

    #[error("Workload {0:?} is already registered")]
    DuplicateWorkload(String),

    #[error("Failed to install signal handlers: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a lease store.
///
/// All of these are transient from the election's point of view: the lease
/// manager logs them and retries on the next retry period. A compare-and-swap
/// that loses is not an error, see [`crate::store::WriteOutcome::Conflict`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Lease store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, Error>;
