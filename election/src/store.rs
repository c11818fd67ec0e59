use crate::{
    error::StoreError,
    lease::{LeaseKey, LeaseRecord, LeaseSpec},
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied; carries the stored record with its new version.
    Written(LeaseRecord),
    /// The expected version (or absence) no longer matched.
    Conflict,
}

/// Client for a coordination backend offering atomic conditional writes.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Reads the record, `Ok(None)` when it does not exist.
    async fn get(&self, key: &LeaseKey) -> Result<Option<LeaseRecord>, StoreError>;

    /// Writes `spec` if the stored version equals `expected_version`.
    ///
    /// `None` creates the record and only succeeds if it is absent.
    async fn create_or_update(
        &self,
        key: &LeaseKey,
        spec: LeaseSpec,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError>;
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    async fn get(&self, key: &LeaseKey) -> Result<Option<LeaseRecord>, StoreError> {
        (**self).get(key).await
    }

    async fn create_or_update(
        &self,
        key: &LeaseKey,
        spec: LeaseSpec,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).create_or_update(key, spec, expected_version).await
    }
}

/// Versioned in-process lease store.
///
/// Clones share the same records, so several candidates in one process can
/// contend through it. Versions come from a store-wide counter and are never
/// reused.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<DashMap<LeaseKey, LeaseRecord>>,
    versions: Arc<AtomicU64>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record, bypassing the async client interface.
    pub fn snapshot(&self, key: &LeaseKey) -> Option<LeaseRecord> {
        self.leases.get(key).map(|entry| entry.clone())
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, key: &LeaseKey) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(self.snapshot(key))
    }

    async fn create_or_update(
        &self,
        key: &LeaseKey,
        spec: LeaseSpec,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError> {
        match (self.leases.entry(key.clone()), expected_version) {
            (Entry::Vacant(vacant), None) => {
                let record = LeaseRecord {
                    key: key.clone(),
                    spec,
                    version: self.next_version(),
                };
                vacant.insert(record.clone());
                Ok(WriteOutcome::Written(record))
            }
            (Entry::Occupied(mut occupied), Some(expected))
                if occupied.get().version == expected =>
            {
                let record = LeaseRecord {
                    key: key.clone(),
                    spec,
                    version: self.next_version(),
                };
                occupied.insert(record.clone());
                Ok(WriteOutcome::Written(record))
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(holder: &str) -> LeaseSpec {
        LeaseSpec {
            holder: Some(holder.to_string()),
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(15),
            acquire_time: None,
            renew_time: None,
            leader_transitions: 0,
        }
    }

    #[tokio::test]
    async fn test_create_only_when_absent() {
        let store = InMemoryLeaseStore::new();
        let key = LeaseKey::new("agent-lock", "proxysql");

        assert_eq!(store.get(&key).await.unwrap(), None);

        let created = store.create_or_update(&key, spec("pod-a"), None).await.unwrap();
        let WriteOutcome::Written(record) = created else {
            panic!("expected create to succeed");
        };
        assert_eq!(record.holder(), Some("pod-a"));

        // a second create loses
        let second = store.create_or_update(&key, spec("pod-b"), None).await.unwrap();
        assert_eq!(second, WriteOutcome::Conflict);
        assert_eq!(store.get(&key).await.unwrap().unwrap().holder(), Some("pod-a"));
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = InMemoryLeaseStore::new();
        let key = LeaseKey::new("agent-lock", "proxysql");

        let WriteOutcome::Written(first) =
            store.create_or_update(&key, spec("pod-a"), None).await.unwrap()
        else {
            panic!("expected create to succeed");
        };

        let WriteOutcome::Written(second) = store
            .create_or_update(&key, spec("pod-b"), Some(first.version))
            .await
            .unwrap()
        else {
            panic!("expected update at current version to succeed");
        };
        assert!(second.version > first.version);

        // stale version is rejected, no blind overwrite
        let stale = store
            .create_or_update(&key, spec("pod-c"), Some(first.version))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::Conflict);
        assert_eq!(store.snapshot(&key).unwrap().holder(), Some("pod-b"));
    }

    #[tokio::test]
    async fn test_update_of_missing_record_conflicts() {
        let store = InMemoryLeaseStore::new();
        let key = LeaseKey::new("agent-lock", "proxysql");

        let outcome = store.create_or_update(&key, spec("pod-a"), Some(7)).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert!(store.snapshot(&key).is_none());
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let store = InMemoryLeaseStore::new();
        let other = store.clone();
        let key = LeaseKey::new("agent-lock", "proxysql");

        store.create_or_update(&key, spec("pod-a"), None).await.unwrap();
        assert_eq!(other.get(&key).await.unwrap().unwrap().holder(), Some("pod-a"));
    }
}
