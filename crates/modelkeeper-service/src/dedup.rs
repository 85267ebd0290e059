//! The in-memory index of already persisted work.
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::metric;
use crate::records::LogicalKey;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::store::{RecordStore, StoreError, run_blocking};

/// The set of [`LogicalKey`]s that have a persisted record.
///
/// The index only ever grows. It is seeded from the store at startup and extended by the
/// writer after every successful commit. Keys committed by other processes are only added
/// once the [`Coordinator`](crate::coordinator::Coordinator) finds them in the store.
#[derive(Debug, Default)]
pub struct DedupIndex {
    keys: RwLock<HashSet<LogicalKey>>,
}

impl DedupIndex {
    /// Scans `store` for every persisted key.
    ///
    /// Transient store errors are retried according to `policy`. Any remaining error must
    /// abort startup, as serving without the index would persist duplicates.
    pub async fn initialize(
        store: &Arc<dyn RecordStore>,
        policy: &RetryPolicy,
    ) -> Result<Self, StoreError> {
        let keys = execute_with_retry("dedup.initialize", policy, StoreError::is_transient, || {
            run_blocking(store, |store| store.load_keys())
        })
        .await?;

        let index = Self::default();
        index.extend(keys);
        tracing::info!("Initialized dedup index with {} keys", index.len());
        Ok(index)
    }

    pub fn contains(&self, key: &LogicalKey) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Adds `key`, returning `true` if it was not yet present.
    pub fn insert(&self, key: LogicalKey) -> bool {
        let inserted = self
            .keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        if inserted {
            metric!(gauge("dedup.keys") = self.len() as u64);
        }
        inserted
    }

    pub fn extend(&self, keys: impl IntoIterator<Item = LogicalKey>) {
        let len = {
            let mut guard = self.keys.write().unwrap_or_else(PoisonError::into_inner);
            guard.extend(keys);
            guard.len()
        };
        metric!(gauge("dedup.keys") = len as u64);
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
