//! Exactly-once orchestration of expensive work on the request path.
use std::future::Future;
use std::sync::Arc;

use crate::dedup::DedupIndex;
use crate::locks::{LockError, LockManager};
use crate::metric;
use crate::records::{LogicalKey, WriteRecord};
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::store::{RecordStore, StoreError, run_blocking};
use crate::writer::{BatchOutcome, WriteQueue};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to look up persisted records")]
    Store(#[from] StoreError),
    #[error("computation failed")]
    Compute(#[source] E),
}

/// The result of [`Coordinator::run_exclusive`].
#[derive(Debug)]
pub enum Outcome<T> {
    /// A record for the key is already persisted, nothing was computed.
    AlreadyPersisted,
    /// The work was computed here and its records were handed to the writer.
    Computed {
        value: T,
        /// What the writer did with the records.
        outcome: BatchOutcome,
    },
}

/// Guards computations by their [`LogicalKey`].
///
/// A computation runs only if no record for its key is persisted yet, and only while holding
/// the distributed lock for the key. Under the lock the store itself is consulted, as other
/// processes commit records this process' [`DedupIndex`] never sees. The lock is held until
/// the writer has handled the records, so the next holder finds them in the store.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn RecordStore>,
    index: Arc<DedupIndex>,
    locks: LockManager,
    queue: WriteQueue,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("index", &self.index.len())
            .field("locks", &self.locks)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<DedupIndex>,
        locks: LockManager,
        queue: WriteQueue,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            index,
            locks,
            queue,
            policy,
        }
    }

    /// Whether a record for `key` is persisted by any process.
    ///
    /// A hit in the store is remembered in the index.
    async fn is_persisted(&self, key: &LogicalKey) -> Result<bool, StoreError> {
        if self.index.contains(key) {
            return Ok(true);
        }

        let lookup = key.clone();
        let persisted = execute_with_retry(
            "coordinator.lookup",
            &self.policy,
            StoreError::is_transient,
            || {
                let key = lookup.clone();
                run_blocking(&self.store, move |store| store.contains_key(&key))
            },
        )
        .await?;
        if persisted {
            self.index.insert(key.clone());
        }
        Ok(persisted)
    }

    /// Runs `compute` for `key` unless its result is already persisted.
    ///
    /// `compute` returns the value handed back to the caller together with the records to
    /// persist.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn run_exclusive<F, Fut, T, E>(
        &self,
        key: &LogicalKey,
        compute: F,
    ) -> Result<Outcome<T>, CoordinatorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Vec<WriteRecord>), E>>,
        E: std::error::Error + 'static,
    {
        if self.index.contains(key) {
            metric!(counter("coordinator.dedup_hit") += 1, "stage" => "initial");
            return Ok(Outcome::AlreadyPersisted);
        }

        let guarded = async {
            // another holder may have finished while we waited for the lock
            if self.is_persisted(key).await? {
                metric!(counter("coordinator.dedup_hit") += 1, "stage" => "locked");
                return Ok(Outcome::AlreadyPersisted);
            }

            let (value, records) = compute().await.map_err(CoordinatorError::Compute)?;
            metric!(counter("coordinator.computed") += 1);
            let outcome = self.queue.enqueue(records).outcome().await;
            Ok::<_, CoordinatorError<E>>(Outcome::Computed { value, outcome })
        };

        self.locks.with_lock(&key.to_string(), guarded).await?
    }
}
