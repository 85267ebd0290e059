//! The single consumer serializing every write to the [`RecordStore`].
//!
//! Request paths hand finished records to a [`WriteQueue`]. Exactly one [`Writer`] drains the
//! queue in FIFO order and commits each batch in its own transaction, retrying transient store
//! errors. Batches that still fail are dropped and reported, never silently.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dedup::DedupIndex;
use crate::metric;
use crate::records::WriteRecord;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::store::{RecordStore, StoreError, run_blocking};

/// What happened to an enqueued batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch was committed. Records whose key was already persisted were skipped.
    Committed { written: usize, skipped: usize },
    /// The batch could not be persisted and was discarded.
    Dropped,
}

/// A batch of records travelling across the queue.
#[derive(Debug)]
struct WriteMessage {
    records: Vec<WriteRecord>,
    /// Notified once the batch has been handled.
    done_tx: oneshot::Sender<BatchOutcome>,
    enqueued_at: Instant,
}

/// Resolves to the [`BatchOutcome`] of one enqueued batch.
///
/// The receipt can be safely ignored if the caller does not need to know when its records
/// are persisted. This mostly exists to enable testing and orderly shutdown.
#[derive(Debug)]
pub struct WriteReceipt(oneshot::Receiver<BatchOutcome>);

impl WriteReceipt {
    pub async fn outcome(self) -> BatchOutcome {
        // The writer went away without answering.
        self.0.await.unwrap_or(BatchOutcome::Dropped)
    }
}

/// The producer side of the write queue.
///
/// Cloning is cheap. The [`Writer`] stops once every clone has been dropped and the queue is
/// drained.
#[derive(Clone, Debug)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteMessage>,
}

impl WriteQueue {
    /// Appends `records` as one batch to the tail of the queue.
    ///
    /// This never blocks. The queue is unbounded, so memory grows if the writer falls behind.
    pub fn enqueue(&self, records: Vec<WriteRecord>) -> WriteReceipt {
        let (done_tx, done_rx) = oneshot::channel();
        let len = records.len();
        let message = WriteMessage {
            records,
            done_tx,
            enqueued_at: Instant::now(),
        };
        match self.tx.send(message) {
            Ok(()) => metric!(counter("writer.enqueued") += len as i64),
            Err(_) => {
                metric!(counter("writer.batch.dropped") += 1, "reason" => "closed");
                tracing::error!("Write queue is closed, dropping {len} records");
            }
        }
        WriteReceipt(done_rx)
    }
}

/// The single consumer of the write queue.
pub struct Writer {
    rx: mpsc::UnboundedReceiver<WriteMessage>,
    store: Arc<dyn RecordStore>,
    index: Arc<DedupIndex>,
    policy: RetryPolicy,
    /// Sequence number of the next batch, for log correlation.
    next_batch: u64,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("index", &self.index.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Writer {
    /// Creates the queue and its consumer. The consumer does nothing until [`run`](Self::run).
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<DedupIndex>,
        policy: RetryPolicy,
    ) -> (WriteQueue, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Self {
            rx,
            store,
            index,
            policy,
            next_batch: 0,
        };
        (WriteQueue { tx }, writer)
    }

    /// Creates the queue and spawns its consumer on the current runtime.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        index: Arc<DedupIndex>,
        policy: RetryPolicy,
    ) -> (WriteQueue, JoinHandle<()>) {
        let (queue, writer) = Self::new(store, index, policy);
        let handle = tokio::spawn(writer.run().bind_hub(Hub::new_from_top(Hub::current())));
        (queue, handle)
    }

    /// Drains the queue until every [`WriteQueue`] handle has been dropped.
    pub async fn run(mut self) {
        tracing::debug!("Write queue writer started");
        while let Some(message) = self.rx.recv().await {
            let WriteMessage {
                records,
                done_tx,
                enqueued_at,
            } = message;
            metric!(timer("writer.queue_wait") = enqueued_at.elapsed());

            let batch = self.next_batch;
            self.next_batch += 1;
            let span = tracing::info_span!("write_batch", batch, records = records.len());
            let outcome = self.write_batch(records).instrument(span).await;
            // the submitter is free to ignore the outcome
            done_tx.send(outcome).ok();
        }
        tracing::debug!("Write queue closed, writer stopped");
    }

    async fn write_batch(&self, records: Vec<WriteRecord>) -> BatchOutcome {
        let total = records.len();

        // A single writer means nothing else commits between this check and the commit.
        let mut batch_keys = HashSet::new();
        let records: Vec<_> = records
            .into_iter()
            .filter(|record| {
                let key = record.key();
                !self.index.contains(&key) && batch_keys.insert(key)
            })
            .collect();
        let skipped = total - records.len();
        if skipped > 0 {
            metric!(counter("writer.records.skipped") += skipped as i64);
            tracing::debug!("Skipping {skipped} already persisted records");
        }
        if records.is_empty() {
            return BatchOutcome::Committed {
                written: 0,
                skipped,
            };
        }

        let records = Arc::new(records);
        let started = Instant::now();
        let result = execute_with_retry(
            "writer.commit",
            &self.policy,
            StoreError::is_transient,
            || {
                let records = Arc::clone(&records);
                run_blocking(&self.store, move |store| store.insert_batch(&records))
            },
        )
        .await;

        match result {
            Ok(written) => {
                metric!(timer("writer.commit.duration") = started.elapsed());
                metric!(counter("writer.records.written") += written as i64);
                self.index.extend(batch_keys);
                BatchOutcome::Committed { written, skipped }
            }
            Err(err) => {
                metric!(counter("writer.batch.dropped") += 1, "reason" => "commit");
                sentry::with_scope(
                    |scope| scope.set_extra("records", records.len().into()),
                    || {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Failed to persist batch of {} records, dropping it",
                            records.len(),
                        );
                        sentry::capture_error(&err);
                    },
                );
                BatchOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::records::{Audit, LogicalKey, TextEmbedding};
    use crate::store::{PurgeStats, SqliteStore};

    /// Fails the first `failures` commits with a transient error.
    struct FlakyStore {
        inner: SqliteStore,
        failures: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                failures: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl RecordStore for FlakyStore {
        fn insert_batch(&self, records: &[WriteRecord]) -> Result<usize, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Transient("database is locked".into()));
            }
            self.inner.insert_batch(records)
        }

        fn load_keys(&self) -> Result<Vec<LogicalKey>, StoreError> {
            self.inner.load_keys()
        }

        fn contains_key(&self, key: &LogicalKey) -> Result<bool, StoreError> {
            self.inner.contains_key(key)
        }

        fn delete_older_than(
            &self,
            cutoff: DateTime<Utc>,
            dry_run: bool,
        ) -> Result<PurgeStats, StoreError> {
            self.inner.delete_older_than(cutoff, dry_run)
        }
    }

    fn record(text: &str) -> WriteRecord {
        let now = Utc::now();
        TextEmbedding::new(
            text,
            "model",
            "mean",
            serde_json::json!([0.5]),
            Audit::new("127.0.0.1", now, now),
        )
        .into()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let store = Arc::new(FlakyStore::new(2));
        let index = Arc::new(DedupIndex::default());
        let (queue, handle) = Writer::spawn(store.clone(), index.clone(), policy());

        let outcome = queue.enqueue(vec![record("a")]).outcome().await;
        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                written: 1,
                skipped: 0
            }
        );
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(index.contains(&LogicalKey::text_embedding("a", "model", "mean")));

        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drops_batch_after_exhaustion() {
        let store = Arc::new(FlakyStore::new(10));
        let index = Arc::new(DedupIndex::default());
        let (queue, handle) = Writer::spawn(store.clone(), index.clone(), policy());

        let outcome = queue.enqueue(vec![record("a")]).outcome().await;
        assert_eq!(outcome, BatchOutcome::Dropped);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(index.is_empty());

        // the writer keeps serving later batches
        store.failures.store(0, Ordering::SeqCst);
        let outcome = queue.enqueue(vec![record("b")]).outcome().await;
        assert!(matches!(outcome, BatchOutcome::Committed { written: 1, .. }));
        assert_eq!(store.inner.count(crate::records::RecordKind::TextEmbedding).unwrap(), 1);

        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_skips_persisted_keys() {
        let store = Arc::new(FlakyStore::new(0));
        let index = Arc::new(DedupIndex::default());
        let (queue, handle) = Writer::spawn(store.clone(), index, policy());

        let first = queue.enqueue(vec![record("a"), record("a"), record("b")]);
        let second = queue.enqueue(vec![record("b"), record("c")]);
        assert_eq!(
            first.outcome().await,
            BatchOutcome::Committed {
                written: 2,
                skipped: 1
            }
        );
        assert_eq!(
            second.outcome().await,
            BatchOutcome::Committed {
                written: 1,
                skipped: 1
            }
        );
        assert_eq!(store.inner.text_embeddings("b", "model").unwrap().len(), 1);

        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_queue_reports_dropped() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (queue, writer) = Writer::new(store, Arc::new(DedupIndex::default()), policy());
        drop(writer);

        let outcome = queue.enqueue(vec![record("a")]).outcome().await;
        assert_eq!(outcome, BatchOutcome::Dropped);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_logs_carry_sequence_number() {
        let capture = Capture::default();
        let make_writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_span_list(true)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || make_writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = Arc::new(FlakyStore::new(0));
        let (queue, handle) = Writer::spawn(store, Arc::new(DedupIndex::default()), policy());
        queue.enqueue(vec![record("a")]).outcome().await;
        queue.enqueue(vec![record("a")]).outcome().await;
        drop(queue);
        handle.await.unwrap();

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let skipped = output
            .lines()
            .find(|line| line.contains("Skipping 1 already persisted records"))
            .unwrap();
        let event: serde_json::Value = serde_json::from_str(skipped).unwrap();
        assert_eq!(event["spans"][0]["name"], "write_batch");
        assert_eq!(event["spans"][0]["batch"], 1);
        assert_eq!(event["spans"][0]["records"], 1);
    }
}
