use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use modelkeeper_service::coordinator::{CoordinatorError, Outcome};
use modelkeeper_service::records::{LogicalKey, RecordKind, WriteRecord};
use modelkeeper_service::services::SharedServices;
use modelkeeper_service::store::{PurgeStats, RecordStore, StoreError};
use modelkeeper_service::writer::BatchOutcome;
use modelkeeper_test as test;

use crate::{setup_services, start_services, test_config, text_embedding};

#[derive(Debug, thiserror::Error)]
#[error("model is not loaded")]
struct NotLoaded;

fn embed(text: &str) -> Result<(usize, Vec<WriteRecord>), NotLoaded> {
    Ok((text.len(), vec![text_embedding(text, "model")]))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_compute_once() {
    let env = setup_services(|config| {
        config.locks.retry_count = 100;
        config.locks.retry_delay_min = Duration::from_millis(1);
        config.locks.retry_delay_max = Duration::from_millis(10);
    })
    .await;
    let key = LogicalKey::text_embedding("hello", "model", "mean");
    let computed = Arc::new(AtomicUsize::new(0));

    let requests: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = env.services.coordinator.clone();
            let key = key.clone();
            let computed = computed.clone();
            tokio::spawn(async move {
                let outcome = coordinator
                    .run_exclusive(&key, || async {
                        computed.fetch_add(1, Ordering::SeqCst);
                        embed("hello")
                    })
                    .await
                    .unwrap();
                match outcome {
                    Outcome::Computed { outcome, .. } => Some(outcome),
                    Outcome::AlreadyPersisted => None,
                }
            })
        })
        .collect();

    for request in requests {
        if let Some(outcome) = request.await.unwrap() {
            assert!(matches!(outcome, BatchOutcome::Committed { .. }));
        }
    }

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert_eq!(env.store.text_embeddings("hello", "model").unwrap().len(), 1);

    let outcome = env
        .services
        .coordinator
        .run_exclusive(&key, || async {
            computed.fetch_add(1, Ordering::SeqCst);
            embed("hello")
        })
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::AlreadyPersisted));

    env.services.shutdown().await;
}

#[tokio::test]
async fn test_persisted_key_survives_restart() {
    let env = setup_services(|_| {}).await;
    let key = LogicalKey::text_embedding("hello", "model", "mean");

    let outcome = env
        .services
        .coordinator
        .run_exclusive(&key, || async { embed("hello") })
        .await
        .unwrap();
    let Outcome::Computed { value, outcome } = outcome else {
        panic!("expected a computation");
    };
    assert_eq!(value, 5);
    assert!(matches!(outcome, BatchOutcome::Committed { written: 1, .. }));
    let config = env.services.config.clone();
    env.services.shutdown().await;

    let (services, store) = start_services(config).await;
    let outcome = services
        .coordinator
        .run_exclusive(&key, || async {
            Err::<(usize, Vec<WriteRecord>), _>(NotLoaded)
        })
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::AlreadyPersisted));
    assert_eq!(store.count(RecordKind::TextEmbedding).unwrap(), 1);

    services.shutdown().await;
    drop(env.dir);
}

#[tokio::test]
async fn test_compute_errors_are_surfaced() {
    let env = setup_services(|_| {}).await;
    let key = LogicalKey::text_embedding("hello", "model", "mean");

    let err = env
        .services
        .coordinator
        .run_exclusive(&key, || async {
            Err::<(usize, Vec<WriteRecord>), _>(NotLoaded)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Compute(NotLoaded)));
    assert!(!env.services.index.contains(&key));

    env.services.shutdown().await;
}

/// A store whose key scan always fails.
#[derive(Default)]
struct UnreadableStore {
    scans: AtomicUsize,
    writes: AtomicUsize,
}

impl RecordStore for UnreadableStore {
    fn insert_batch(&self, records: &[WriteRecord]) -> Result<usize, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(records.len())
    }

    fn load_keys(&self) -> Result<Vec<LogicalKey>, StoreError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Fatal(rusqlite::Error::InvalidQuery))
    }

    fn contains_key(&self, _key: &LogicalKey) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn delete_older_than(
        &self,
        _cutoff: DateTime<Utc>,
        _dry_run: bool,
    ) -> Result<PurgeStats, StoreError> {
        Ok(PurgeStats::default())
    }
}

#[tokio::test]
async fn test_startup_fails_without_dedup_index() {
    test::setup();
    let dir = test::tempdir();
    let store = Arc::new(UnreadableStore::default());

    let err = SharedServices::with_store(test_config(&dir), store.clone())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "failed to initialize the dedup index");
    assert!(err.downcast_ref::<StoreError>().is_some());

    // permanent errors are not retried, and nothing was ever handed to a writer
    assert_eq!(store.scans.load(Ordering::SeqCst), 1);
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
}
