//! Provides the shared modelkeeper services and a way to initialize them.
//!
//! [`SharedServices`] is created once at startup from a [`Config`] and passed by reference into
//! every request path. Initialization seeds the dedup index from the store before the writer
//! starts, so no traffic is served against an incomplete index.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactManager, FastStorage, HttpFetcher};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::dedup::DedupIndex;
use crate::locks::LockManager;
use crate::models::{GpuProbe, ModelCache, ModelLoader, NvidiaSmiProbe};
use crate::retry::RetryPolicy;
use crate::store::{RecordStore, SqliteStore};
use crate::sweeper::Sweeper;
use crate::writer::{WriteQueue, Writer};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SharedServices {
    pub config: Config,
    pub store: Arc<dyn RecordStore>,
    pub index: Arc<DedupIndex>,
    pub queue: WriteQueue,
    pub locks: LockManager,
    pub coordinator: Coordinator,
    pub artifacts: Arc<ArtifactManager>,
    pub gpu: Arc<dyn GpuProbe>,
    writer: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SharedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedServices")
            .field("index", &self.index)
            .field("locks", &self.locks)
            .field("artifacts", &self.artifacts)
            .finish()
    }
}

impl SharedServices {
    /// Opens the store, seeds the dedup index and spawns the background tasks.
    ///
    /// This must be called from within a tokio runtime.
    pub async fn new(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config.database_path).with_context(|| {
            format!(
                "failed to open database `{}`",
                config.database_path.display()
            )
        })?;
        let store: Arc<dyn RecordStore> = Arc::new(store);
        Self::with_store(config, store).await
    }

    /// Like [`new`](Self::new), with an already opened store.
    pub async fn with_store(config: Config, store: Arc<dyn RecordStore>) -> Result<Self> {
        let policy = RetryPolicy::from(config.writer);

        let index = DedupIndex::initialize(&store, &policy)
            .await
            .context("failed to initialize the dedup index")?;
        let index = Arc::new(index);

        let (queue, writer) = Writer::spawn(Arc::clone(&store), Arc::clone(&index), policy);

        let locks =
            LockManager::from_config(&config.locks).context("failed to create lock manager")?;
        let coordinator = Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&index),
            locks.clone(),
            queue.clone(),
            policy,
        );

        let fast_storage = FastStorage::prepare(&config.fast_storage);
        let fetcher = HttpFetcher::new(CONNECT_TIMEOUT).context("failed to create HTTP client")?;
        let artifacts = Arc::new(ArtifactManager::new(
            config.models.clone(),
            fast_storage,
            Arc::new(fetcher),
        ));

        let gpu: Arc<dyn GpuProbe> = Arc::new(NvidiaSmiProbe::new(config.gpu.detect));

        let cancel = CancellationToken::new();
        let sweeper = config.retention.enabled.then(|| {
            Sweeper::new(Arc::clone(&store), config.retention, policy).spawn(cancel.clone())
        });

        Ok(Self {
            config,
            store,
            index,
            queue,
            locks,
            coordinator,
            artifacts,
            gpu,
            writer,
            sweeper,
            cancel,
        })
    }

    /// Creates the model cache on top of the given inference backend.
    ///
    /// Models are searched in fast storage if it is usable. First loads are exclusive across
    /// all processes sharing the lock broker.
    pub fn model_cache(&self, loader: Arc<dyn ModelLoader>) -> ModelCache {
        ModelCache::new(
            self.config.models.clone(),
            self.artifacts.effective_models_dir().to_owned(),
            loader,
            Arc::clone(&self.gpu),
            Some(self.locks.clone()),
        )
    }

    /// Stops the sweeper and waits for the writer to drain the queue.
    ///
    /// The writer only finishes once every clone of [`queue`](Self::queue) and
    /// [`coordinator`](Self::coordinator) handed out has been dropped.
    pub async fn shutdown(self) {
        let Self {
            queue,
            coordinator,
            writer,
            sweeper,
            cancel,
            ..
        } = self;

        cancel.cancel();
        if let Some(sweeper) = sweeper {
            if let Err(err) = sweeper.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Expiry sweeper panicked"
                );
            }
        }

        drop(coordinator);
        drop(queue);
        tracing::info!("Waiting for pending writes");
        if let Err(err) = writer.await {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Write queue writer panicked"
            );
        }
        tracing::info!("Shutdown complete");
    }
}
