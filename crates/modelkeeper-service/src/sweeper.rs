//! Age-based expiry of persisted records.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sentry::{Hub, SentryFutureExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{Config, RetentionConfig};
use crate::metric;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::store::{PurgeStats, RecordStore, SqliteStore, StoreError, run_blocking};

/// Entry function for the cleanup command.
///
/// Runs a single sweep against the configured database.
/// If `dry_run` is `true`, no records will actually be deleted.
pub async fn cleanup(config: &Config, dry_run: bool) -> Result<PurgeStats> {
    let store = SqliteStore::open(&config.database_path).with_context(|| {
        format!(
            "failed to open database `{}`",
            config.database_path.display()
        )
    })?;
    let sweeper = Sweeper::new(Arc::new(store), config.retention, config.writer.into());
    Ok(sweeper.sweep_once(dry_run).await?)
}

/// Periodically deletes records older than the retention threshold.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn RecordStore>,
    config: RetentionConfig,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("config", &self.config)
            .finish()
    }
}

impl Sweeper {
    pub fn new(store: Arc<dyn RecordStore>, config: RetentionConfig, policy: RetryPolicy) -> Self {
        Self {
            store,
            config,
            policy,
        }
    }

    /// Deletes every record whose request time is older than the configured maximum age.
    ///
    /// If `dry_run` is `true`, matching records are only counted.
    pub async fn sweep_once(&self, dry_run: bool) -> Result<PurgeStats, StoreError> {
        let Some(cutoff) = chrono::Duration::from_std(self.config.max_age)
            .ok()
            .and_then(|max_age| Utc::now().checked_sub_signed(max_age))
        else {
            tracing::debug!("Retention age exceeds the representable time range, nothing expires");
            return Ok(PurgeStats::default());
        };

        tracing::info!("Removing records older than {cutoff}");
        let stats = execute_with_retry("sweeper.delete", &self.policy, StoreError::is_transient, || {
            run_blocking(&self.store, move |store| {
                store.delete_older_than(cutoff, dry_run)
            })
        })
        .await?;

        tracing::info!(
            "Removed {} text embeddings, {} document embeddings, {} documents and {} audio transcripts",
            stats.text_embeddings,
            stats.document_embeddings,
            stats.documents,
            stats.audio_transcripts,
        );
        if !dry_run {
            metric!(counter("sweeper.removed") += stats.total() as i64);
        }
        Ok(stats)
    }

    /// Spawns the periodic sweep on the current runtime.
    ///
    /// The first sweep happens one interval after this call. The task stops once `cancel` is
    /// triggered.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).bind_hub(Hub::new_from_top(Hub::current())))
    }

    async fn run(self, cancel: CancellationToken) {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut run = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            run += 1;
            metric!(counter("sweeper.runs") += 1);
            let span = tracing::info_span!("sweep", run);
            if let Err(err) = self.sweep_once(false).instrument(span.clone()).await {
                let _entered = span.enter();
                metric!(counter("sweeper.failed") += 1);
                sentry::with_scope(
                    |scope| scope.set_tag("task", "sweeper"),
                    || {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Failed to remove expired records"
                        )
                    },
                );
            }
        }
        tracing::debug!("Expiry sweeper stopped");
    }
}
