//! Cross-process mutual exclusion over named resources.
//!
//! A [`LockManager`] acquires locks from a [`LockBroker`]. Every lock carries a random token and
//! expires on the broker after the configured validity, so a crashed holder never blocks other
//! processes forever, and a holder can only release a lock it still owns.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::metric;

mod memory;
mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock could not be acquired within the acquisition timeout or retry budget.
    #[error("timed out acquiring lock for `{0}`")]
    Timeout(String),
    #[error("lock broker failed")]
    Broker(#[from] ::redis::RedisError),
}

/// The shared authority deciding who holds a lock.
#[async_trait]
pub trait LockBroker: Send + Sync + 'static {
    /// Atomically takes the lock for `resource` if it is free or expired.
    ///
    /// Returns `false` if somebody else holds the lock.
    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Releases the lock for `resource` if, and only if, it is still held with `token`.
    async fn release(&self, resource: &str, token: &str) -> Result<bool, LockError>;
}

/// How a single acquisition is attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Bounds the whole acquisition, and is the validity of the lock once held.
    pub timeout: Duration,
    /// Retries after the first failed attempt.
    pub retry_count: u32,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
}

impl From<&LockConfig> for AcquireOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            timeout: config.lock_timeout,
            retry_count: config.retry_count,
            retry_delay_min: config.retry_delay_min,
            retry_delay_max: config.retry_delay_max,
        }
    }
}

impl AcquireOptions {
    /// Picks a uniformly random delay from the configured range.
    fn retry_delay(&self) -> Duration {
        let min = self.retry_delay_min.as_millis() as u64;
        let max = (self.retry_delay_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// A held lock.
///
/// Release it with [`LockManager::release`]. Dropping an unreleased handle schedules a
/// best-effort release on the current runtime.
pub struct LockHandle {
    resource: String,
    token: String,
    validity: Duration,
    broker: Option<Arc<dyn LockBroker>>,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("token", &self.token)
            .field("validity", &self.validity)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let Some(broker) = self.broker.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                resource = %self.resource,
                "Lock dropped outside of a runtime, it will expire on its own"
            );
            return;
        };
        let resource = std::mem::take(&mut self.resource);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(err) = broker.release(&resource, &token).await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    resource = %resource,
                    "Failed to release dropped lock"
                );
            }
        });
    }
}

/// Acquires and releases named locks from a [`LockBroker`].
#[derive(Clone)]
pub struct LockManager {
    broker: Arc<dyn LockBroker>,
    options: AcquireOptions,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("options", &self.options)
            .finish()
    }
}

impl LockManager {
    pub fn new(broker: Arc<dyn LockBroker>, options: AcquireOptions) -> Self {
        Self { broker, options }
    }

    /// Uses Redis if a `redis_url` is configured, otherwise locks only exclude within this
    /// process.
    pub fn from_config(config: &LockConfig) -> Result<Self, LockError> {
        let broker: Arc<dyn LockBroker> = match config.redis_url {
            Some(ref url) => {
                tracing::info!("Using Redis lock broker at {url}");
                Arc::new(RedisBroker::new(url)?)
            }
            None => {
                tracing::info!("No lock broker configured, using in-process locks");
                Arc::new(MemoryBroker::default())
            }
        };
        Ok(Self::new(broker, config.into()))
    }

    /// Acquires the lock for `resource` using the configured options.
    pub async fn acquire(&self, resource: &str) -> Result<LockHandle, LockError> {
        self.acquire_with(resource, self.options).await
    }

    /// Acquires the lock for `resource`, trying `1 + retry_count` times.
    ///
    /// Fails with [`LockError::Timeout`] if all attempts fail or `timeout` elapses first.
    #[tracing::instrument(skip(self, options))]
    pub async fn acquire_with(
        &self,
        resource: &str,
        options: AcquireOptions,
    ) -> Result<LockHandle, LockError> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();

        let attempts = async {
            for attempt in 0..=options.retry_count {
                if attempt > 0 {
                    tokio::time::sleep(options.retry_delay()).await;
                }
                if self
                    .broker
                    .try_acquire(resource, &token, options.timeout)
                    .await?
                {
                    return Ok(true);
                }
                tracing::trace!(attempt, "Lock is held elsewhere");
            }
            Ok::<_, LockError>(false)
        };

        let acquired = tokio::time::timeout(options.timeout, attempts)
            .await
            .unwrap_or(Ok(false))?;
        metric!(timer("locks.acquire.duration") = started.elapsed());

        if !acquired {
            metric!(counter("locks.acquire") += 1, "status" => "timeout");
            return Err(LockError::Timeout(resource.to_owned()));
        }
        metric!(counter("locks.acquire") += 1, "status" => "ok");
        Ok(LockHandle {
            resource: resource.to_owned(),
            token,
            validity: options.timeout,
            broker: Some(Arc::clone(&self.broker)),
        })
    }

    /// Releases a held lock.
    ///
    /// Releasing a lock that already expired on the broker is not an error.
    pub async fn release(&self, mut handle: LockHandle) -> Result<(), LockError> {
        let Some(broker) = handle.broker.take() else {
            return Ok(());
        };
        let released = broker.release(&handle.resource, &handle.token).await?;
        if !released {
            tracing::warn!(
                resource = %handle.resource,
                "Lock expired before it was released"
            );
            metric!(counter("locks.release.expired") += 1);
        }
        Ok(())
    }

    /// Runs `future` while holding the lock for `resource`.
    ///
    /// The lock is released after the future completes, whatever its result. Release failures
    /// are logged, the lock then expires on its own.
    pub async fn with_lock<F, T>(&self, resource: &str, future: F) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        let handle = self.acquire(resource).await?;
        let output = future.await;
        if let Err(err) = self.release(handle).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                resource,
                "Failed to release lock"
            );
        }
        Ok(output)
    }
}
