use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{LockBroker, LockError};

/// A lock broker living inside this process.
///
/// Locks expire just like on a shared broker, but they only exclude tasks of the same process.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    /// Resource name to owning token and expiry.
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

#[async_trait]
impl LockBroker for MemoryBroker {
    async fn try_acquire(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, expires)) = locks.get(resource) {
            if *expires > now {
                return Ok(false);
            }
        }
        locks.insert(resource.to_owned(), (token.to_owned(), now + ttl));
        Ok(true)
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(resource) {
            Some((owner, _)) if owner == token => {
                locks.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
