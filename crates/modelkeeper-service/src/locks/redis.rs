use std::fmt;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::{LockBroker, LockError};

/// Deletes the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A lock broker storing locks as expiring Redis keys.
pub struct RedisBroker {
    client: Client,
    prefix: String,
    conn: OnceCell<MultiplexedConnection>,
    release: Script,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisBroker {
    /// Creates a broker for the given `redis://` URL.
    ///
    /// The connection is established lazily on first use.
    pub fn new(url: &str) -> Result<Self, LockError> {
        Ok(Self {
            client: Client::open(url)?,
            prefix: "modelkeeper:lock:".into(),
            conn: OnceCell::new(),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }

    fn key(&self, resource: &str) -> String {
        format!("{}{resource}", self.prefix)
    }
}

#[async_trait]
impl LockBroker for RedisBroker {
    async fn try_acquire(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(self.key(resource))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .release
            .key(self.key(resource))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}
