//! Redis-backed counter store.
//!
//! The admission script runs server-side as Lua, so the increment, the
//! first-increment expiry and the read happen as one step no matter how many
//! limiter instances share the server. Keys expire through Redis TTLs and are
//! never deleted by the limiter.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{info, trace};

use super::store::{CounterStore, StoreError};

/// Increment, set the expiry when the window opens, return the count.
///
/// KEYS[1] = counter key, ARGV[1] = quota, ARGV[2] = window in seconds.
pub const ADMISSION_SCRIPT: &str = r#"
local count = redis.call('incr', KEYS[1])
if tonumber(count) == 1 then
    redis.call('expire', KEYS[1], ARGV[2])
end
return count
"#;

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/`
    pub url: String,
    /// Prefix prepended to every counter key
    pub key_prefix: String,
    /// Upper bound for any single round trip
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: String::new(),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Counter store shared across processes through Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Connect and verify the server answers a PING.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {}", e)))?;

        let mut connection = with_timeout(config.timeout, ConnectionManager::new(client)).await?;

        let _: String = with_timeout(
            config.timeout,
            redis::cmd("PING").query_async(&mut connection),
        )
        .await?;

        info!(
            url = %config.url,
            key_prefix = %config.key_prefix,
            "Connected to Redis counter store"
        );

        Ok(Self {
            connection,
            script: Script::new(ADMISSION_SCRIPT),
            config,
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn admit(&self, key: &str, quota: u64, window: Duration) -> Result<u64, StoreError> {
        let store_key = store_key(&self.config.key_prefix, key);
        let mut connection = self.connection.clone();

        let mut invocation = self.script.key(&store_key);
        invocation.arg(quota).arg(window.as_secs());

        // EVALSHA, falling back to EVAL when the script is not cached yet.
        let count: i64 =
            with_timeout(self.config.timeout, invocation.invoke_async(&mut connection)).await?;

        trace!(key = %store_key, count, "Ran admission script");

        u64::try_from(count)
            .map_err(|_| StoreError::InvalidResponse(format!("negative count {}", count)))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn store_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
        .map_err(classify)
}

fn classify(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Connection(err.to_string())
    } else if err.kind() == redis::ErrorKind::TypeError {
        StoreError::InvalidResponse(err.to_string())
    } else {
        StoreError::Script(err.to_string())
    }
}
