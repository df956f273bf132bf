//! Redis store driver.
//!
//! Uses plain `SET` / `EXPIRE` / `EXISTS` / `GET` / `DEL` commands over a
//! multiplexed connection. TTLs are sent in whole seconds, rounded up, never
//! below one second. Bulk writes go out as one atomic pipeline.
//!
//! The connection is established in the background following
//! [`connection::establish`](super::connection::establish). Until it is ready,
//! and while it is being re-established, every command fails fast with
//! [`StoreError::Unavailable`] and [`StoreDriver::state`] reports degraded so
//! the dispatcher bypasses the cache instead of waiting.

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError, RedisResult};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, watch};
use tracing::{trace, warn};

use super::connection::{ConnectionMonitor, ConnectionState, RetryPolicy, establish};
use super::{StoreDriver, StoreError, StoreResult};

struct Inner {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    monitor: ConnectionMonitor,
    policy: RetryPolicy,
}

/// Networked driver backed by a Redis server.
///
/// # Examples
///
/// ```rust,no_run
/// use route_cache::store::RedisDriver;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), route_cache::store::StoreError> {
/// let driver = RedisDriver::connect("redis://127.0.0.1:6379/").await?;
///
/// // Stop serving from cache for good once reconnecting has been given up.
/// let watcher = driver.clone();
/// tokio::spawn(async move {
///     watcher.failed().await;
///     eprintln!("redis unavailable, caching disabled");
/// });
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisDriver {
    inner: Arc<Inner>,
}

impl RedisDriver {
    /// Open a client for `url` and start connecting with the default retry policy.
    ///
    /// Returns as soon as the first attempt is scheduled; the driver reports
    /// [`ConnectionState::Connecting`] until it succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Redis`] if `url` is not a valid Redis URL.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with(url, RetryPolicy::default()).await
    }

    /// Like [`connect`](Self::connect) with an explicit retry policy.
    pub async fn connect_with(url: &str, policy: RetryPolicy) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let driver = Self {
            inner: Arc::new(Inner {
                client,
                connection: RwLock::new(None),
                monitor: ConnectionMonitor::new(),
                policy,
            }),
        };
        driver.spawn_connect();
        Ok(driver)
    }

    /// Subscribe to connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.monitor.subscribe()
    }

    /// Resolves once the driver has given up reconnecting.
    pub async fn failed(&self) {
        self.inner.monitor.failed().await
    }

    fn spawn_connect(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            *inner.connection.write().await = None;

            // The connection is installed before `establish` publishes Ready.
            let result = establish("redis", inner.policy, &inner.monitor, || {
                let inner = Arc::clone(&inner);
                async move {
                    let connection = inner.client.get_multiplexed_async_connection().await?;
                    *inner.connection.write().await = Some(connection);
                    Ok::<(), RedisError>(())
                }
            })
            .await;

            if let Err(e) = result {
                warn!(error = %e, "redis store disabled");
            }
        });
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        let state = self.inner.monitor.state();
        if state != ConnectionState::Ready {
            return Err(StoreError::Unavailable { state });
        }
        self.inner
            .connection
            .read()
            .await
            .clone()
            .ok_or(StoreError::Unavailable {
                state: ConnectionState::Degraded,
            })
    }

    // Map a command result, starting a reconnect cycle when the link broke.
    fn check<T>(&self, result: RedisResult<T>) -> StoreResult<T> {
        result.map_err(|e| {
            if (e.is_io_error() || e.is_connection_dropped()) && self.inner.monitor.mark_lost() {
                warn!(error = %e, "redis connection lost, reconnecting");
                self.spawn_connect();
            }
            StoreError::from(e)
        })
    }
}

/// Seconds sent with `EXPIRE`.
fn expire_seconds(ttl: Duration) -> u64 {
    let seconds = ttl.as_millis().div_ceil(1_000).max(1);
    u64::try_from(seconds).unwrap_or(u64::MAX)
}

#[async_trait]
impl StoreDriver for RedisDriver {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut con = self.connection().await?;
        let found: i64 = self.check(
            ::redis::cmd("EXISTS")
                .arg(key)
                .query_async(&mut con)
                .await,
        )?;
        Ok(found > 0)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let mut con = self.connection().await?;
        let value: Option<Vec<u8>> =
            self.check(::redis::cmd("GET").arg(key).query_async(&mut con).await)?;
        Ok(value.map(Bytes::from))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()> {
        self.put_many(vec![(key.to_owned(), value)], ttl).await
    }

    async fn put_many(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> StoreResult<()> {
        let mut con = self.connection().await?;
        let seconds = expire_seconds(ttl);

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (key, value) in &entries {
            trace!(key = %key, seconds, "redis set");
            pipe.cmd("SET").arg(key).arg(value.as_ref()).ignore();
            pipe.cmd("EXPIRE").arg(key).arg(seconds).ignore();
        }

        self.check(pipe.query_async::<()>(&mut con).await)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut con = self.connection().await?;
        let _deleted: i64 = self.check(::redis::cmd("DEL").arg(key).query_async(&mut con).await)?;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.inner.monitor.state()
    }
}
