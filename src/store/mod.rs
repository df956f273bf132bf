//! Storage layer: pluggable key-value drivers behind a TTL-resolving facade.
//!
//! ## Core types
//!
//! - [`StoreDriver`]: the contract every backend implements: existence check,
//!   get, put with an explicit TTL, bulk put, delete, and a connection state.
//! - [`Store`]: what the dispatcher talks to. It resolves the TTL of every
//!   write from the shared [`TtlTable`], falling back to the default TTL.
//! - [`MemoryDriver`]: in-process map with lazy expiry.
//! - [`RedisDriver`]: networked driver with an explicit reconnect state machine
//!   (see [`connection`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::policy::TtlTable;

pub mod connection;
pub mod memory;
pub mod redis;

pub use connection::{ConnectionMonitor, ConnectionState, RetryPolicy};
pub use memory::MemoryDriver;
pub use redis::RedisDriver;

/// Errors produced by store drivers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store is unavailable ({state})")]
    Unavailable { state: ConnectionState },

    #[error("gave up connecting after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The contract implemented by every storage backend.
///
/// Implementations must be safe to share across Tokio tasks. TTLs are always
/// explicit at this level; [`Store`] decides them.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns `true` if `key` holds a live value. No side effects.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()>;

    /// Write several keys sharing one TTL.
    async fn put_many(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> StoreResult<()> {
        for (key, value) in entries {
            self.put(&key, value, ttl).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Connection state; drivers without a connection are always ready.
    fn state(&self) -> ConnectionState {
        ConnectionState::Ready
    }

    /// Drop expired entries the driver keeps itself, returning how many went.
    /// Drivers whose server expires keys on its own keep the default.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Interval at which [`spawn_purge`] sweeps expired entries.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the task that calls [`Store::purge_expired`] every `every`.
///
/// The first sweep happens one full interval after the call. The task runs until
/// the returned handle is aborted.
pub fn spawn_purge(store: Store, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(store = store.driver.name(), purged, "purged expired entries");
            }
        }
    })
}

/// Facade over a driver that applies TTLs from the effective TTL table.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use route_cache::policy::TtlTable;
/// use route_cache::store::{MemoryDriver, Store};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), route_cache::store::StoreError> {
/// let ttls = Arc::new(TtlTable::new());
/// ttls.set("/a", 250);
/// let store = Store::new(Arc::new(MemoryDriver::new()), ttls, 5000);
///
/// store.set("/a", Bytes::from_static(b"hello")).await?;
/// assert_eq!(store.get("/a").await?, Some(Bytes::from_static(b"hello")));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    driver: Arc<dyn StoreDriver>,
    ttls: Arc<TtlTable>,
    default_ttl_ms: u64,
}

impl Store {
    pub fn new(driver: Arc<dyn StoreDriver>, ttls: Arc<TtlTable>, default_ttl_ms: u64) -> Self {
        Self {
            driver,
            ttls,
            default_ttl_ms,
        }
    }

    /// TTL the store applies to writes keyed by `key`.
    pub fn resolve_ttl(&self, key: &str) -> Duration {
        Duration::from_millis(self.ttls.get(key).unwrap_or(self.default_ttl_ms))
    }

    pub async fn has(&self, key: &str) -> StoreResult<bool> {
        self.driver.exists(key).await
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.driver.get(key).await
    }

    /// Write `value` under `key` with the TTL resolved for `key`.
    pub async fn set(&self, key: &str, value: Bytes) -> StoreResult<()> {
        let ttl = self.resolve_ttl(key);
        trace!(store = self.driver.name(), key = %key, ?ttl, "set");
        self.driver.put(key, value, ttl).await
    }

    /// Write related keys with one TTL resolved for `base_key`.
    pub async fn set_multiple(
        &self,
        base_key: &str,
        entries: Vec<(String, Bytes)>,
    ) -> StoreResult<()> {
        let ttl = self.resolve_ttl(base_key);
        trace!(store = self.driver.name(), key = %base_key, ?ttl, count = entries.len(), "set multiple");
        self.driver.put_many(entries, ttl).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.driver.delete(key).await
    }

    pub fn state(&self) -> ConnectionState {
        self.driver.state()
    }

    pub fn purge_expired(&self) -> usize {
        self.driver.purge_expired()
    }

    /// `true` while the driver cannot serve requests; callers should bypass.
    pub fn is_degraded(&self) -> bool {
        self.state().is_degraded()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("driver", &self.driver.name())
            .field("state", &self.state())
            .field("default_ttl_ms", &self.default_ttl_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttls: Arc<TtlTable>) -> (Store, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        (Store::new(driver.clone(), ttls, 5_000), driver)
    }

    #[test]
    fn ttl_comes_from_table_or_default() {
        let ttls = Arc::new(TtlTable::new());
        ttls.set("/a", 1_500);
        let (store, _) = store(ttls);
        assert_eq!(store.resolve_ttl("/a"), Duration::from_millis(1_500));
        assert_eq!(store.resolve_ttl("/b"), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn set_applies_resolved_ttl() {
        let ttls = Arc::new(TtlTable::new());
        ttls.set("/a", 1_000);
        let (store, _) = store(ttls);

        store.set("/a", Bytes::from_static(b"v")).await.unwrap();
        assert!(store.has("/a").await.unwrap());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(!store.has("/a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_multiple_shares_base_key_ttl() {
        let ttls = Arc::new(TtlTable::new());
        ttls.set("/a", 2_000);
        let (store, _) = store(ttls);

        store
            .set_multiple(
                "/a",
                vec![
                    ("/a:headers".into(), Bytes::from_static(b"{}")),
                    ("/a:body".into(), Bytes::from_static(b"x")),
                ],
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert!(store.has("/a:headers").await.unwrap());
        assert!(store.has("/a:body").await.unwrap());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!store.has("/a:headers").await.unwrap());
        assert!(!store.has("/a:body").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_value() {
        let (store, driver) = store(Arc::new(TtlTable::new()));
        store.set("/a", Bytes::from_static(b"v")).await.unwrap();
        store.delete("/a").await.unwrap();
        assert_eq!(store.get("/a").await.unwrap(), None);
        assert!(driver.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_task_reclaims_unread_entries() {
        let ttls = Arc::new(TtlTable::new());
        let (store, driver) = store(Arc::clone(&ttls));
        for i in 0..1_000 {
            let key = format!("/a/{i}");
            ttls.set(&key, 10);
            store.set(&key, Bytes::from_static(b"v")).await.unwrap();
        }
        assert_eq!(driver.len(), 1_000);

        let task = spawn_purge(store.clone(), PURGE_INTERVAL);
        tokio::time::sleep(PURGE_INTERVAL + Duration::from_millis(1)).await;

        assert!(driver.is_empty());
        task.abort();
    }

    #[test]
    fn memory_store_is_never_degraded() {
        let (store, _) = store(Arc::new(TtlTable::new()));
        assert_eq!(store.state(), ConnectionState::Ready);
        assert!(!store.is_degraded());
    }
}
