//! Expiration policy: resolve a route's TTL descriptor into a caching decision
//! and a concrete TTL for the cache key.
//!
//! The policy owns two tables shared with the rest of the engine:
//!
//! - call counters, key → number of adaptive evaluations since the last reset.
//!   The whole table is cleared on a fixed interval by [`spawn_counter_reset`].
//! - the effective TTL table ([`TtlTable`]), key → TTL last assigned. The store
//!   reads it when writing an entry. Counter resets leave it untouched.
//!
//! Adaptive keys step through a threshold table. The first call assigns the TTL
//! of the smallest threshold; afterwards the TTL only changes when the call count
//! lands exactly on a threshold, so with the default table calls 1..=5 resolve to
//! 1000, 1000, 2000, 2000, 2000 ms.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::route::TtlDescriptor;

/// Interval at which adaptive call counters are cleared.
pub const COUNTER_RESET_INTERVAL: Duration = Duration::from_millis(60_000);

/// Key → TTL in milliseconds, as last resolved by the policy.
#[derive(Debug, Default)]
pub struct TtlTable {
    entries: DashMap<String, u64>,
}

impl TtlTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|ttl| *ttl)
    }

    pub fn set(&self, key: &str, millis: u64) {
        self.entries.insert(key.to_owned(), millis);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of evaluating a route's policy for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the store alone and go straight to the origin.
    Bypass,
    /// Cache; the TTL table holds `ttl_ms` for the key, or the default applies.
    Cache { ttl_ms: u64 },
}

impl Decision {
    pub fn is_cacheable(self) -> bool {
        matches!(self, Decision::Cache { .. })
    }
}

/// Per-engine expiration state and rules.
#[derive(Debug)]
pub struct ExpirationPolicy {
    default_ttl_ms: u64,
    steps: BTreeMap<u64, u64>,
    counters: DashMap<String, u64>,
    ttls: Arc<TtlTable>,
}

impl ExpirationPolicy {
    /// Create a policy writing into `ttls`.
    ///
    /// `steps` maps call-count thresholds to TTLs in milliseconds.
    pub fn new(default_ttl_ms: u64, steps: BTreeMap<u64, u64>, ttls: Arc<TtlTable>) -> Self {
        Self {
            default_ttl_ms,
            steps,
            counters: DashMap::new(),
            ttls,
        }
    }

    pub fn default_ttl_ms(&self) -> u64 {
        self.default_ttl_ms
    }

    pub fn ttl_table(&self) -> &Arc<TtlTable> {
        &self.ttls
    }

    /// Current call count for `key`, if it was evaluated since the last reset.
    pub fn call_count(&self, key: &str) -> Option<u64> {
        self.counters.get(key).map(|count| *count)
    }

    /// Resolve `descriptor` for `key`, recording the TTL the store must apply.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use route_cache::config::DEFAULT_STEPS;
    /// use route_cache::policy::{Decision, ExpirationPolicy, TtlTable};
    /// use route_cache::route::TtlDescriptor;
    ///
    /// let ttls = Arc::new(TtlTable::new());
    /// let policy = ExpirationPolicy::new(5000, DEFAULT_STEPS.into_iter().collect(), ttls.clone());
    ///
    /// assert_eq!(policy.evaluate(TtlDescriptor::Disabled, "/a"), Decision::Bypass);
    /// assert_eq!(policy.evaluate(TtlDescriptor::Fixed(250), "/a"), Decision::Cache { ttl_ms: 250 });
    /// assert_eq!(ttls.get("/a"), Some(250));
    /// ```
    pub fn evaluate(&self, descriptor: TtlDescriptor, key: &str) -> Decision {
        let ttl_ms = match descriptor {
            TtlDescriptor::Disabled => return Decision::Bypass,
            TtlDescriptor::UseDefault => {
                self.ttls.set(key, self.default_ttl_ms);
                self.default_ttl_ms
            }
            TtlDescriptor::Fixed(ms) => {
                self.ttls.set(key, ms);
                ms
            }
            TtlDescriptor::Adaptive => self.evaluate_adaptive(key),
        };

        Decision::Cache { ttl_ms }
    }

    fn evaluate_adaptive(&self, key: &str) -> u64 {
        // The entry guard holds the shard lock, so concurrent calls for one key
        // never lose an increment.
        let count = match self.counters.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += 1;
                Some(*entry.get())
            }
            Entry::Vacant(entry) => {
                entry.insert(1);
                None
            }
        };

        match count {
            None => {
                if let Some((_, ttl)) = self.steps.first_key_value() {
                    self.ttls.set(key, *ttl);
                }
            }
            Some(count) => {
                if let Some(ttl) = self.steps.get(&count) {
                    debug!(key = %key, count, ttl_ms = *ttl, "adaptive step reached");
                    self.ttls.set(key, *ttl);
                }
            }
        }

        self.ttls.get(key).unwrap_or(self.default_ttl_ms)
    }

    /// Clear every call counter. TTLs already assigned are kept.
    pub fn reset_counters(&self) {
        self.counters.clear();
    }
}

/// Spawn the task that clears `policy`'s call counters every `every`.
///
/// The first reset happens one full interval after the call. The task runs until
/// the returned handle is aborted.
pub fn spawn_counter_reset(policy: Arc<ExpirationPolicy>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            debug!("clearing adaptive call counters");
            policy.reset_counters();
        }
    })
}
