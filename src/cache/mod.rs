//! Request dispatcher. Serves a request from the store when it can, otherwise
//! calls the origin and records what it returns.
//!
//! ```text
//! match route ─none─▶ passthrough
//!     │
//! build key ─▶ evaluate policy ─disabled─▶ passthrough
//!     │
//! Cache-Control: no-cache ─▶ passthrough
//!     │
//! non-GET ─▶ delete key:headers + key:body ─▶ origin (invalidated)
//!     │
//! store degraded ─▶ passthrough
//!     │
//! lookup ─hit─▶ replay stored response
//!     │
//!    miss ─▶ origin ─▶ capture ─▶ set_multiple
//! ```
//!
//! Store failures never fail a request. A lookup error is a miss and a write
//! error only loses the entry. Errors from the origin are returned untouched
//! and nothing is written for them.
//!
//! [`CacheEngine`] is the dispatcher. [`CacheMiddleware`] mounts it in a
//! [`Pipeline`](crate::middleware::Pipeline).

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::context::Context;
use crate::http::{Request, Response};
use crate::key::{body_key, build_key, headers_key};
use crate::middleware::{BoxResponse, Middleware, MiddlewareHandler, Next, from_middleware};
use crate::policy::{COUNTER_RESET_INTERVAL, ExpirationPolicy, TtlTable, spawn_counter_reset};
use crate::route::RouteTable;
use crate::store::{PURGE_INTERVAL, Store, StoreDriver, spawn_purge};

pub mod entry;

pub use entry::{EntryError, ResponseRecord};

/// How a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// Served from the store; the origin was not called.
    Hit,
    /// Origin called and its response recorded.
    Miss,
    /// Origin called; the store was not consulted.
    Passthrough,
    /// Mutating request: stored entry deleted, then origin called.
    Invalidated,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Passthrough => "passthrough",
            Self::Invalidated => "invalidated",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response together with how it was obtained.
#[derive(Debug)]
pub struct Served {
    pub response: Response,
    pub status: CacheStatus,
    /// Cache key derived for the request; `None` when no route matched.
    pub key: Option<String>,
}

/// Route-driven response cache in front of an origin.
///
/// Owns the compiled route table, the expiration policy with its counters, and
/// the store. A background task sweeps expired store entries every
/// [`PURGE_INTERVAL`]. When any route is adaptive, another clears the call
/// counters every [`COUNTER_RESET_INTERVAL`]. Both stop when the engine is
/// dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use std::convert::Infallible;
/// use std::sync::Arc;
/// use route_cache::{CacheConfig, CacheEngine, Request, Response, StatusCode};
/// use route_cache::store::MemoryDriver;
///
/// # #[tokio::main]
/// # async fn main() {
/// let config = CacheConfig::default().route("/users/:id", 30_000);
/// let engine = CacheEngine::new(&config, Arc::new(MemoryDriver::new()));
///
/// let (request, _) = Request::parse(b"GET /users/7 HTTP/1.1\r\n\r\n").unwrap();
/// let served = engine
///     .serve(request, |_req| async {
///         Ok::<_, Infallible>(Response::new(StatusCode::Ok).body("user 7"))
///     })
///     .await
///     .unwrap();
/// println!("{} {}", served.status, served.response.status());
/// # }
/// ```
pub struct CacheEngine {
    routes: RouteTable,
    policy: Arc<ExpirationPolicy>,
    store: Store,
    debug: bool,
    // Background sweeps, aborted on drop.
    tasks: Vec<JoinHandle<()>>,
}

impl CacheEngine {
    /// Compile `config` and put the engine in front of `driver`.
    ///
    /// Invalid route entries and adaptive steps are dropped with a warning. The
    /// background sweeps need a Tokio runtime; without one the engine still
    /// works but nothing is swept.
    pub fn new(config: &CacheConfig, driver: Arc<dyn StoreDriver>) -> Self {
        let routes = RouteTable::compile(config.routes());
        let ttls = Arc::new(TtlTable::new());
        let policy = Arc::new(ExpirationPolicy::new(
            config.default_timeout(),
            config.step_table(),
            Arc::clone(&ttls),
        ));
        let store = Store::new(driver, ttls, config.default_timeout());

        let mut tasks = Vec::new();
        if Handle::try_current().is_ok() {
            tasks.push(spawn_purge(store.clone(), PURGE_INTERVAL));
            if routes.has_adaptive() {
                tasks.push(spawn_counter_reset(
                    Arc::clone(&policy),
                    COUNTER_RESET_INTERVAL,
                ));
            }
        } else {
            warn!("no tokio runtime, expired entries and adaptive counters will not be swept");
        }

        debug!(routes = routes.len(), store = ?store, "cache engine ready");

        Self {
            routes,
            policy,
            store,
            debug: config.debug(),
            tasks,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn policy(&self) -> &Arc<ExpirationPolicy> {
        &self.policy
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Handle one request, calling `origin` when the response cannot come from
    /// the store.
    ///
    /// # Errors
    ///
    /// Only errors returned by `origin` are propagated. Nothing is stored for them.
    pub async fn serve<F, Fut, E>(&self, request: Request, origin: F) -> Result<Served, E>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, E>>,
    {
        let Some(route) = self.routes.find(request.path()) else {
            return Ok(Served {
                response: origin(request).await?,
                status: CacheStatus::Passthrough,
                key: None,
            });
        };

        let key = build_key(&request, route.key_augmentation());
        let decision = self.policy.evaluate(route.ttl(), &key);
        if self.debug {
            debug!(route = route.pattern(), key = %key, ?decision, "route matched");
        }

        let status = if !decision.is_cacheable() || forbids_cache(&request) {
            CacheStatus::Passthrough
        } else if request.method().is_mutating() {
            self.invalidate(&key).await;
            CacheStatus::Invalidated
        } else if self.store.is_degraded() {
            if self.debug {
                debug!(key = %key, state = %self.store.state(), "store degraded, bypassing");
            }
            CacheStatus::Passthrough
        } else {
            if let Some(response) = self.lookup(&key).await {
                self.trace(&key, CacheStatus::Hit);
                return Ok(Served {
                    response,
                    status: CacheStatus::Hit,
                    key: Some(key),
                });
            }

            let response = origin(request).await?;
            self.record(&key, &response).await;
            self.trace(&key, CacheStatus::Miss);
            return Ok(Served {
                response,
                status: CacheStatus::Miss,
                key: Some(key),
            });
        };

        self.trace(&key, status);
        Ok(Served {
            response: origin(request).await?,
            status,
            key: Some(key),
        })
    }

    async fn invalidate(&self, key: &str) {
        if self.store.is_degraded() {
            warn!(key = %key, state = %self.store.state(), "store degraded, entry not invalidated");
            return;
        }
        for record in [headers_key(key), body_key(key)] {
            if let Err(e) = self.store.delete(&record).await {
                warn!(key = %record, error = %e, "cache invalidation failed");
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<Response> {
        let headers = headers_key(key);
        let raw = match self.store.has(&headers).await {
            Ok(true) => self.store.get(&headers).await,
            Ok(false) => return None,
            Err(e) => Err(e),
        };
        let raw = match raw {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                return None;
            }
        };

        let record = match ResponseRecord::decode(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, error = %e, "discarding unreadable cache entry");
                return None;
            }
        };

        let body = if record.body {
            match self.store.get(&body_key(key)).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                    return None;
                }
            }
        } else {
            None
        };

        match record.replay(body) {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(key = %key, error = %e, "incomplete cache entry");
                None
            }
        }
    }

    async fn record(&self, key: &str, response: &Response) {
        let (record, body) = ResponseRecord::capture(response);
        let encoded = match record.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "response not cached");
                return;
            }
        };

        let mut entries: Vec<(String, Bytes)> = vec![(headers_key(key), encoded)];
        if let Some(body) = body {
            entries.push((body_key(key), body));
        }

        if let Err(e) = self.store.set_multiple(key, entries).await {
            warn!(key = %key, error = %e, "response not cached");
        }
    }

    fn trace(&self, key: &str, status: CacheStatus) {
        if self.debug {
            debug!(key = %key, %status, ttl = ?self.store.resolve_ttl(key), "cache decision");
        }
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("routes", &self.routes.len())
            .field("store", &self.store)
            .field("debug", &self.debug)
            .finish()
    }
}

// `Cache-Control: no-cache` on the request.
fn forbids_cache(request: &Request) -> bool {
    request
        .headers()
        .get_all("cache-control")
        .flat_map(|value| value.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"))
}

/// Mounts a [`CacheEngine`] in a middleware pipeline.
///
/// The layers and origin behind it only run on a miss, a passthrough, or an
/// invalidation. Request extensions set by earlier layers are handed on.
#[derive(Clone)]
pub struct CacheMiddleware {
    engine: Arc<CacheEngine>,
}

impl CacheMiddleware {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    pub fn into_handler(self) -> MiddlewareHandler {
        from_middleware(Arc::new(self))
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let engine = Arc::clone(&self.engine);
        Box::pin(async move {
            let (request, extensions) = ctx.into_parts();
            let served = engine
                .serve(request, move |request| async move {
                    Ok::<_, Infallible>(next.run(Context::from_parts(request, extensions)).await)
                })
                .await;
            match served {
                Ok(served) => served.response,
                Err(never) => match never {},
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::StatusCode;
    use crate::middleware::Pipeline;
    use crate::store::{ConnectionState, MemoryDriver, StoreError, StoreResult};

    /// Counts every call that reaches the driver.
    #[derive(Default)]
    struct Spy {
        inner: MemoryDriver,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StoreDriver for Spy {
        fn name(&self) -> &'static str {
            "spy"
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.exists(key).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key).await
        }
    }

    /// Fails every command while reporting `state`.
    struct Broken {
        state: ConnectionState,
    }

    #[async_trait]
    impl StoreDriver for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn exists(&self, _key: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable { state: self.state })
        }

        async fn get(&self, _key: &str) -> StoreResult<Option<Bytes>> {
            Err(StoreError::Unavailable { state: self.state })
        }

        async fn put(&self, _key: &str, _value: Bytes, _ttl: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable { state: self.state })
        }

        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable { state: self.state })
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn get(path: &str) -> Request {
        request(&format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n"))
    }

    async fn serve(engine: &CacheEngine, calls: &AtomicUsize, request: Request) -> Served {
        engine
            .serve(request, |req| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, Infallible>(
                    Response::new(StatusCode::Ok)
                        .header("Content-Type", "text/plain")
                        .header("X-Path", req.path())
                        .body(format!("response {n}")),
                )
            })
            .await
            .unwrap()
    }

    fn memory_engine(config: &CacheConfig) -> (CacheEngine, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        (CacheEngine::new(config, driver.clone()), driver)
    }

    #[tokio::test]
    async fn unmatched_path_passes_through() {
        let config = CacheConfig::default().route("/a", 1_000);
        let (engine, driver) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        let served = serve(&engine, &calls, get("/b")).await;

        assert_eq!(served.status, CacheStatus::Passthrough);
        assert_eq!(served.key, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn exact_route_wins_over_earlier_pattern() {
        let config = CacheConfig::default()
            .route("/users/*", false)
            .route("/users/me", 1_000);
        let (engine, _) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        assert_eq!(serve(&engine, &calls, get("/users/me")).await.status, CacheStatus::Miss);
        assert_eq!(serve(&engine, &calls, get("/users/me")).await.status, CacheStatus::Hit);
        assert_eq!(
            serve(&engine, &calls, get("/users/you")).await.status,
            CacheStatus::Passthrough
        );
    }

    #[tokio::test]
    async fn disabled_route_never_touches_store() {
        let config = CacheConfig::default().route("/a", false);
        let driver = Arc::new(Spy::default());
        let engine = CacheEngine::new(&config, driver.clone());
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let served = serve(&engine, &calls, get("/a")).await;
            assert_eq!(served.status, CacheStatus::Passthrough);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
        assert!(driver.inner.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_ttl_hit_is_identical_until_expiry() {
        let config = CacheConfig::default().route("/a", 1_000);
        let (engine, driver) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        let first = serve(&engine, &calls, get("/a")).await;
        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(driver.ttl("/a:headers"), Some(Duration::from_millis(1_000)));
        assert_eq!(driver.ttl("/a:body"), Some(Duration::from_millis(1_000)));

        tokio::time::advance(Duration::from_millis(999)).await;
        let second = serve(&engine, &calls, get("/a")).await;
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.response.status(), first.response.status());
        assert_eq!(second.response.message(), first.response.message());
        assert_eq!(second.response.headers(), first.response.headers());
        assert_eq!(second.response.payload(), first.response.payload());

        tokio::time::advance(Duration::from_millis(1)).await;
        let third = serve(&engine, &calls, get("/a")).await;
        assert_eq!(third.status, CacheStatus::Miss);
        assert_eq!(third.response.payload().as_ref(), b"response 2");
    }

    #[tokio::test]
    async fn default_timeout_applies_to_true_routes() {
        let config = CacheConfig::default()
            .with_default_timeout(2_500)
            .route("/a", true);
        let (engine, _) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        serve(&engine, &calls, get("/a")).await;
        assert_eq!(engine.policy().ttl_table().get("/a"), Some(2_500));
        assert_eq!(engine.store().resolve_ttl("/a"), Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn adaptive_ttl_steps_with_call_count() {
        let config = CacheConfig::default().route("/a", "increasing");
        let (engine, _) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        let mut ttls = Vec::new();
        for _ in 0..5 {
            serve(&engine, &calls, get("/a")).await;
            ttls.push(engine.policy().ttl_table().get("/a").unwrap());
        }

        assert_eq!(ttls, vec![1_000, 1_000, 2_000, 2_000, 2_000]);
        assert_eq!(engine.policy().call_count("/a"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_counters_reset_each_interval() {
        let config = CacheConfig::default().route("/a", json!({"timeout": "increasing"}));
        let (engine, _) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            serve(&engine, &calls, get("/a")).await;
        }
        assert_eq!(engine.policy().call_count("/a"), Some(3));

        tokio::time::sleep(COUNTER_RESET_INTERVAL + Duration::from_millis(1)).await;

        assert_eq!(engine.policy().call_count("/a"), None);
        assert_eq!(engine.policy().ttl_table().get("/a"), Some(2_000));
    }

    #[tokio::test]
    async fn mutating_request_invalidates_and_never_reads() {
        let config = CacheConfig::default().route("/a", 10_000);
        let (engine, driver) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        assert_eq!(serve(&engine, &calls, get("/a")).await.status, CacheStatus::Miss);
        assert_eq!(driver.len(), 2);

        for _ in 0..2 {
            let served = serve(&engine, &calls, request("POST /a HTTP/1.1\r\n\r\n")).await;
            assert_eq!(served.status, CacheStatus::Invalidated);
        }
        assert!(driver.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(serve(&engine, &calls, get("/a")).await.status, CacheStatus::Miss);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn no_cache_header_bypasses_store() {
        let config = CacheConfig::default().route("/a", 10_000);
        let (engine, driver) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        let raw = "GET /a HTTP/1.1\r\nCache-Control: max-age=0, No-Cache\r\n\r\n";
        let served = serve(&engine, &calls, request(raw)).await;

        assert_eq!(served.status, CacheStatus::Passthrough);
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn augmented_key_reaches_store() {
        let config = CacheConfig::default().route(
            "/a",
            json!({"timeout": 1_000, "cacheKeyArgs": {"headers": ["h1"], "query": true}}),
        );
        let (engine, driver) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        let raw = "GET /a?x=1&y=2 HTTP/1.1\r\nh1: foo\r\n\r\n";
        let served = serve(&engine, &calls, request(raw)).await;

        assert_eq!(served.key.as_deref(), Some("/a#foo?x=1&y=2"));
        assert!(driver.exists("/a#foo?x=1&y=2:headers").await.unwrap());

        let other = "GET /a?x=1&y=2 HTTP/1.1\r\nh1: bar\r\n\r\n";
        assert_eq!(serve(&engine, &calls, request(other)).await.status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn repeated_query_values_key_separately() {
        let config = CacheConfig::default().route(
            "/a",
            json!({"timeout": 10_000, "cacheKeyArgs": {"query": ["x"]}}),
        );
        let (engine, _) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        let first = serve(&engine, &calls, get("/a?x=1&x=3")).await;
        let second = serve(&engine, &calls, get("/a?x=2&x=3")).await;

        assert_eq!(first.key.as_deref(), Some("/a?1,3"));
        assert_eq!(second.key.as_deref(), Some("/a?2,3"));
        assert_eq!(second.status, CacheStatus::Miss);
        assert_eq!(second.response.payload().as_ref(), b"response 2");
    }

    #[tokio::test]
    async fn true_key_args_route_is_cached() {
        let config =
            CacheConfig::default().route("/a", json!({"timeout": 10_000, "cacheKeyArgs": true}));
        let (engine, _) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        assert_eq!(serve(&engine, &calls, get("/a")).await.status, CacheStatus::Miss);
        let second = serve(&engine, &calls, get("/a")).await;
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.key.as_deref(), Some("/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_reclaimed_without_reads() {
        let config = CacheConfig::default().route("/a/:id", 10);
        let (engine, driver) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        for i in 0..1_000 {
            serve(&engine, &calls, get(&format!("/a/{i}"))).await;
        }
        assert_eq!(driver.len(), 2_000);

        tokio::time::sleep(PURGE_INTERVAL + Duration::from_millis(1)).await;
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn empty_body_is_stored_without_body_record() {
        let config = CacheConfig::default().route("/a", 1_000);
        let (engine, driver) = memory_engine(&config);
        let origin = |_req: Request| async { Ok::<_, Infallible>(Response::new(StatusCode::NoContent)) };

        let first = engine.serve(get("/a"), origin).await.unwrap();
        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(driver.len(), 1);

        let second = engine.serve(get("/a"), origin).await.unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.response.status(), StatusCode::NoContent);
        assert!(second.response.payload().is_empty());
    }

    #[tokio::test]
    async fn missing_body_record_is_a_miss() {
        let config = CacheConfig::default().route("/a", 10_000);
        let (engine, driver) = memory_engine(&config);
        let calls = AtomicUsize::new(0);

        serve(&engine, &calls, get("/a")).await;
        driver.delete("/a:body").await.unwrap();

        assert_eq!(serve(&engine, &calls, get("/a")).await.status, CacheStatus::Miss);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn origin_error_is_propagated_and_not_stored() {
        let config = CacheConfig::default().route("/a", 10_000);
        let (engine, driver) = memory_engine(&config);

        let result = engine
            .serve(get("/a"), |_req| async { Err::<Response, _>("origin down") })
            .await;

        assert!(matches!(result, Err("origin down")));
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn degraded_store_fails_open() {
        let config = CacheConfig::default().route("/a", 10_000);
        let engine = CacheEngine::new(
            &config,
            Arc::new(Broken {
                state: ConnectionState::Degraded,
            }),
        );
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            assert_eq!(serve(&engine, &calls, get("/a")).await.status, CacheStatus::Passthrough);
        }
        let served = serve(&engine, &calls, request("DELETE /a HTTP/1.1\r\n\r\n")).await;
        assert_eq!(served.status, CacheStatus::Invalidated);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn store_errors_are_treated_as_misses() {
        let config = CacheConfig::default().route("/a", 10_000);
        // Reports ready but fails every command.
        let engine = CacheEngine::new(
            &config,
            Arc::new(Broken {
                state: ConnectionState::Ready,
            }),
        );
        let calls = AtomicUsize::new(0);

        let served = serve(&engine, &calls, get("/a")).await;
        assert_eq!(served.status, CacheStatus::Miss);
        assert_eq!(served.response.payload().as_ref(), b"response 1");
    }

    #[tokio::test]
    async fn middleware_serves_hits_without_calling_origin() {
        let config = CacheConfig::default().route("/a", 10_000);
        let (engine, _) = memory_engine(&config);
        let calls = Arc::new(AtomicUsize::new(0));

        let origin_calls = Arc::clone(&calls);
        let pipeline = Pipeline::new(move |ctx: Context| {
            let calls = Arc::clone(&origin_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Response::new(StatusCode::Ok).body(ctx.request().path().to_owned())
            }
        })
        .layer(CacheMiddleware::new(Arc::new(engine)).into_handler());

        let first = pipeline.handle(get("/a")).await;
        let second = pipeline.handle(get("/a")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.payload(), second.payload());
        assert_eq!(second.payload().as_ref(), b"/a");
    }

    #[test]
    fn engine_without_runtime_still_builds() {
        let config = CacheConfig::default().route("/a", "increasing");
        let engine = CacheEngine::new(&config, Arc::new(MemoryDriver::new()));
        assert!(engine.tasks.is_empty());
        assert_eq!(engine.routes().len(), 1);
    }
}
