//! # route-cache
//!
//! A route-driven response cache for async HTTP handlers.
//!
//! A declarative route table decides which paths are cached and for how long:
//! a fixed TTL, the default TTL, never, or an adaptive TTL that grows with how
//! often a key is requested. Cached responses live in a pluggable store, either
//! in process or in Redis.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use route_cache::{CacheConfig, CacheEngine, CacheMiddleware, Request, Response, StatusCode};
//! use route_cache::context::Context;
//! use route_cache::middleware::Pipeline;
//! use route_cache::store::MemoryDriver;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_json(r#"{
//!         "routes": {
//!             "/health": false,
//!             "/users/:id": 30000,
//!             "/feed/*": "increasing"
//!         }
//!     }"#)?;
//!
//!     let engine = Arc::new(CacheEngine::new(&config, Arc::new(MemoryDriver::new())));
//!     let pipeline = Pipeline::new(|ctx: Context| async move {
//!         Response::new(StatusCode::Ok).body(format!("rendered {}", ctx.request().path()))
//!     })
//!     .layer(CacheMiddleware::new(engine).into_handler());
//!
//!     let (request, _) = Request::parse(b"GET /users/7 HTTP/1.1\r\n\r\n")?;
//!     let response = pipeline.handle(request).await;
//!     assert_eq!(response.status(), StatusCode::Ok);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod key;
pub mod middleware;
pub mod policy;
pub mod route;
pub mod store;

pub use cache::{CacheEngine, CacheMiddleware, CacheStatus};
pub use config::CacheConfig;
pub use http::{Headers, Method, Request, Response, StatusCode};
