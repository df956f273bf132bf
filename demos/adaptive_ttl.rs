//! Walks one adaptive route through its TTL steps.
//!
//! ```text
//! RUST_LOG=route_cache=debug cargo run --example adaptive_ttl
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use route_cache::context::Context;
use route_cache::middleware::Pipeline;
use route_cache::store::MemoryDriver;
use route_cache::{CacheConfig, CacheEngine, CacheMiddleware, Request, Response, StatusCode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = CacheConfig::from_json(
        r#"{
            "routes": {
                "/feed": "increasing",
                "/users/:id": { "timeout": "increasing", "cacheKeyArgs": { "headers": ["x-tenant"] } }
            },
            "increasing": { "1": "1s", "3": "5s", "5": "1m" },
            "debug": true
        }"#,
    )?;

    let engine = Arc::new(CacheEngine::new(&config, Arc::new(MemoryDriver::new())));
    let origin_calls = Arc::new(AtomicUsize::new(0));

    let calls = Arc::clone(&origin_calls);
    let pipeline = Pipeline::new(move |ctx: Context| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Response::new(StatusCode::Ok).body(format!("{} rendered #{n}", ctx.request().path()))
        }
    })
    .layer(CacheMiddleware::new(Arc::clone(&engine)).into_handler());

    for _ in 0..6 {
        let (request, _) = Request::parse(b"GET /feed HTTP/1.1\r\n\r\n")?;
        let response = pipeline.handle(request).await;
        println!(
            "/feed -> {:?} (ttl {:?}, calls {:?})",
            std::str::from_utf8(response.payload())?,
            engine.store().resolve_ttl("/feed"),
            engine.policy().call_count("/feed"),
        );
    }

    for tenant in ["acme", "globex", "acme"] {
        let raw = format!("GET /users/7 HTTP/1.1\r\nx-tenant: {tenant}\r\n\r\n");
        let (request, _) = Request::parse(raw.as_bytes())?;
        let response = pipeline.handle(request).await;
        println!("/users/7 [{tenant}] -> {:?}", std::str::from_utf8(response.payload())?);
    }

    println!("origin calls: {}", origin_calls.load(Ordering::SeqCst));
    Ok(())
}
