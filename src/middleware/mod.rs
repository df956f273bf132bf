//! Middleware pipeline: the host side of the cache layer.
//!
//! A [`Pipeline`] is an ordered middleware stack in front of one origin handler.
//! Each middleware wraps the rest of the chain, so it can inspect the request,
//! short-circuit with its own response (a cache hit), or call through and
//! decorate what comes back (a cache miss).
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Handler`] / [`IntoHandler`]: the type-erased origin and its conversion trait.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{Request, Response, context::Context};

/// Boxed future returned by middleware and handlers.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Type-erased async origin handler.
///
/// In practice you never construct this type directly; pass any
/// `Fn(Context) -> impl Future<Output = Response>` to [`Pipeline::new`].
pub type Handler = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> BoxResponse;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxResponse {
        Box::pin((self)(ctx))
    }
}

/// A type-erased, reference-counted middleware function.
///
/// Construct one with [`from_middleware`] or by wrapping a closure directly:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use route_cache::{context::Context, middleware::{MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each middleware can forward a
/// request at most once.
pub struct Next {
    layers: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    origin: Handler,
}

impl Next {
    /// Invokes the next middleware in the chain, or the origin once every layer
    /// has run, and returns its response.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.layers.len() {
            let handler = self.layers[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            (self.origin)(ctx).await
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// Implementations **must** be `Send + Sync` because middleware is shared across
/// Tokio tasks, and **should not** hold `&mut` references to shared state across
/// an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// An ordered middleware stack in front of an origin handler.
///
/// # Examples
///
/// ```rust,no_run
/// use route_cache::{Request, Response, StatusCode};
/// use route_cache::context::Context;
/// use route_cache::middleware::Pipeline;
///
/// # async fn example(request: Request, layer: route_cache::middleware::MiddlewareHandler) {
/// let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::Ok).body("origin") })
///     .layer(layer);
///
/// let response = pipeline.handle(request).await;
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    layers: Vec<MiddlewareHandler>,
    origin: Handler,
}

impl Pipeline {
    /// Create a pipeline with no middleware in front of `origin`.
    pub fn new(origin: impl IntoHandler) -> Self {
        Self {
            layers: Vec::new(),
            origin: Arc::new(move |ctx: Context| origin.call(ctx)),
        }
    }

    /// Append a middleware. Layers run in the order they were added.
    #[must_use]
    pub fn layer(mut self, middleware: MiddlewareHandler) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run `request` through every layer and the origin.
    pub async fn handle(&self, request: Request) -> Response {
        let next = Next {
            layers: self.layers.clone().into(),
            index: 0,
            origin: Arc::clone(&self.origin),
        };
        next.run(Context::new(request)).await
    }
}
