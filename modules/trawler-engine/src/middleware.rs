//! Ordered user hooks around the fetch.
//!
//! Request-side hooks run ascending by order key and may mutate the
//! outgoing request; response-side hooks run descending and may mutate the
//! response. A faulting hook is logged and skipped — the chain, and the
//! request, carry on.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use trawler_common::Result;

use crate::request::Request;
use crate::response::Response;
use crate::spider::Spider;

#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    async fn handle(&self, spider: &Arc<dyn Spider>, request: &mut Request) -> Result<()>;
}

#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    async fn handle(
        &self,
        spider: &Arc<dyn Spider>,
        request: &Request,
        response: &mut Response,
    ) -> Result<()>;
}

struct RequestFn<F>(F);

#[async_trait]
impl<F> RequestMiddleware for RequestFn<F>
where
    F: Fn(&Arc<dyn Spider>, &mut Request) -> Result<()> + Send + Sync,
{
    async fn handle(&self, spider: &Arc<dyn Spider>, request: &mut Request) -> Result<()> {
        (self.0)(spider, request)
    }
}

struct ResponseFn<F>(F);

#[async_trait]
impl<F> ResponseMiddleware for ResponseFn<F>
where
    F: Fn(&Arc<dyn Spider>, &Request, &mut Response) -> Result<()> + Send + Sync,
{
    async fn handle(
        &self,
        spider: &Arc<dyn Spider>,
        request: &Request,
        response: &mut Response,
    ) -> Result<()> {
        (self.0)(spider, request, response)
    }
}

/// Wrap a plain function as request-side middleware.
pub fn request_fn(
    f: impl Fn(&Arc<dyn Spider>, &mut Request) -> Result<()> + Send + Sync + 'static,
) -> Arc<dyn RequestMiddleware> {
    Arc::new(RequestFn(f))
}

/// Wrap a plain function as response-side middleware.
pub fn response_fn(
    f: impl Fn(&Arc<dyn Spider>, &Request, &mut Response) -> Result<()> + Send + Sync + 'static,
) -> Arc<dyn ResponseMiddleware> {
    Arc::new(ResponseFn(f))
}

#[derive(Default, Clone)]
pub struct MiddlewareRegistry {
    request_side: Vec<(i32, Arc<dyn RequestMiddleware>)>,
    response_side: Vec<(i32, Arc<dyn ResponseMiddleware>)>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request-side hook under an order key (ascending).
    pub fn request(mut self, order: i32, middleware: Arc<dyn RequestMiddleware>) -> Self {
        self.request_side.push((order, middleware));
        self.request_side.sort_by_key(|(order, _)| *order);
        self
    }

    /// Register a response-side hook under an order key (descending).
    pub fn response(mut self, order: i32, middleware: Arc<dyn ResponseMiddleware>) -> Self {
        self.response_side.push((order, middleware));
        self.response_side.sort_by_key(|(order, _)| std::cmp::Reverse(*order));
        self
    }

    /// Combine two registries; each side keeps its own direction, with
    /// equal keys resolved by insertion order (sorts are stable).
    pub fn merge(mut self, other: MiddlewareRegistry) -> Self {
        self.request_side.extend(other.request_side);
        self.request_side.sort_by_key(|(order, _)| *order);
        self.response_side.extend(other.response_side);
        self.response_side.sort_by_key(|(order, _)| std::cmp::Reverse(*order));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.request_side.is_empty() && self.response_side.is_empty()
    }

    pub(crate) async fn run_request_side(&self, spider: &Arc<dyn Spider>, request: &mut Request) {
        for (order, middleware) in &self.request_side {
            if let Err(error) = middleware.handle(spider, request).await {
                warn!(spider = spider.name(), order, error = %error,
                    "Request middleware fault; continuing");
            }
        }
    }

    pub(crate) async fn run_response_side(
        &self,
        spider: &Arc<dyn Spider>,
        request: &Request,
        response: &mut Response,
    ) {
        for (order, middleware) in &self.response_side {
            if let Err(error) = middleware.handle(spider, request, response).await {
                warn!(spider = spider.name(), order, error = %error,
                    "Response middleware fault; continuing");
            }
        }
    }

    #[cfg(test)]
    fn request_orders(&self) -> Vec<i32> {
        self.request_side.iter().map(|(order, _)| *order).collect()
    }

    #[cfg(test)]
    fn response_orders(&self) -> Vec<i32> {
        self.response_side.iter().map(|(order, _)| *order).collect()
    }
}
