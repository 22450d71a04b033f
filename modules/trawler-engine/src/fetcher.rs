use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use trawler_common::{Result, TrawlError};

use crate::request::Request;
use crate::response::Response;
use crate::workers::SyncPool;

/// The pluggable HTTP transport. One operation: request in, response out.
///
/// Implementations must surface transport-level timeouts as
/// `TrawlError::FetchTimeout` — the downloader turns those into delayed
/// re-scheduling rather than user-visible failures.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Reference fetcher over a shared `reqwest::Client`.
///
/// Per-request state (method, headers, cookie header, body, timeout) comes
/// from the request; a `SessionHandle` carrying a `reqwest::Client` takes
/// the place of the shared client so cookie/connection affinity survives
/// across a spider's requests. The only recognized transport extra is
/// `query`, an object appended as query parameters.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let client = request
            .session
            .as_ref()
            .and_then(|s| s.downcast_ref::<reqwest::Client>())
            .cloned()
            .unwrap_or_else(|| self.client.clone());

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TrawlError::FetchTransport(format!("invalid method {}", request.method)))?;

        let mut builder = client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            builder = builder.header("Cookie", cookie_header(&request.cookies));
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(Duration::from_secs_f64(timeout.max(0.001)));
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(Value::Object(query)) = request.extras.get("query") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(String::from).unwrap_or_else(|| v.to_string())))
                .collect();
            builder = builder.query(&pairs);
        }

        let resp = builder.send().await.map_err(map_transport_error)?;
        let status = resp.status().as_u16();

        let mut headers = HashMap::new();
        let mut cookies = HashMap::new();
        for (name, value) in resp.headers() {
            let Ok(value) = value.to_str() else { continue };
            if name.as_str().eq_ignore_ascii_case("set-cookie") {
                if let Some((cookie_name, cookie_value)) = parse_set_cookie(value) {
                    cookies.insert(cookie_name, cookie_value);
                }
            }
            headers.insert(name.to_string(), value.to_string());
        }

        let body = resp.bytes().await.map_err(map_transport_error)?;
        debug!(url = %request.url, status, bytes = body.len(), "Fetched");

        Ok(Response::new(request.clone(), status, body)
            .with_headers(headers)
            .with_cookies(cookies))
    }
}

fn map_transport_error(error: reqwest::Error) -> TrawlError {
    if error.is_timeout() {
        TrawlError::FetchTimeout
    } else {
        TrawlError::FetchTransport(error.to_string())
    }
}

fn cookie_header(cookies: &HashMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let pair = value.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// Adapter for synchronous fetchers: the closure runs on the shared worker
/// pool so it never blocks the engine loop.
pub struct BlockingFetcher {
    fetch: Arc<dyn Fn(Request) -> Result<Response> + Send + Sync>,
}

impl BlockingFetcher {
    pub fn new(fetch: impl Fn(Request) -> Result<Response> + Send + Sync + 'static) -> Self {
        Self { fetch: Arc::new(fetch) }
    }
}

#[async_trait]
impl Fetcher for BlockingFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let fetch = self.fetch.clone();
        let request = request.clone();
        SyncPool::global().run(move || fetch(request)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn cookie_header_joins_pairs() {
        let mut cookies = HashMap::new();
        cookies.insert("a".to_string(), "1".to_string());
        let header = cookie_header(&cookies);
        assert_eq!(header, "a=1");
    }

    #[test]
    fn set_cookie_parsing_takes_the_first_pair() {
        assert_eq!(
            parse_set_cookie("sid=abc123; Path=/; HttpOnly"),
            Some(("sid".to_string(), "abc123".to_string()))
        );
        assert!(parse_set_cookie("garbage").is_none());
    }

    #[tokio::test]
    async fn blocking_fetcher_runs_on_the_pool() {
        let fetcher = BlockingFetcher::new(|request| {
            Ok(Response::new(request, 200, Bytes::from_static(b"sync")))
        });
        let request = Request::get("http://example.test").unwrap();
        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"sync");
    }

    #[tokio::test]
    async fn blocking_fetcher_propagates_timeout_errors() {
        let fetcher = BlockingFetcher::new(|_| Err(TrawlError::FetchTimeout));
        let request = Request::get("http://example.test").unwrap();
        assert!(matches!(fetcher.fetch(&request).await, Err(TrawlError::FetchTimeout)));
    }
}
