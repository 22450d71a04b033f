//! The spider contract: user code that seeds requests and parses responses.
//!
//! Callbacks are generator-valued. Rather than returning a finished
//! collection, every callback hands back a lazy stream of further requests
//! and items; the engine pulls the stream one value at a time so a callback
//! can interleave suspension with emission. Callback dispatch is by name
//! (`Request::callback`) so requests stay serializable for shared-queue
//! scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream};

use trawler_common::{Result, TrawlError};

use crate::middleware::MiddlewareRegistry;
use crate::pipeline::PipelineRegistry;
use crate::request::Request;
use crate::response::Response;
use crate::item::Item;

/// One value yielded by a callback: either more work or a result.
#[derive(Debug)]
pub enum SpiderOutput {
    Request(Request),
    Item(Item),
}

/// A lazy sequence of callback outputs. A yielded `Err` is a callback
/// fault: the engine pops the frame and emits `spider_exception`.
pub type CallbackStream = BoxStream<'static, Result<SpiderOutput>>;

/// Per-spider overrides of the global configuration. `None` defers to the
/// global value.
#[derive(Default, Clone)]
pub struct SpiderOverrides {
    pub request_delay: Option<f64>,
    pub request_timeout: Option<f64>,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub default_headers: Option<HashMap<String, String>>,
    pub ignored_statuses: Option<Vec<u16>>,
    pub duplicate_filter_impl: Option<String>,
    pub scheduler_container_impl: Option<String>,
    pub fetcher_impl: Option<String>,
    pub pipeline_parallel: Option<bool>,
    pub middleware: Option<Arc<MiddlewareRegistry>>,
    pub pipelines: Option<Arc<PipelineRegistry>>,
}

/// Engine-tracked spider lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiderState {
    Init,
    Running,
    Paused,
    Closed,
}

impl std::fmt::Display for SpiderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpiderState::Init => "init",
            SpiderState::Running => "running",
            SpiderState::Paused => "paused",
            SpiderState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub trait Spider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start_urls(&self) -> Vec<String> {
        Vec::new()
    }

    /// Seed the crawl. Default: one GET per start URL, parsed by `parse`.
    fn seed(self: Arc<Self>) -> CallbackStream {
        let outputs: Vec<Result<SpiderOutput>> = self
            .start_urls()
            .into_iter()
            .map(|url| Request::get(&url).map(SpiderOutput::Request))
            .collect();
        Box::pin(stream::iter(outputs))
    }

    /// The default callback for seeded requests.
    fn parse(self: Arc<Self>, response: Response) -> CallbackStream;

    /// Route a callback name to its stream. Spiders with additional
    /// callbacks override this and match on their own names.
    fn callback(self: Arc<Self>, name: &str, response: Response) -> Option<CallbackStream> {
        match name {
            "parse" => Some(self.parse(response)),
            _ => None,
        }
    }

    /// Called once before the first request. An error here aborts the run.
    fn on_start(&self) -> Result<()> {
        Ok(())
    }

    fn on_close(&self) {}

    fn on_exception(&self, _error: &TrawlError) {}

    fn overrides(&self) -> SpiderOverrides {
        SpiderOverrides::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Seeded;

    impl Spider for Seeded {
        fn name(&self) -> &str {
            "seeded"
        }

        fn start_urls(&self) -> Vec<String> {
            vec!["http://example.test/a".to_string(), "bad url with spaces".to_string()]
        }

        fn parse(self: Arc<Self>, _response: Response) -> CallbackStream {
            Box::pin(stream::empty())
        }
    }

    #[tokio::test]
    async fn default_seed_yields_requests_and_surfaces_bad_urls() {
        let spider: Arc<dyn Spider> = Arc::new(Seeded);
        let outputs: Vec<_> = spider.seed().collect().await;
        assert_eq!(outputs.len(), 2);
        match &outputs[0] {
            Ok(SpiderOutput::Request(r)) => {
                assert_eq!(r.url.as_str(), "http://example.test/a");
                assert_eq!(r.callback, "parse");
            }
            other => panic!("expected request, got {other:?}"),
        }
        assert!(outputs[1].is_err());
    }

    #[tokio::test]
    async fn unknown_callback_names_resolve_to_none() {
        let spider: Arc<dyn Spider> = Arc::new(Seeded);
        let request = Request::get("http://example.test").unwrap();
        let response = Response::new(request, 200, "");
        assert!(spider.callback("nope", response).is_none());
    }
}
