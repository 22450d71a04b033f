//! Test doubles for the engine's trait boundaries.
//!
//! - `MockFetcher` — scripted per-URL outcomes with a call counter
//! - `ScriptedSpider` — a spider whose parse is a plain closure
//! - `SignalRecorder` — captures every event on a bus
//! - `RecordingStage` — pipeline sink collecting processed items
//!
//! Compiled for unit tests and behind the `test-support` feature for
//! integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;

use trawler_common::{Result, TrawlError};

use crate::fetcher::Fetcher;
use crate::item::Item;
use crate::pipeline::PipelineStage;
use crate::request::Request;
use crate::response::Response;
use crate::signals::{Signal, SignalBus, SignalEvent};
use crate::spider::{CallbackStream, Spider, SpiderOutput, SpiderOverrides};

/// One scripted fetch result.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ok { status: u16, body: String },
    Timeout,
    TransportError(String),
}

impl FetchOutcome {
    pub fn ok(status: u16, body: &str) -> Self {
        FetchOutcome::Ok { status, body: body.to_string() }
    }
}

/// HashMap-based fetcher. Outcomes registered per URL are consumed in
/// order; the last one sticks, so a single `Timeout` means "always times
/// out". Unregistered URLs are a transport error.
#[derive(Default)]
pub struct MockFetcher {
    outcomes: Mutex<HashMap<String, VecDeque<FetchOutcome>>>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, url: &str, outcome: FetchOutcome) -> Self {
        self.outcomes.lock().unwrap().entry(url.to_string()).or_default().push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.get_mut(request.url.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match outcome {
            Some(FetchOutcome::Ok { status, body }) => {
                Ok(Response::new(request.clone(), status, Bytes::from(body)))
            }
            Some(FetchOutcome::Timeout) => Err(TrawlError::FetchTimeout),
            Some(FetchOutcome::TransportError(message)) => {
                Err(TrawlError::FetchTransport(message))
            }
            None => Err(TrawlError::FetchTransport(format!(
                "no mock outcome for {}",
                request.url
            ))),
        }
    }
}

type ParseFn = dyn Fn(&Response) -> Vec<Result<SpiderOutput>> + Send + Sync;

/// A spider scripted from closures, for driving the engine in tests.
pub struct ScriptedSpider {
    name: String,
    start_urls: Vec<String>,
    parse: Arc<ParseFn>,
    overrides: SpiderOverrides,
}

impl ScriptedSpider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start_urls: Vec::new(),
            parse: Arc::new(|_| Vec::new()),
            overrides: SpiderOverrides::default(),
        }
    }

    pub fn with_start_urls(mut self, urls: &[&str]) -> Self {
        self.start_urls = urls.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_parse(
        mut self,
        parse: impl Fn(&Response) -> Vec<Result<SpiderOutput>> + Send + Sync + 'static,
    ) -> Self {
        self.parse = Arc::new(parse);
        self
    }

    pub fn with_overrides(mut self, overrides: SpiderOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

impl Spider for ScriptedSpider {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_urls(&self) -> Vec<String> {
        self.start_urls.clone()
    }

    fn parse(self: Arc<Self>, response: Response) -> CallbackStream {
        let outputs = (self.parse)(&response);
        Box::pin(stream::iter(outputs))
    }

    fn overrides(&self) -> SpiderOverrides {
        self.overrides.clone()
    }
}

/// Captures every event emitted on a bus, keyed for counting.
pub struct SignalRecorder {
    events: Arc<Mutex<Vec<SignalEvent>>>,
}

impl SignalRecorder {
    /// Subscribe to every signal on the bus. The subscriptions live as
    /// long as the bus; recorders are built per-test with a private bus.
    pub fn install(bus: &SignalBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        for signal in Signal::ALL {
            let events = events.clone();
            bus.subscribe(signal, move |event| {
                events.lock().unwrap().push(event.clone());
                Ok(())
            });
        }
        Self { events }
    }

    pub fn count(&self, signal: Signal) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.signal == signal).count()
    }

    pub fn events(&self) -> Vec<SignalEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Pipeline sink that records everything it processes and passes it on.
#[derive(Default)]
pub struct RecordingStage {
    items: Arc<Mutex<Vec<Item>>>,
}

impl RecordingStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<Item> {
        self.items.lock().unwrap().clone()
    }

    pub fn sink(&self) -> Arc<Mutex<Vec<Item>>> {
        self.items.clone()
    }
}

#[async_trait]
impl PipelineStage for RecordingStage {
    async fn process(&self, _spider: &Arc<dyn Spider>, item: Item) -> Result<Option<Item>> {
        self.items.lock().unwrap().push(item.clone());
        Ok(Some(item))
    }
}
