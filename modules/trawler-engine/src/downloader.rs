//! Bounded-concurrency execution of fetches.
//!
//! The downloader wraps the fetcher with everything the engine expects per
//! request: the retry budget, default-header merging, timeout resolution,
//! the concurrency semaphore, middleware, the pre-fetch delay, status
//! filtering, and hand-off to the response queue. A transport timeout is
//! not an error here — it re-schedules the request, and the incremented
//! retry count keeps the duplicate filter from rejecting the reattempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use trawler_common::{Config, TrawlError};

use crate::engine::WorkQueue;
use crate::fetcher::Fetcher;
use crate::middleware::MiddlewareRegistry;
use crate::request::Request;
use crate::response::Response;
use crate::scheduler::Scheduler;
use crate::signals::{Signal, SignalBus, SignalEvent};
use crate::spider::{Spider, SpiderOverrides};

/// Effective per-engine download settings after applying spider overrides.
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub delay: f64,
    pub default_timeout: f64,
    pub max_retries: u32,
    pub concurrency: usize,
    pub ignored_statuses: Vec<u16>,
    pub default_headers: HashMap<String, String>,
}

impl DownloadPolicy {
    pub fn resolve(config: &Config, overrides: &SpiderOverrides) -> Self {
        Self {
            delay: overrides.request_delay.unwrap_or(config.request_delay),
            default_timeout: overrides.request_timeout.unwrap_or(config.request_timeout),
            max_retries: overrides.max_retries.unwrap_or(config.max_retries).max(1),
            concurrency: overrides.concurrency.unwrap_or(config.concurrency_per_spider).max(1),
            ignored_statuses: overrides
                .ignored_statuses
                .clone()
                .unwrap_or_else(|| config.ignored_statuses.clone()),
            default_headers: overrides
                .default_headers
                .clone()
                .unwrap_or_else(|| config.default_headers.clone()),
        }
    }
}

struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InflightGuard {
    // Runs even when the task is aborted, so cancellation cannot leak the
    // in-flight count the quiescence check depends on.
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Downloader {
    spider: Arc<dyn Spider>,
    fetcher: Arc<dyn Fetcher>,
    scheduler: Arc<Scheduler>,
    middleware: Arc<MiddlewareRegistry>,
    signals: Arc<SignalBus>,
    policy: DownloadPolicy,
    semaphore: Arc<Semaphore>,
    responses: Arc<WorkQueue<Response>>,
    inflight: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Downloader {
    pub fn new(
        spider: Arc<dyn Spider>,
        fetcher: Arc<dyn Fetcher>,
        scheduler: Arc<Scheduler>,
        middleware: Arc<MiddlewareRegistry>,
        signals: Arc<SignalBus>,
        policy: DownloadPolicy,
        responses: Arc<WorkQueue<Response>>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(policy.concurrency));
        Self {
            spider,
            fetcher,
            scheduler,
            middleware,
            signals,
            policy,
            semaphore,
            responses,
            inflight: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Fetches currently dispatched and not yet handed off.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Spawn the download as an engine-owned task. The in-flight count is
    /// taken before spawning so quiescence never observes a gap between
    /// pop and dispatch.
    pub fn dispatch(self: &Arc<Self>, request: Request) {
        let guard = InflightGuard::new(self.inflight.clone());
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.download(request).await;
        });
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Abort every outstanding download owned by this engine.
    pub fn abort_all(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    async fn download(&self, mut request: Request) {
        if request.retries >= self.policy.max_retries {
            warn!(spider = self.spider.name(), url = %request.url, retries = request.retries,
                "Request exhausted its retry budget; dropping");
            self.signals.emit(
                SignalEvent::new(Signal::RequestDropped, self.spider.name())
                    .with("url", request.url.as_str())
                    .with("reason", "max_retries"),
            );
            return;
        }
        request.retries += 1;

        merge_default_headers(&mut request, &self.policy.default_headers);
        if request.timeout.is_none() {
            request.timeout = Some(self.policy.default_timeout);
        }

        let Ok(_permit) = self.semaphore.acquire().await else {
            // Closed semaphore means the engine is tearing down.
            return;
        };

        self.middleware.run_request_side(&self.spider, &mut request).await;

        if self.policy.delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(self.policy.delay)).await;
        }

        debug!(spider = self.spider.name(), url = %request.url, method = %request.method,
            attempt = request.retries, "Sending request");

        let mut response = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(TrawlError::FetchTimeout) => {
                debug!(spider = self.spider.name(), url = %request.url,
                    attempt = request.retries, "Fetch timed out; re-scheduling");
                if let Err(e) = self.scheduler.schedule(request).await {
                    warn!(spider = self.spider.name(), error = %e,
                        "Re-schedule after timeout failed");
                }
                return;
            }
            Err(TrawlError::Cancelled) => return,
            Err(e) => {
                error!(spider = self.spider.name(), url = %request.url, error = %e,
                    "Fetch failed; dropping attempt");
                return;
            }
        };

        self.signals.emit(
            SignalEvent::new(Signal::ResponseReceived, self.spider.name())
                .with("url", request.url.as_str())
                .with("status", response.status),
        );

        if self.policy.ignored_statuses.contains(&response.status) {
            debug!(spider = self.spider.name(), url = %request.url, status = response.status,
                "Response status ignored");
            return;
        }

        self.middleware.run_response_side(&self.spider, &request, &mut response).await;

        // Attach the post-middleware request (carrying the spider pointer
        // and retry count) before hand-off.
        response.request = request;
        self.signals.emit(
            SignalEvent::new(Signal::ResponseDownloaded, self.spider.name())
                .with("url", response.request.url.as_str())
                .with("status", response.status),
        );
        self.responses.push(response);
    }
}

/// Defaults merge under user headers: a header the request already carries
/// wins, whatever its casing (header names are case-insensitive on the
/// wire).
fn merge_default_headers(request: &mut Request, defaults: &HashMap<String, String>) {
    for (name, value) in defaults {
        if !request.headers.keys().any(|existing| existing.eq_ignore_ascii_case(name)) {
            request.headers.insert(name.clone(), value.clone());
        }
    }
}
