//! The per-spider orchestrator.
//!
//! Three loop families cooperate on the runtime: a producer loop draining
//! the stack of callback frames into the scheduler and item queue, worker
//! loops dispatching scheduled requests through the downloader and routing
//! finished responses back into new callback frames, and pipeline loops
//! feeding items through the pipeline registry. Everything idles on
//! sub-millisecond micro-sleeps, honors the pause latch, and winds down
//! when the terminal flag is set or the quiescence check holds through its
//! grace window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use trawler_common::{Config, Result};

use crate::container::SchedulerContainer;
use crate::downloader::{DownloadPolicy, Downloader};
use crate::fetcher::Fetcher;
use crate::filter::DuplicateFilter;
use crate::item::Item;
use crate::middleware::MiddlewareRegistry;
use crate::pipeline::PipelineRegistry;
use crate::registry;
use crate::response::Response;
use crate::scheduler::Scheduler;
use crate::signals::{Signal, SignalBus, SignalEvent};
use crate::spider::{CallbackStream, Spider, SpiderOutput, SpiderState};
use crate::workers::SyncPool;

/// Idle tick for loops that found no work.
const IDLE_TICK: Duration = Duration::from_micros(500);
/// Sleep while the pause latch is held.
const PAUSE_TICK: Duration = Duration::from_millis(100);
/// Sampling interval of the quiescence check.
const QUIESCE_TICK: Duration = Duration::from_millis(20);
/// Confirmation window before a local engine commits to stopping.
const LOCAL_GRACE: Duration = Duration::from_millis(200);
/// Re-check window for shared-queue crawls, where a peer may still inject
/// work after this engine drains.
const DISTRIBUTED_GRACE: Duration = Duration::from_secs(5);
/// Producer backpressure threshold on dispatched-but-unfinished fetches.
const MAX_INFLIGHT_SOFT: usize = 1500;
const BACKPRESSURE_TICK: Duration = Duration::from_millis(300);
/// Settle time between the terminal flag and task aborts.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(200);

/// FIFO hand-off queue between loop families.
pub(crate) struct WorkQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()) }
    }

    pub(crate) fn push(&self, value: T) {
        self.inner.lock().unwrap().push_back(value);
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// RAII increment of a shared counter; the decrement survives task aborts.
struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Final accounting for one engine run.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub spider: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub requests_scheduled: u64,
    pub requests_dropped: u64,
    pub responses: u64,
    pub items: u64,
}

impl std::fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} scheduled, {} dropped, {} responses, {} items in {:.2}s",
            self.spider,
            self.requests_scheduled,
            self.requests_dropped,
            self.responses,
            self.items,
            self.elapsed.as_secs_f64()
        )
    }
}

struct Shared {
    spider: Arc<dyn Spider>,
    scheduler: Arc<Scheduler>,
    downloader: Arc<Downloader>,
    pipelines: Arc<PipelineRegistry>,
    signals: Arc<SignalBus>,

    /// Stack of callback frames; the innermost (most recent) frame is
    /// polled first.
    frames: tokio::sync::Mutex<Vec<CallbackStream>>,
    /// Mirrors the frame count, including a frame temporarily taken out of
    /// the stack for polling.
    frame_count: AtomicUsize,
    responses: Arc<WorkQueue<Response>>,
    items: WorkQueue<Item>,
    /// Values in transit between a pop and the next queue; keeps the
    /// quiescence check from racing a hand-off.
    held: Arc<AtomicUsize>,
    pipeline_inflight: Arc<AtomicUsize>,

    paused: AtomicBool,
    stopping: AtomicBool,
    state: Mutex<SpiderState>,

    pipeline_parallel: bool,
    distributed: bool,
    worker_loops: usize,
    pipeline_workers: usize,

    responses_routed: AtomicU64,
    items_processed: AtomicU64,
}

impl Shared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SpiderState) {
        *self.state.lock().unwrap() = state;
    }

    async fn push_frame(&self, frame: CallbackStream) {
        self.frame_count.fetch_add(1, Ordering::SeqCst);
        self.frames.lock().await.push(frame);
    }

    fn drop_frame(&self) {
        self.frame_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Quiescence: every queue this engine owns is empty and nothing is in
    /// flight.
    async fn idle(&self) -> bool {
        if self.frame_count.load(Ordering::SeqCst) > 0
            || self.held.load(Ordering::SeqCst) > 0
            || self.downloader.inflight() > 0
            || self.responses.len() > 0
            || self.items.len() > 0
            || self.pipeline_inflight.load(Ordering::SeqCst) > 0
        {
            return false;
        }
        match self.scheduler.pending().await {
            Ok(0) => true,
            Ok(_) => false,
            Err(error) => {
                warn!(spider = self.spider.name(), error = %error,
                    "Scheduler size check failed; assuming pending work");
                false
            }
        }
    }
}

/// Cloneable control surface forwarded by the runner.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn pause(&self) {
        info!(spider = self.shared.spider.name(), "Engine pausing");
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.set_state(SpiderState::Paused);
    }

    pub fn resume(&self) {
        info!(spider = self.shared.spider.name(), "Engine resuming");
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.set_state(SpiderState::Running);
    }

    pub fn stop(&self) {
        info!(spider = self.shared.spider.name(), "Engine stop requested");
        self.shared.stopping.store(true, Ordering::SeqCst);
    }

    pub fn spider_state(&self) -> SpiderState {
        *self.shared.state.lock().unwrap()
    }

    pub fn spider_name(&self) -> String {
        self.shared.spider.name().to_string()
    }
}

pub struct Engine {
    shared: Arc<Shared>,
}

pub struct EngineBuilder {
    spider: Arc<dyn Spider>,
    config: Arc<Config>,
    filter: Option<Arc<dyn DuplicateFilter>>,
    container: Option<Arc<dyn SchedulerContainer>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    middleware: Option<Arc<MiddlewareRegistry>>,
    pipelines: Option<Arc<PipelineRegistry>>,
    signals: Option<Arc<SignalBus>>,
}

impl EngineBuilder {
    pub fn filter(mut self, filter: Arc<dyn DuplicateFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn container(mut self, container: Arc<dyn SchedulerContainer>) -> Self {
        self.container = Some(container);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn middleware(mut self, middleware: Arc<MiddlewareRegistry>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    pub fn pipelines(mut self, pipelines: Arc<PipelineRegistry>) -> Self {
        self.pipelines = Some(pipelines);
        self
    }

    /// Replace the process-global signal bus, e.g. for test isolation.
    pub fn signals(mut self, signals: Arc<SignalBus>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Resolve components (explicit instances win, then per-spider
    /// overrides, then global configuration) and assemble the engine.
    pub async fn build(self) -> Result<Engine> {
        let overrides = self.spider.overrides();
        let config = self.config;
        SyncPool::init(config.worker_pool_size);

        let signals = self.signals.unwrap_or_else(SignalBus::global);

        let filter = match self.filter {
            Some(filter) => filter,
            None => {
                let name = overrides
                    .duplicate_filter_impl
                    .as_deref()
                    .unwrap_or(&config.duplicate_filter_impl);
                registry::resolve_filter(name, &config).await?
            }
        };
        let container = match self.container {
            Some(container) => container,
            None => {
                let name = overrides
                    .scheduler_container_impl
                    .as_deref()
                    .unwrap_or(&config.scheduler_container_impl);
                registry::resolve_container(name, &config).await?
            }
        };
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => {
                let name = overrides.fetcher_impl.as_deref().unwrap_or(&config.fetcher_impl);
                registry::resolve_fetcher(name, &config).await?
            }
        };

        let middleware = overrides
            .middleware
            .clone()
            .or(self.middleware)
            .unwrap_or_else(|| Arc::new(MiddlewareRegistry::new()));
        let pipelines = overrides
            .pipelines
            .clone()
            .or(self.pipelines)
            .unwrap_or_else(|| Arc::new(PipelineRegistry::new()));

        let policy = DownloadPolicy::resolve(&config, &overrides);
        let responses = Arc::new(WorkQueue::new());
        let scheduler = Arc::new(Scheduler::new(
            filter,
            container,
            signals.clone(),
            self.spider.name(),
        ));
        let downloader = Arc::new(Downloader::new(
            self.spider.clone(),
            fetcher,
            scheduler.clone(),
            middleware,
            signals.clone(),
            policy,
            responses.clone(),
        ));

        let shared = Arc::new(Shared {
            spider: self.spider,
            scheduler,
            downloader,
            pipelines,
            signals,
            frames: tokio::sync::Mutex::new(Vec::new()),
            frame_count: AtomicUsize::new(0),
            responses,
            items: WorkQueue::new(),
            held: Arc::new(AtomicUsize::new(0)),
            pipeline_inflight: Arc::new(AtomicUsize::new(0)),
            paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            state: Mutex::new(SpiderState::Init),
            pipeline_parallel: overrides.pipeline_parallel.unwrap_or(config.pipeline_parallel),
            distributed: config.distributed_mode,
            worker_loops: config.worker_loops.max(1),
            pipeline_workers: config.pipeline_workers.max(1),
            responses_routed: AtomicU64::new(0),
            items_processed: AtomicU64::new(0),
        });

        Ok(Engine { shared })
    }
}

impl Engine {
    pub fn builder(spider: Arc<dyn Spider>, config: Arc<Config>) -> EngineBuilder {
        EngineBuilder {
            spider,
            config,
            filter: None,
            container: None,
            fetcher: None,
            middleware: None,
            pipelines: None,
            signals: None,
        }
    }

    /// Build with components resolved purely from configuration.
    pub async fn build(spider: Arc<dyn Spider>, config: Arc<Config>) -> Result<Engine> {
        Self::builder(spider, config).build().await
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle { shared: self.shared.clone() }
    }

    /// Drive the crawl to quiescence (or an external stop) and return the
    /// run's accounting.
    pub async fn run(self) -> Result<CrawlReport> {
        let shared = self.shared;
        let spider_name = shared.spider.name().to_string();
        let started_at = Utc::now();
        let t0 = Instant::now();
        info!(spider = %spider_name, "Engine starting");

        // An error from on_start aborts the run before anything is seeded.
        shared.spider.on_start()?;

        let scheduled = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let sub_scheduled = {
            let counter = scheduled.clone();
            let name = spider_name.clone();
            shared.signals.subscribe(Signal::RequestScheduled, move |event| {
                if event.spider == name {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        };
        let sub_dropped = {
            let counter = dropped.clone();
            let name = spider_name.clone();
            shared.signals.subscribe(Signal::RequestDropped, move |event| {
                if event.spider == name {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        };

        shared.set_state(SpiderState::Running);
        shared.signals.emit(SignalEvent::new(Signal::SpiderStart, &spider_name));
        shared.signals.emit(SignalEvent::new(Signal::EngineStart, &spider_name));

        shared.push_frame(shared.spider.clone().seed()).await;

        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        loops.push(tokio::spawn(producer_loop(shared.clone())));
        for _ in 0..shared.worker_loops {
            loops.push(tokio::spawn(worker_loop(shared.clone())));
        }
        for _ in 0..shared.pipeline_workers {
            loops.push(tokio::spawn(pipeline_loop(shared.clone())));
        }

        'supervise: while !shared.is_stopping() {
            tokio::time::sleep(QUIESCE_TICK).await;
            if shared.is_paused() {
                continue;
            }
            if !shared.idle().await {
                continue;
            }
            shared.signals.emit(SignalEvent::new(Signal::EngineIdle, &spider_name));
            let grace = if shared.distributed { DISTRIBUTED_GRACE } else { LOCAL_GRACE };
            debug!(spider = %spider_name, grace_ms = grace.as_millis() as u64,
                "Engine idle; confirming over grace window");
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                if shared.is_stopping() {
                    break 'supervise;
                }
                tokio::time::sleep(QUIESCE_TICK).await;
                if !shared.idle().await {
                    continue 'supervise;
                }
            }
            debug!(spider = %spider_name, "Quiescent through the grace window; stopping");
            break;
        }

        shared.stopping.store(true, Ordering::SeqCst);
        shared.set_state(SpiderState::Closed);
        shared.signals.emit(SignalEvent::new(Signal::SpiderClose, &spider_name));
        shared.spider.on_close();

        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        for task in &loops {
            task.abort();
        }
        for task in loops {
            let _ = task.await;
        }
        shared.downloader.abort_all();

        shared.signals.emit(SignalEvent::new(Signal::EngineClose, &spider_name));
        shared.signals.unsubscribe(sub_scheduled);
        shared.signals.unsubscribe(sub_dropped);

        let report = CrawlReport {
            spider: spider_name,
            started_at,
            elapsed: t0.elapsed(),
            requests_scheduled: scheduled.load(Ordering::Relaxed),
            requests_dropped: dropped.load(Ordering::Relaxed),
            responses: shared.responses_routed.load(Ordering::Relaxed),
            items: shared.items_processed.load(Ordering::Relaxed),
        };
        info!(spider = %report.spider, %report, "Engine stopped");
        Ok(report)
    }
}

/// Drain the innermost callback frame: requests to the scheduler, items to
/// the item queue, faults and exhaustion pop the frame.
async fn producer_loop(shared: Arc<Shared>) {
    loop {
        if shared.is_stopping() {
            break;
        }
        if shared.is_paused() {
            tokio::time::sleep(PAUSE_TICK).await;
            continue;
        }
        if shared.downloader.inflight() > MAX_INFLIGHT_SOFT {
            tokio::time::sleep(BACKPRESSURE_TICK).await;
            continue;
        }

        let frame = shared.frames.lock().await.pop();
        let Some(mut stream) = frame else {
            tokio::time::sleep(IDLE_TICK).await;
            continue;
        };
        let _hold = CountGuard::new(shared.held.clone());
        match stream.next().await {
            Some(Ok(SpiderOutput::Request(request))) => {
                shared.frames.lock().await.push(stream);
                if let Err(error) = shared.scheduler.schedule(request).await {
                    warn!(spider = shared.spider.name(), error = %error,
                        "Failed to schedule request");
                }
            }
            Some(Ok(SpiderOutput::Item(item))) => {
                shared.frames.lock().await.push(stream);
                shared.items.push(item);
            }
            Some(Err(error)) => {
                shared.drop_frame();
                error!(spider = shared.spider.name(), error = %error,
                    "Callback fault; dropping frame");
                shared.spider.on_exception(&error);
                shared.signals.emit(
                    SignalEvent::new(Signal::SpiderException, shared.spider.name())
                        .with("error", error.to_string()),
                );
            }
            None => shared.drop_frame(),
        }
    }
}

/// Dispatch scheduled requests and route finished responses back into new
/// callback frames.
async fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.is_stopping() {
            break;
        }
        if shared.is_paused() {
            tokio::time::sleep(PAUSE_TICK).await;
            continue;
        }

        let mut advanced = false;
        match shared.scheduler.next().await {
            Ok(Some(mut request)) => {
                let _hold = CountGuard::new(shared.held.clone());
                request.bind_spider(&shared.spider);
                shared.downloader.dispatch(request);
                advanced = true;
            }
            Ok(None) => {}
            Err(error) => {
                warn!(spider = shared.spider.name(), error = %error, "Scheduler pop failed");
                tokio::time::sleep(PAUSE_TICK).await;
                continue;
            }
        }

        if let Some(response) = shared.responses.pop() {
            let _hold = CountGuard::new(shared.held.clone());
            shared.responses_routed.fetch_add(1, Ordering::Relaxed);
            let callback = response.request.callback.clone();
            match shared.spider.clone().callback(&callback, response) {
                Some(frame) => shared.push_frame(frame).await,
                None => warn!(spider = shared.spider.name(), callback = %callback,
                    "No callback under this name; response ignored"),
            }
            advanced = true;
        }

        if !advanced {
            tokio::time::sleep(IDLE_TICK).await;
        }
    }
}

/// Drain the item queue through the pipeline registry.
async fn pipeline_loop(shared: Arc<Shared>) {
    loop {
        if shared.is_stopping() {
            break;
        }
        if shared.is_paused() {
            tokio::time::sleep(PAUSE_TICK).await;
            continue;
        }

        let Some(item) = shared.items.pop() else {
            tokio::time::sleep(IDLE_TICK).await;
            continue;
        };
        let _inflight = CountGuard::new(shared.pipeline_inflight.clone());
        shared.items_processed.fetch_add(1, Ordering::Relaxed);
        shared
            .pipelines
            .dispatch(&shared.spider, item, shared.pipeline_parallel, &shared.signals)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_queue_is_fifo() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn count_guard_releases_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _guard = CountGuard::new(counter.clone());
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
