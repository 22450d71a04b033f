use std::sync::Arc;

use tracing::{debug, warn};

use trawler_common::Result;

use crate::container::SchedulerContainer;
use crate::filter::DuplicateFilter;
use crate::request::Request;
use crate::signals::{Signal, SignalBus, SignalEvent};

/// Admission and next-selection for requests: the engine's single
/// choke-point into the pending queue.
pub struct Scheduler {
    filter: Arc<dyn DuplicateFilter>,
    container: Arc<dyn SchedulerContainer>,
    signals: Arc<SignalBus>,
    spider: String,
}

impl Scheduler {
    pub fn new(
        filter: Arc<dyn DuplicateFilter>,
        container: Arc<dyn SchedulerContainer>,
        signals: Arc<SignalBus>,
        spider: &str,
    ) -> Self {
        Self { filter, container, signals, spider: spider.to_string() }
    }

    /// Admit a request, or reject it as a duplicate. Filter backend errors
    /// fail open: a flaky shared filter costs duplicate fetches, not lost
    /// requests.
    pub async fn schedule(&self, request: Request) -> Result<bool> {
        if !request.allow_duplicate {
            let fingerprint = request.fingerprint();
            match self.filter.contains(&fingerprint).await {
                Ok(true) => {
                    debug!(spider = %self.spider, url = %request.url, "Duplicate request rejected");
                    self.signals.emit(
                        SignalEvent::new(Signal::RequestDropped, &self.spider)
                            .with("url", request.url.as_str())
                            .with("reason", "duplicate"),
                    );
                    return Ok(false);
                }
                Ok(false) => {
                    if let Err(error) = self.filter.add(&fingerprint).await {
                        warn!(spider = %self.spider, error = %error,
                            "Duplicate filter add failed; scheduling anyway");
                    }
                }
                Err(error) => {
                    warn!(spider = %self.spider, error = %error,
                        "Duplicate filter unavailable; scheduling anyway");
                }
            }
        }
        self.container.push(request.clone()).await?;
        self.signals.emit(
            SignalEvent::new(Signal::RequestScheduled, &self.spider)
                .with("url", request.url.as_str())
                .with("retries", request.retries),
        );
        Ok(true)
    }

    pub async fn next(&self) -> Result<Option<Request>> {
        self.container.pop().await
    }

    pub async fn pending(&self) -> Result<usize> {
        self.container.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryQueue;
    use crate::filter::MemoryFilter;

    fn scheduler() -> (Scheduler, Arc<MemoryFilter>) {
        let filter = Arc::new(MemoryFilter::new());
        let scheduler = Scheduler::new(
            filter.clone(),
            Arc::new(MemoryQueue::new()),
            Arc::new(SignalBus::new()),
            "test-spider",
        );
        (scheduler, filter)
    }

    #[tokio::test]
    async fn duplicate_requests_are_rejected() {
        let (scheduler, filter) = scheduler();
        let request = Request::get("http://example.test/a").unwrap();

        assert!(scheduler.schedule(request.clone()).await.unwrap());
        assert!(!scheduler.schedule(request.clone()).await.unwrap());
        assert!(!scheduler.schedule(request).await.unwrap());

        assert_eq!(filter.len().await.unwrap(), 1);
        assert_eq!(scheduler.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn allow_duplicate_bypasses_the_filter() {
        let (scheduler, filter) = scheduler();
        let request = Request::get("http://example.test/a").unwrap().with_allow_duplicate(true);

        assert!(scheduler.schedule(request.clone()).await.unwrap());
        assert!(scheduler.schedule(request).await.unwrap());
        assert_eq!(filter.len().await.unwrap(), 0);
        assert_eq!(scheduler.pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn retried_request_is_admitted_again() {
        let (scheduler, _) = scheduler();
        let mut request = Request::get("http://example.test/a").unwrap();

        assert!(scheduler.schedule(request.clone()).await.unwrap());
        // The downloader increments retries before re-scheduling a timeout.
        request.retries += 1;
        assert!(scheduler.schedule(request).await.unwrap());
        assert_eq!(scheduler.pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn next_returns_scheduled_requests_in_order() {
        let (scheduler, _) = scheduler();
        scheduler.schedule(Request::get("http://example.test/1").unwrap()).await.unwrap();
        scheduler.schedule(Request::get("http://example.test/2").unwrap()).await.unwrap();

        assert_eq!(scheduler.next().await.unwrap().unwrap().url.path(), "/1");
        assert_eq!(scheduler.next().await.unwrap().unwrap().url.path(), "/2");
        assert!(scheduler.next().await.unwrap().is_none());
    }
}
