use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use trawler_common::Result;

use crate::request::Request;

/// Ordered store of pending requests.
///
/// Asynchronous like the filter, for the same reason: the shared-queue
/// variant talks to a remote backend, the local deque answers immediately.
#[async_trait]
pub trait SchedulerContainer: Send + Sync {
    async fn push(&self, request: Request) -> Result<()>;
    async fn pop(&self) -> Result<Option<Request>>;
    async fn len(&self) -> Result<usize>;
}

/// FIFO deque for single-process crawls.
#[derive(Default)]
pub struct MemoryQueue {
    queue: Mutex<VecDeque<Request>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerContainer for MemoryQueue {
    async fn push(&self, request: Request) -> Result<()> {
        self.queue.lock().unwrap().push_back(request);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Request>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.queue.lock().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_and_empty_pop() {
        let queue = MemoryQueue::new();
        assert!(queue.pop().await.unwrap().is_none());

        queue.push(Request::get("http://example.test/1").unwrap()).await.unwrap();
        queue.push(Request::get("http://example.test/2").unwrap()).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let first = queue.pop().await.unwrap().unwrap();
        assert_eq!(first.url.path(), "/1");
        let second = queue.pop().await.unwrap().unwrap();
        assert_eq!(second.url.path(), "/2");
        assert!(queue.pop().await.unwrap().is_none());
    }
}
