//! Redis-backed duplicate filter and scheduler container for distributed
//! crawls.
//!
//! Peer engines share two keys: `{prefix}:requests`, a list of serialized
//! requests (push to tail, pop from head), and `{prefix}:fingerprints`, a
//! set of seen fingerprints. Requests that cannot cross the wire (live
//! session handles) stay in a per-container local fallback.
//!
//! Call [`register`] at process start, then select the backends with
//! `TRAWLER_DUPLICATE_FILTER_IMPL=redis` and
//! `TRAWLER_SCHEDULER_CONTAINER_IMPL=redis`.

pub mod filter;
pub mod queue;

use std::sync::Arc;

use redis::aio::ConnectionManager;

use trawler_common::{Result, TrawlError};
use trawler_engine::registry;
use trawler_engine::{DuplicateFilter, SchedulerContainer};

pub use filter::RedisFilter;
pub use queue::RedisQueue;

pub(crate) async fn connection(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)
        .map_err(|e| TrawlError::Backend(format!("redis url {url}: {e}")))?;
    client
        .get_connection_manager()
        .await
        .map_err(|e| TrawlError::Backend(format!("redis connect {url}: {e}")))
}

pub(crate) fn backend_error(e: redis::RedisError) -> TrawlError {
    TrawlError::Backend(e.to_string())
}

/// Register the redis backends under the name `redis`.
pub fn register() {
    registry::register_filter(
        "redis",
        Arc::new(|config| {
            Box::pin(async move {
                let filter = RedisFilter::connect(&config.redis_url, &config.redis_prefix).await?;
                Ok(Arc::new(filter) as Arc<dyn DuplicateFilter>)
            })
        }),
    );
    registry::register_container(
        "redis",
        Arc::new(|config| {
            Box::pin(async move {
                let queue = RedisQueue::connect(&config.redis_url, &config.redis_prefix).await?;
                Ok(Arc::new(queue) as Arc<dyn SchedulerContainer>)
            })
        }),
    );
}
