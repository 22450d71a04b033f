//! Integration tests against a real Redis via testcontainers.
//! Requires Docker. Skipped in environments without Docker.

use std::sync::Arc;

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

use trawler_engine::testing::{FetchOutcome, MockFetcher, ScriptedSpider};
use trawler_engine::{
    Config, DuplicateFilter, Engine, Request, SchedulerContainer, SessionHandle, SignalBus,
};
use trawler_redis::{RedisFilter, RedisQueue};

async fn redis_container() -> (ContainerAsync<GenericImage>, String) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("Failed to start Redis container");
    let host = container.get_host().await.expect("container host");
    let port = container.get_host_port_ipv4(6379).await.expect("container port");
    (container, format!("redis://{host}:{port}"))
}

#[tokio::test]
async fn queue_round_trips_requests_between_peers() {
    let (_container, url) = redis_container().await;

    // Two containers on the same prefix act as peer engines.
    let producer = RedisQueue::connect(&url, "itest").await.unwrap();
    let consumer = RedisQueue::connect(&url, "itest").await.unwrap();

    let request = Request::post("http://example.test/submit")
        .unwrap()
        .with_header("X-Probe", "1")
        .with_meta("depth", 2);
    producer.push(request.clone()).await.unwrap();
    producer.flush().await.unwrap();

    let popped = consumer.pop().await.unwrap().expect("request from remote");
    assert_eq!(popped.url, request.url);
    assert_eq!(popped.method, "POST");
    assert_eq!(popped.headers, request.headers);
    assert_eq!(popped.meta, request.meta);

    assert!(consumer.pop().await.unwrap().is_none());
    assert_eq!(producer.len().await.unwrap(), 0);
}

#[tokio::test]
async fn filter_is_shared_across_connections() {
    let (_container, url) = redis_container().await;

    let first = RedisFilter::connect(&url, "ftest").await.unwrap();
    let second = RedisFilter::connect(&url, "ftest").await.unwrap();

    assert!(!first.contains("fp-1").await.unwrap());
    first.add("fp-1").await.unwrap();
    first.add("fp-1").await.unwrap();
    first.add("fp-2").await.unwrap();

    assert!(second.contains("fp-1").await.unwrap());
    assert!(!second.contains("fp-3").await.unwrap());
    assert_eq!(second.len().await.unwrap(), 2);
}

#[tokio::test]
async fn session_bound_requests_stay_local_and_pop_first() {
    let (_container, url) = redis_container().await;
    let queue = RedisQueue::connect(&url, "stest").await.unwrap();

    queue.push(Request::get("http://example.test/remote").unwrap()).await.unwrap();
    queue.flush().await.unwrap();

    let local = Request::get("http://example.test/local")
        .unwrap()
        .with_session(SessionHandle::new(7u32));
    queue.push(local).await.unwrap();

    // The non-serializable request never reached Redis and wins the pop.
    let first = queue.pop().await.unwrap().unwrap();
    assert_eq!(first.url.path(), "/local");
    assert!(first.session.is_some());

    let second = queue.pop().await.unwrap().unwrap();
    assert_eq!(second.url.path(), "/remote");
}

#[tokio::test]
async fn registered_backends_resolve_from_config_names() {
    let (_container, url) = redis_container().await;
    trawler_redis::register();

    let fetcher = Arc::new(
        MockFetcher::new().on("http://example.test/a", FetchOutcome::ok(200, "ok")),
    );
    let spider = ScriptedSpider::new("registered").with_start_urls(&["http://example.test/a"]);

    let mut config = Config::default();
    config.duplicate_filter_impl = "redis".to_string();
    config.scheduler_container_impl = "redis".to_string();
    config.redis_url = url.clone();
    config.redis_prefix = "rtest".to_string();
    config.distributed_mode = true;

    // No explicit filter or container: both come out of the constructor
    // registry under the names the config selects.
    let engine = Engine::builder(Arc::new(spider), Arc::new(config))
        .fetcher(fetcher.clone())
        .signals(Arc::new(SignalBus::new()))
        .build()
        .await
        .unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(report.responses, 1);

    // The crawl's fingerprint landed on the shared backend, so the engine
    // really scheduled through Redis rather than the in-memory builtins.
    let filter = RedisFilter::connect(&url, "rtest").await.unwrap();
    assert_eq!(filter.len().await.unwrap(), 1);
}

#[tokio::test]
async fn an_engine_crawls_through_the_shared_backend() {
    let (_container, url) = redis_container().await;

    let fetcher = Arc::new(
        MockFetcher::new().on("http://example.test/a", FetchOutcome::ok(200, "shared")),
    );
    let spider = ScriptedSpider::new("distributed").with_start_urls(&["http://example.test/a"]);

    let mut config = Config::default();
    config.distributed_mode = true;

    let engine = Engine::builder(Arc::new(spider), Arc::new(config))
        .filter(Arc::new(RedisFilter::connect(&url, "etest").await.unwrap()))
        .container(Arc::new(RedisQueue::connect(&url, "etest").await.unwrap()))
        .fetcher(fetcher.clone())
        .signals(Arc::new(SignalBus::new()))
        .build()
        .await
        .unwrap();

    let report = engine.run().await.unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(report.responses, 1);
}
