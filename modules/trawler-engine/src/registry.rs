//! Constructor registries for configuration-selected implementations.
//!
//! `duplicate_filter_impl`, `scheduler_container_impl`, and `fetcher_impl`
//! are stable names resolved here at engine build. Out-of-tree backends
//! (the redis module, custom fetchers) register themselves at process
//! start; an unresolved name is a startup-aborting misconfiguration.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use futures::future::BoxFuture;

use trawler_common::{Config, Result, TrawlError};

use crate::container::{MemoryQueue, SchedulerContainer};
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::filter::{DuplicateFilter, MemoryFilter};

pub type FilterCtor =
    Arc<dyn Fn(Config) -> BoxFuture<'static, Result<Arc<dyn DuplicateFilter>>> + Send + Sync>;
pub type ContainerCtor =
    Arc<dyn Fn(Config) -> BoxFuture<'static, Result<Arc<dyn SchedulerContainer>>> + Send + Sync>;
pub type FetcherCtor =
    Arc<dyn Fn(Config) -> BoxFuture<'static, Result<Arc<dyn Fetcher>>> + Send + Sync>;

#[derive(Default)]
struct ComponentRegistry {
    filters: HashMap<String, FilterCtor>,
    containers: HashMap<String, ContainerCtor>,
    fetchers: HashMap<String, FetcherCtor>,
}

fn registry() -> &'static RwLock<ComponentRegistry> {
    static REGISTRY: OnceLock<RwLock<ComponentRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut components = ComponentRegistry::default();
        components.filters.insert(
            "memory".to_string(),
            Arc::new(|_| Box::pin(async { Ok(Arc::new(MemoryFilter::new()) as Arc<dyn DuplicateFilter>) })),
        );
        components.containers.insert(
            "memory".to_string(),
            Arc::new(|_| Box::pin(async { Ok(Arc::new(MemoryQueue::new()) as Arc<dyn SchedulerContainer>) })),
        );
        components.fetchers.insert(
            "http".to_string(),
            Arc::new(|_| Box::pin(async { Ok(Arc::new(HttpFetcher::new()) as Arc<dyn Fetcher>) })),
        );
        RwLock::new(components)
    })
}

pub fn register_filter(name: &str, ctor: FilterCtor) {
    registry().write().unwrap().filters.insert(name.to_string(), ctor);
}

pub fn register_container(name: &str, ctor: ContainerCtor) {
    registry().write().unwrap().containers.insert(name.to_string(), ctor);
}

pub fn register_fetcher(name: &str, ctor: FetcherCtor) {
    registry().write().unwrap().fetchers.insert(name.to_string(), ctor);
}

pub async fn resolve_filter(name: &str, config: &Config) -> Result<Arc<dyn DuplicateFilter>> {
    let ctor = registry()
        .read()
        .unwrap()
        .filters
        .get(name)
        .cloned()
        .ok_or_else(|| TrawlError::Misconfigured(format!("no duplicate filter named '{name}'")))?;
    ctor(config.clone()).await
}

pub async fn resolve_container(name: &str, config: &Config) -> Result<Arc<dyn SchedulerContainer>> {
    let ctor = registry()
        .read()
        .unwrap()
        .containers
        .get(name)
        .cloned()
        .ok_or_else(|| {
            TrawlError::Misconfigured(format!("no scheduler container named '{name}'"))
        })?;
    ctor(config.clone()).await
}

pub async fn resolve_fetcher(name: &str, config: &Config) -> Result<Arc<dyn Fetcher>> {
    let ctor = registry()
        .read()
        .unwrap()
        .fetchers
        .get(name)
        .cloned()
        .ok_or_else(|| TrawlError::Misconfigured(format!("no fetcher named '{name}'")))?;
    ctor(config.clone()).await
}
