//! Host for one or more engines on the shared runtime.
//!
//! The runner wires spiders to engines, validates seeds and connectivity
//! before anything spawns, runs every engine concurrently, and fans
//! pause/resume/stop out to all of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info};

use trawler_common::{Config, Result, TrawlError};

use crate::engine::{CrawlReport, Engine, EngineHandle};
use crate::middleware::MiddlewareRegistry;
use crate::pipeline::PipelineRegistry;
use crate::request::Request;
use crate::signals::SignalBus;
use crate::spider::Spider;

/// Named spider constructors: the configuration-driven replacement for
/// module introspection. Embedders register every concrete spider once and
/// select by name at run time.
#[derive(Default)]
pub struct SpiderRegistry {
    ctors: HashMap<String, Arc<dyn Fn() -> Arc<dyn Spider> + Send + Sync>>,
}

impl SpiderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; the registry key is the spider's own name.
    pub fn register(&mut self, ctor: impl Fn() -> Arc<dyn Spider> + Send + Sync + 'static) {
        let name = ctor().name().to_string();
        self.ctors.insert(name, Arc::new(ctor));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str) -> Option<Arc<dyn Spider>> {
        self.ctors.get(name).map(|ctor| ctor())
    }
}

pub struct Runner {
    config: Arc<Config>,
    middleware: Option<Arc<MiddlewareRegistry>>,
    pipelines: Option<Arc<PipelineRegistry>>,
    signals: Option<Arc<SignalBus>>,
    handles: Mutex<Vec<EngineHandle>>,
}

impl Runner {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            middleware: None,
            pipelines: None,
            signals: None,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Registries applied to every spider that does not override its own.
    pub fn with_middleware(mut self, middleware: Arc<MiddlewareRegistry>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    pub fn with_pipelines(mut self, pipelines: Arc<PipelineRegistry>) -> Self {
        self.pipelines = Some(pipelines);
        self
    }

    pub fn with_signals(mut self, signals: Arc<SignalBus>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub async fn run_single(&self, spider: Arc<dyn Spider>) -> Result<CrawlReport> {
        let mut reports = self.run_many(vec![spider]).await?;
        Ok(reports.remove(0))
    }

    /// One engine per spider, concurrently. Startup validation (healthcheck
    /// probe, seed URLs) happens before any engine spawns, so a bad spider
    /// aborts the whole run instead of half-starting it.
    pub async fn run_many(&self, spiders: Vec<Arc<dyn Spider>>) -> Result<Vec<CrawlReport>> {
        if spiders.is_empty() {
            return Err(TrawlError::Misconfigured("no spiders to run".to_string()));
        }
        self.healthcheck().await?;
        for spider in &spiders {
            validate_start_urls(spider.as_ref())?;
        }

        let mut engines = Vec::with_capacity(spiders.len());
        for spider in spiders {
            let mut builder = Engine::builder(spider, self.config.clone());
            if let Some(middleware) = &self.middleware {
                builder = builder.middleware(middleware.clone());
            }
            if let Some(pipelines) = &self.pipelines {
                builder = builder.pipelines(pipelines.clone());
            }
            if let Some(signals) = &self.signals {
                builder = builder.signals(signals.clone());
            }
            let engine = builder.build().await?;
            self.handles.lock().unwrap().push(engine.handle());
            engines.push(engine);
        }

        let names: Vec<String> =
            self.handles.lock().unwrap().iter().map(|h| h.spider_name()).collect();
        info!(spiders = names.join(","), "Starting crawl");

        let joins: Vec<_> = engines.into_iter().map(|engine| tokio::spawn(engine.run())).collect();

        let mut reports = Vec::new();
        let mut first_error = None;
        for join in joins {
            match join.await {
                Ok(Ok(report)) => {
                    info!(%report, "Spider finished");
                    reports.push(report);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Engine failed");
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(error = %join_error, "Engine task died");
                    first_error.get_or_insert(TrawlError::Anyhow(anyhow::anyhow!(join_error)));
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(reports),
        }
    }

    /// Run registered spiders — every one, or only those named.
    pub async fn run_registered(
        &self,
        registry: &SpiderRegistry,
        names: &[String],
    ) -> Result<Vec<CrawlReport>> {
        let selected: Vec<String> = if names.is_empty() {
            registry.names()
        } else {
            names.to_vec()
        };
        let mut spiders = Vec::new();
        for name in &selected {
            let spider = registry
                .build(name)
                .ok_or_else(|| TrawlError::Misconfigured(format!("no spider named '{name}'")))?;
            spiders.push(spider);
        }
        self.run_many(spiders).await
    }

    pub fn pause_all(&self) {
        for handle in self.handles.lock().unwrap().iter() {
            handle.pause();
        }
    }

    pub fn resume_all(&self) {
        for handle in self.handles.lock().unwrap().iter() {
            handle.resume();
        }
    }

    pub fn stop_all(&self) {
        for handle in self.handles.lock().unwrap().iter() {
            handle.stop();
        }
    }

    /// Outbound connectivity probe. Configured and unreachable means the
    /// run refuses to start.
    async fn healthcheck(&self) -> Result<()> {
        let Some(url) = &self.config.healthcheck_url else {
            return Ok(());
        };
        let client = reqwest::Client::new();
        let response = client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                TrawlError::Misconfigured(format!("healthcheck {url} unreachable: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(TrawlError::Misconfigured(format!(
                "healthcheck {url} returned status {}",
                response.status()
            )));
        }
        info!(url = %url, "Healthcheck passed");
        Ok(())
    }
}

fn validate_start_urls(spider: &dyn Spider) -> Result<()> {
    for url in spider.start_urls() {
        Request::get(&url).map_err(|e| {
            error!(spider = spider.name(), url = %url, "Invalid start URL");
            e
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;

    use crate::response::Response;
    use crate::spider::{CallbackStream, SpiderOutput};

    struct Named(&'static str, Vec<String>);

    impl Spider for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn start_urls(&self) -> Vec<String> {
            self.1.clone()
        }

        fn parse(self: Arc<Self>, _response: Response) -> CallbackStream {
            Box::pin(stream::empty::<trawler_common::Result<SpiderOutput>>())
        }
    }

    #[test]
    fn registry_builds_by_name() {
        let mut registry = SpiderRegistry::new();
        registry.register(|| Arc::new(Named("alpha", vec![])));
        registry.register(|| Arc::new(Named("beta", vec![])));

        assert_eq!(registry.names(), vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(registry.build("alpha").unwrap().name(), "alpha");
        assert!(registry.build("gamma").is_none());
    }

    #[tokio::test]
    async fn empty_spider_list_is_a_misconfiguration() {
        let runner = Runner::new(Arc::new(Config::default()));
        assert!(matches!(
            runner.run_many(vec![]).await,
            Err(TrawlError::Misconfigured(_))
        ));
    }

    #[tokio::test]
    async fn invalid_start_urls_abort_startup() {
        let runner = Runner::new(Arc::new(Config::default()));
        let spider: Arc<dyn Spider> = Arc::new(Named("bad", vec!["".to_string()]));
        assert!(matches!(
            runner.run_many(vec![spider]).await,
            Err(TrawlError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn unknown_registered_name_is_a_misconfiguration() {
        let runner = Runner::new(Arc::new(Config::default()));
        let registry = SpiderRegistry::new();
        assert!(matches!(
            runner.run_registered(&registry, &["ghost".to_string()]).await,
            Err(TrawlError::Misconfigured(_))
        ));
    }
}
