//! Ordered item-processing stages.
//!
//! Sequential mode threads each item through the stages in ascending
//! order, every stage receiving its predecessor's return value; a stage
//! returning `None` ends the chain for that item. Parallel mode hands every
//! stage an independent clone of the original item. A faulting stage is
//! logged and the chain continues with the pre-fault item.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tracing::{debug, warn};

use trawler_common::Result;

use crate::item::Item;
use crate::signals::{Signal, SignalBus, SignalEvent};
use crate::spider::Spider;
use crate::workers::SyncPool;

#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Process one item. `Ok(None)` drops the item (sequential mode stops
    /// the chain); `Err` is a logged fault that leaves the item unchanged.
    async fn process(&self, spider: &Arc<dyn Spider>, item: Item) -> Result<Option<Item>>;
}

struct StageFn<F>(F);

#[async_trait]
impl<F> PipelineStage for StageFn<F>
where
    F: Fn(&Arc<dyn Spider>, Item) -> Result<Option<Item>> + Send + Sync,
{
    async fn process(&self, spider: &Arc<dyn Spider>, item: Item) -> Result<Option<Item>> {
        (self.0)(spider, item)
    }
}

/// Wrap a plain function as a pipeline stage.
pub fn stage_fn(
    f: impl Fn(&Arc<dyn Spider>, Item) -> Result<Option<Item>> + Send + Sync + 'static,
) -> Arc<dyn PipelineStage> {
    Arc::new(StageFn(f))
}

/// Adapter for genuinely blocking stages (file or database writes through
/// sync clients): the closure runs on the shared worker pool.
pub struct BlockingStage {
    process: Arc<dyn Fn(Item) -> Result<Option<Item>> + Send + Sync>,
}

impl BlockingStage {
    pub fn new(process: impl Fn(Item) -> Result<Option<Item>> + Send + Sync + 'static) -> Self {
        Self { process: Arc::new(process) }
    }
}

#[async_trait]
impl PipelineStage for BlockingStage {
    async fn process(&self, _spider: &Arc<dyn Spider>, item: Item) -> Result<Option<Item>> {
        let process = self.process.clone();
        SyncPool::global().run(move || process(item)).await?
    }
}

#[derive(Default, Clone)]
pub struct PipelineRegistry {
    stages: Vec<(i32, Arc<dyn PipelineStage>)>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under an order key (ascending, stable on ties).
    pub fn stage(mut self, order: i32, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.push((order, stage));
        self.stages.sort_by_key(|(order, _)| *order);
        self
    }

    pub fn merge(mut self, other: PipelineRegistry) -> Self {
        self.stages.extend(other.stages);
        self.stages.sort_by_key(|(order, _)| *order);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub(crate) async fn dispatch(
        &self,
        spider: &Arc<dyn Spider>,
        item: Item,
        parallel: bool,
        signals: &SignalBus,
    ) {
        if self.stages.is_empty() {
            debug!(spider = spider.name(), "Item emitted with no pipeline stages registered");
            return;
        }
        if parallel {
            let runs = self
                .stages
                .iter()
                .map(|(order, stage)| {
                    let item = item.clone();
                    async move { (*order, stage.process(spider, item).await) }
                })
                .collect::<Vec<_>>();
            for (order, outcome) in future::join_all(runs).await {
                if let Err(error) = outcome {
                    warn!(spider = spider.name(), order, error = %error,
                        "Pipeline stage fault (parallel); continuing");
                }
            }
            return;
        }

        let mut current = item;
        for (order, stage) in &self.stages {
            match stage.process(spider, current.clone()).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    debug!(spider = spider.name(), order, "Pipeline dropped item");
                    signals.emit(
                        SignalEvent::new(Signal::ItemDropped, spider.name()).with("order", *order),
                    );
                    return;
                }
                Err(error) => {
                    warn!(spider = spider.name(), order, error = %error,
                        "Pipeline stage fault; continuing with previous item");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Mutex;

    use crate::response::Response;
    use crate::spider::{CallbackStream, SpiderOutput};

    struct Quiet;

    impl Spider for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }

        fn parse(self: Arc<Self>, _response: Response) -> CallbackStream {
            Box::pin(stream::empty::<trawler_common::Result<SpiderOutput>>())
        }
    }

    fn adder(key: &'static str, value: i64) -> Arc<dyn PipelineStage> {
        stage_fn(move |_, mut item| {
            item.insert(key, value);
            Ok(Some(item))
        })
    }

    #[tokio::test]
    async fn sequential_stages_thread_the_item_through() {
        let spider: Arc<dyn Spider> = Arc::new(Quiet);
        let seen_by_second = Arc::new(Mutex::new(None));
        let store = Arc::new(Mutex::new(None));

        let seen = seen_by_second.clone();
        let second = stage_fn(move |_, mut item| {
            *seen.lock().unwrap() = Some(item.clone());
            item.insert("s2", 2);
            Ok(Some(item))
        });
        let sink_store = store.clone();
        let sink = stage_fn(move |_, item| {
            *sink_store.lock().unwrap() = Some(item);
            Ok(None)
        });

        let registry = PipelineRegistry::new()
            .stage(1, adder("s1", 1))
            .stage(2, second)
            .stage(3, sink);

        registry.dispatch(&spider, Item::empty(), false, &SignalBus::new()).await;

        let observed = seen_by_second.lock().unwrap().clone().unwrap();
        assert_eq!(observed.get("s1"), Some(&serde_json::Value::from(1)));

        let stored = store.lock().unwrap().clone().unwrap();
        assert_eq!(stored.get("s1"), Some(&serde_json::Value::from(1)));
        assert_eq!(stored.get("s2"), Some(&serde_json::Value::from(2)));
    }

    #[tokio::test]
    async fn returning_none_ends_the_chain_and_emits_item_dropped() {
        let spider: Arc<dyn Spider> = Arc::new(Quiet);
        let downstream_ran = Arc::new(Mutex::new(false));
        let bus = SignalBus::new();
        let drops = Arc::new(Mutex::new(0usize));
        let drops_in = drops.clone();
        bus.subscribe(Signal::ItemDropped, move |_| {
            *drops_in.lock().unwrap() += 1;
            Ok(())
        });

        let ran = downstream_ran.clone();
        let registry = PipelineRegistry::new()
            .stage(1, stage_fn(|_, _| Ok(None)))
            .stage(2, stage_fn(move |_, item| {
                *ran.lock().unwrap() = true;
                Ok(Some(item))
            }));

        registry.dispatch(&spider, Item::empty(), false, &bus).await;
        assert!(!*downstream_ran.lock().unwrap());
        assert_eq!(*drops.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn a_faulting_stage_passes_the_previous_item_on() {
        let spider: Arc<dyn Spider> = Arc::new(Quiet);
        let store = Arc::new(Mutex::new(None));

        let sink_store = store.clone();
        let registry = PipelineRegistry::new()
            .stage(1, adder("s1", 1))
            .stage(2, stage_fn(|_, _| {
                Err(trawler_common::TrawlError::Pipeline("stage broke".to_string()))
            }))
            .stage(3, stage_fn(move |_, item| {
                *sink_store.lock().unwrap() = Some(item);
                Ok(None)
            }));

        registry.dispatch(&spider, Item::empty(), false, &SignalBus::new()).await;
        let stored = store.lock().unwrap().clone().unwrap();
        assert_eq!(stored.get("s1"), Some(&serde_json::Value::from(1)));
    }

    #[tokio::test]
    async fn parallel_stages_see_the_original_item() {
        let spider: Arc<dyn Spider> = Arc::new(Quiet);
        let inputs = Arc::new(Mutex::new(Vec::new()));

        let mut registry = PipelineRegistry::new();
        for _ in 0..2 {
            let inputs = inputs.clone();
            registry = registry.stage(1, stage_fn(move |_, mut item| {
                inputs.lock().unwrap().push(item.clone());
                item.insert("touched", true);
                Ok(Some(item))
            }));
        }

        let mut original = Item::empty();
        original.insert("seed", 1);
        registry.dispatch(&spider, original.clone(), true, &SignalBus::new()).await;

        let inputs = inputs.lock().unwrap();
        assert_eq!(inputs.len(), 2);
        for input in inputs.iter() {
            assert_eq!(input, &original);
        }
    }

    #[tokio::test]
    async fn blocking_stage_runs_on_the_pool() {
        let spider: Arc<dyn Spider> = Arc::new(Quiet);
        let stage = BlockingStage::new(|mut item| {
            item.insert("blocking", true);
            Ok(Some(item))
        });
        let out = stage.process(&spider, Item::empty()).await.unwrap().unwrap();
        assert_eq!(out.get("blocking"), Some(&serde_json::Value::from(true)));
    }

    #[test]
    fn merge_keeps_ascending_order() {
        let left = PipelineRegistry::new().stage(3, adder("a", 1)).stage(1, adder("b", 2));
        let right = PipelineRegistry::new().stage(2, adder("c", 3));
        let merged = left.merge(right);
        let orders: Vec<i32> = merged.stages.iter().map(|(order, _)| *order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }
}
