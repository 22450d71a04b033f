//! Named lifecycle signals with pluggable receivers.
//!
//! A process-global bus is the default wiring; engines accept a private bus
//! so tests can observe one crawl in isolation. Receivers run in
//! registration order and their errors are swallowed and logged — a broken
//! observer never aborts a crawl.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    SpiderStart,
    SpiderException,
    SpiderClose,
    EngineStart,
    EngineIdle,
    EngineClose,
    RequestDropped,
    RequestScheduled,
    ResponseReceived,
    ResponseDownloaded,
    ItemDropped,
}

impl Signal {
    pub const ALL: [Signal; 11] = [
        Signal::SpiderStart,
        Signal::SpiderException,
        Signal::SpiderClose,
        Signal::EngineStart,
        Signal::EngineIdle,
        Signal::EngineClose,
        Signal::RequestDropped,
        Signal::RequestScheduled,
        Signal::ResponseReceived,
        Signal::ResponseDownloaded,
        Signal::ItemDropped,
    ];
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Signal::SpiderStart => "spider_start",
            Signal::SpiderException => "spider_exception",
            Signal::SpiderClose => "spider_close",
            Signal::EngineStart => "engine_start",
            Signal::EngineIdle => "engine_idle",
            Signal::EngineClose => "engine_close",
            Signal::RequestDropped => "request_dropped",
            Signal::RequestScheduled => "request_scheduled",
            Signal::ResponseReceived => "response_received",
            Signal::ResponseDownloaded => "response_downloaded",
            Signal::ItemDropped => "item_dropped",
        };
        f.write_str(name)
    }
}

/// One emitted event: the signal, the sending spider, and free-form fields.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub signal: Signal,
    pub spider: String,
    pub fields: Map<String, Value>,
}

impl SignalEvent {
    pub fn new(signal: Signal, spider: &str) -> Self {
        Self { signal, spider: spider.to_string(), fields: Map::new() }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

type Receiver = Arc<dyn Fn(&SignalEvent) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by `subscribe`; hand it back to `unsubscribe`.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionId {
    signal: Signal,
    id: u64,
}

#[derive(Default)]
pub struct SignalBus {
    receivers: Mutex<HashMap<Signal, Vec<(u64, Receiver)>>>,
    next_id: AtomicU64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus used when an engine is not given its own.
    pub fn global() -> Arc<SignalBus> {
        static GLOBAL: OnceLock<Arc<SignalBus>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SignalBus::new())).clone()
    }

    pub fn subscribe(
        &self,
        signal: Signal,
        receiver: impl Fn(&SignalEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut receivers = self.receivers.lock().unwrap();
        receivers.entry(signal).or_default().push((id, Arc::new(receiver)));
        SubscriptionId { signal, id }
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut receivers = self.receivers.lock().unwrap();
        if let Some(list) = receivers.get_mut(&subscription.signal) {
            list.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Invoke receivers in registration order. Runs outside the lock so a
    /// receiver may subscribe or unsubscribe reentrantly.
    pub fn emit(&self, event: SignalEvent) {
        let receivers: Vec<Receiver> = {
            let map = self.receivers.lock().unwrap();
            match map.get(&event.signal) {
                Some(list) => list.iter().map(|(_, r)| r.clone()).collect(),
                None => return,
            }
        };
        for receiver in receivers {
            if let Err(error) = receiver(&event) {
                warn!(signal = %event.signal, spider = %event.spider, error = %error,
                    "Signal receiver failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receivers_run_in_registration_order() {
        let bus = SignalBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(Signal::EngineStart, move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }
        bus.emit(SignalEvent::new(Signal::EngineStart, "s"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn a_failing_receiver_does_not_stop_the_rest() {
        let bus = SignalBus::new();
        let hits = Arc::new(Mutex::new(0usize));

        bus.subscribe(Signal::ItemDropped, |_| anyhow::bail!("observer broke"));
        let hits_in = hits.clone();
        bus.subscribe(Signal::ItemDropped, move |_| {
            *hits_in.lock().unwrap() += 1;
            Ok(())
        });

        bus.emit(SignalEvent::new(Signal::ItemDropped, "s"));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_removes_the_receiver() {
        let bus = SignalBus::new();
        let hits = Arc::new(Mutex::new(0usize));

        let hits_in = hits.clone();
        let token = bus.subscribe(Signal::SpiderClose, move |_| {
            *hits_in.lock().unwrap() += 1;
            Ok(())
        });

        bus.emit(SignalEvent::new(Signal::SpiderClose, "s"));
        bus.unsubscribe(token);
        bus.emit(SignalEvent::new(Signal::SpiderClose, "s"));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn events_carry_fields() {
        let event = SignalEvent::new(Signal::RequestDropped, "s")
            .with("url", "http://example.test")
            .with("reason", "duplicate");
        assert_eq!(event.field("reason"), Some(&Value::from("duplicate")));
    }
}
