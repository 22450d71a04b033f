use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An opaque record emitted by a spider callback.
///
/// The engine never inspects the payload; it only carries items from the
/// callback that produced them into the pipeline registry. Pipeline stages
/// own whatever schema the payload follows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub data: Value,
}

impl Item {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn empty() -> Self {
        Self { data: Value::Object(Map::new()) }
    }

    /// Insert a key into the payload, coercing it to an object first if a
    /// stage replaced it with something else.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|map| map.get(key))
    }
}
