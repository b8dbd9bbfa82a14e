// Rex Core - Execution context
//
// The context is the mutable variable map a recipe executes against:
// heterogeneous JSON-like data navigated by dotted paths. The engine
// injects reserved metadata keys (recipe/session/step/stage) during
// execution; recipes may not claim those names for outputs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context keys the engine owns
pub const RESERVED_CONTEXT_KEYS: &[&str] = &["recipe", "session", "step", "stage"];

/// Internal key tracking condition- and empty-foreach-skipped steps
pub const SKIPPED_STEPS_KEY: &str = "_skipped_steps";

/// Mutable variable map for one recipe execution
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from an initial map
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Merge `other` over this context (other wins on key collisions)
    pub fn overlay(&mut self, other: Map<String, Value>) {
        for (k, v) in other {
            self.values.insert(k, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Walk a dotted path through nested objects
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// The whole context as a JSON value
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Record a step as skipped (guard condition false or empty foreach)
    pub fn record_skipped(&mut self, step_id: &str) {
        let skipped = self
            .values
            .entry(SKIPPED_STEPS_KEY)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = skipped {
            list.push(Value::String(step_id.to_string()));
        }
    }

    /// Step ids recorded as skipped
    pub fn skipped_steps(&self) -> Vec<String> {
        self.values
            .get(SKIPPED_STEPS_KEY)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<Map<String, Value>> for Context {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}
