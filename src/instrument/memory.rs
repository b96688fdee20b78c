use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::bus::lock;

/// Live parameter values of one instrument. Cloning shares the same map, so
/// the request path and the cyclic worker see each other's writes.
#[derive(Debug, Clone, Default)]
pub struct SharedMemory {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded<I>(defaults: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            values: Arc::new(Mutex::new(defaults.into_iter().collect())),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    /// Stores `value` and returns the previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        lock(&self.values).insert(key.into(), value)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        lock(&self.values).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.values).is_empty()
    }
}
