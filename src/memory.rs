//! Process-wide key-value memory store (spec.md §3 "Memory values are
//! process-wide state behind the key-value store", §4.3 template resolver).
//!
//! Grounded in the teacher's `DashMap`-backed registries (`module_registry.rs`,
//! `ModuleRegistry`) for the concurrent-map idiom; this store has no
//! analogue of its own in the teacher since RTFS keeps state in its
//! evaluator environment rather than a shared kv store.

use dashmap::DashMap;
use serde_json::Value as Json;

/// Persists key-value pairs across plans for the lifetime of the process.
pub struct MemoryStore {
    values: DashMap<String, Json>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    pub fn write(&self, key: &str, value: Json) {
        self.values.insert(key.to_string(), value);
    }

    pub fn read(&self, key: &str) -> Option<Json> {
        self.values.get(key).map(|v| v.clone())
    }

    /// Reads multiple keys at once, for building a `ResolutionContext`
    /// (`template.rs`) before dispatching an action's params.
    pub fn read_many(&self, keys: &[String]) -> std::collections::BTreeMap<String, Json> {
        keys.iter()
            .filter_map(|k| self.read(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn delete(&self, key: &str) -> Option<Json> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let store = MemoryStore::new();
        store.write("token", Json::String("abc".to_string()));
        assert_eq!(store.read("token"), Some(Json::String("abc".to_string())));
    }

    #[test]
    fn read_many_skips_missing_keys() {
        let store = MemoryStore::new();
        store.write("a", Json::from(1));
        let result = store.read_many(&["a".to_string(), "missing".to_string()]);
        assert_eq!(result.len(), 1);
        assert_eq!(result.get("a"), Some(&Json::from(1)));
    }

    #[test]
    fn delete_removes_value() {
        let store = MemoryStore::new();
        store.write("k", Json::from(true));
        assert!(store.delete("k").is_some());
        assert!(store.read("k").is_none());
    }
}
