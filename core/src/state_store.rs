//! Copy-on-write key/value rack for introspection values.
//!
//! Readers grab the current snapshot; a writer copies the map, mutates the
//! copy and publishes it, so a concurrent reader sees either the old or the
//! new map, never a torn mix. JSON renderings are cached per key and thrown
//! away when the key is overwritten.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use serde_json::Value;

type Rack = HashMap<String, Value>;

#[derive(Debug, Default)]
pub struct StateStore {
    rack: RwLock<Arc<Rack>>,
    json_cache: Mutex<HashMap<String, Arc<str>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, key: &str) -> Option<Value> {
        self.snapshot().get(key).cloned()
    }

    /// Current snapshot of the whole rack.
    pub fn snapshot(&self) -> Arc<Rack> {
        self.rack.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn store(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        {
            let mut slot = self.rack.write().unwrap_or_else(|e| e.into_inner());
            let mut next: Rack = (**slot).clone();
            next.insert(key.clone(), value);
            *slot = Arc::new(next);
        }
        self.json_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    /// Cached JSON rendering of one key, recomputed lazily after a store.
    pub fn get_as_json(&self, key: &str) -> Option<Arc<str>> {
        let mut cache = self.json_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(key) {
            return Some(cached.clone());
        }
        let value = self.load(key)?;
        let rendered: Arc<str> = serde_json::to_string(&value).ok()?.into();
        cache.insert(key.to_string(), rendered.clone());
        Some(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn load_after_store_returns_the_value() {
        let store = StateStore::new();
        assert_eq!(store.load("missing"), None);
        store.store("edition", json!({"version": "1.1.0"}));
        assert_eq!(store.load("edition"), Some(json!({"version": "1.1.0"})));
    }

    #[test]
    fn snapshots_are_immutable() {
        let store = StateStore::new();
        store.store("a", json!(1));
        let before = store.snapshot();
        store.store("a", json!(2));
        assert_eq!(before.get("a"), Some(&json!(1)));
        assert_eq!(store.load("a"), Some(json!(2)));
    }

    #[test]
    fn json_cache_invalidates_on_store() {
        let store = StateStore::new();
        store.store("k", json!("one"));
        assert_eq!(store.get_as_json("k").as_deref(), Some("\"one\""));
        store.store("k", json!("two"));
        assert_eq!(store.get_as_json("k").as_deref(), Some("\"two\""));
    }

    #[test]
    fn concurrent_readers_never_see_a_torn_map() {
        let store = Arc::new(StateStore::new());
        store.store("counter", json!(0));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    store.store("counter", json!(i));
                }
            })
        };
        for _ in 0..1000 {
            let snapshot = store.snapshot();
            assert!(snapshot.contains_key("counter"));
        }
        writer.join().expect("writer");
    }
}
