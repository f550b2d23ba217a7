use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// Per-cycle key/value scope handed to the executor.  Cheap to clone; all
/// clones see the same map.  Last writer wins.
#[derive(Debug, Clone, Default)]
pub struct SharedData {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl SharedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.read().await.contains_key(key)
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().await.remove(key)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Copy of the whole scope as a JSON object with sorted keys.
    pub async fn snapshot(&self) -> Map<String, Value> {
        let guard = self.inner.read().await;
        let mut keys: Vec<&String> = guard.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| (key.clone(), guard[key].clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn clones_share_one_scope() {
        let scope = SharedData::new();
        let writer = scope.clone();
        writer.set("topic", json!("rust")).await;

        assert!(scope.has("topic").await);
        assert_eq!(scope.get("topic").await, Some(json!("rust")));
        assert_eq!(scope.get("missing").await, None);
    }

    #[tokio::test]
    async fn last_writer_wins_and_remove() {
        let scope = SharedData::new();
        scope.set("k", json!(1)).await;
        scope.set("k", json!(2)).await;
        assert_eq!(scope.remove("k").await, Some(json!(2)));
        assert!(scope.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_writers_all_land() {
        let scope = SharedData::new();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let scope = scope.clone();
            tasks.push(tokio::spawn(async move {
                scope.set(format!("key{i:02}"), json!(i)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = scope.snapshot().await;
        assert_eq!(snapshot.len(), 16);
        assert_eq!(snapshot.keys().next().map(String::as_str), Some("key00"));
    }
}
