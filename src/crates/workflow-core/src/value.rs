use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

/// The per-run mapping from unit identifier to its last output, plus the
/// ambient cancellation signal every unit and the executor observe.
///
/// This is the sole read/write surface units see. It is mutated only by the
/// executor, strictly between unit completions — condition and template
/// evaluation only ever read it. Once a unit's entry is written it is never
/// removed for the duration of the run (spec invariant).
#[derive(Clone)]
pub struct Environment {
    inner: Arc<RwLock<HashMap<String, Value>>>,
    cancelled: Arc<AtomicBool>,
}

impl Environment {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Records a unit's result as `{id: {"output": result}}`.
    pub async fn set_output(&self, id: &str, output: Value) {
        let mut guard = self.inner.write().await;
        guard.insert(id.to_string(), serde_json::json!({ "output": output }));
    }

    /// Merges a mapping directly into the environment, one key per entry
    /// (used by the Env setter unit category, which publishes its input
    /// verbatim rather than wrapped under `{"output": ...}`).
    pub async fn merge(&self, values: &serde_json::Map<String, Value>) {
        let mut guard = self.inner.write().await;
        for (k, v) in values {
            guard.insert(k.clone(), v.clone());
        }
    }

    pub async fn get(&self, id: &str) -> Option<Value> {
        self.inner.read().await.get(id).cloned()
    }

    /// A point-in-time copy, used to seed the render scope for template and
    /// condition evaluation so those remain pure with respect to concurrent
    /// executor writes.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().await.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Exposes the cancellation flag so collaborators (e.g. a TimeoutUnit
    /// racing a configured duration) can observe it without holding a whole
    /// `Environment` handle.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

/// The data-type tag carried by an [`crate::unit::IoSlot`], naming the shape of
/// its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Plaintext,
    Json,
    JsonArray,
    Stream,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Plaintext
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_output_wraps_under_output_key() {
        let env = Environment::new();
        env.set_output("A", serde_json::json!("hi")).await;
        assert_eq!(env.get("A").await, Some(serde_json::json!({"output": "hi"})));
    }

    #[tokio::test]
    async fn entries_persist_across_further_writes() {
        let env = Environment::new();
        env.set_output("A", serde_json::json!("hi")).await;
        env.set_output("B", serde_json::json!("there")).await;
        assert!(env.get("A").await.is_some());
        assert!(env.get("B").await.is_some());
    }

    #[tokio::test]
    async fn merge_installs_keys_without_output_wrapper() {
        let env = Environment::new();
        let mut map = serde_json::Map::new();
        map.insert("foo".to_string(), serde_json::json!(1));
        env.merge(&map).await;
        assert_eq!(env.get("foo").await, Some(serde_json::json!(1)));
    }

    #[test]
    fn cancellation_flag_is_shared() {
        let env = Environment::new();
        let flag = env.cancellation_flag();
        env.cancel();
        assert!(flag.load(Ordering::SeqCst));
        assert!(env.is_cancelled());
    }
}
