use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::value::{DataType, Environment};

/// One of the four states a unit passes through over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A single declared input or output: a payload, a type tag, and whether the
/// payload is a template that needs rendering before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoSlot {
    #[serde(default)]
    pub data: Value,
    #[serde(default, rename = "data_type")]
    pub data_type: DataType,
    #[serde(default)]
    pub slottable: bool,
}

impl IoSlot {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            data_type: DataType::Plaintext,
            slottable: false,
        }
    }

    pub fn slottable_text(text: impl Into<String>) -> Self {
        Self {
            data: Value::String(text.into()),
            data_type: DataType::Plaintext,
            slottable: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.data, Value::Null)
            || matches!(&self.data, Value::String(s) if s.is_empty())
    }
}

/// The two declared inputs (primary and fallback default) plus the last
/// observed output, as carried on every unit descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default)]
    pub input: IoSlot,
    #[serde(default)]
    pub default_input: IoSlot,
    #[serde(default)]
    pub output: IoSlot,
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A unit shared by reference rather than owned outright, so the same
/// underlying instance can appear more than once in a pipeline's queue (the
/// storyboard builder's duplicate-preserving semantics depend on this: a unit
/// referenced by two lines is the same executable instance, run twice).
pub type SharedUnit = Arc<tokio::sync::Mutex<Box<dyn Unit>>>;

pub fn shared_unit(unit: Box<dyn Unit>) -> SharedUnit {
    Arc::new(tokio::sync::Mutex::new(unit))
}

/// The polymorphic surface every node in a workflow implements.
///
/// `next` is what lets control-flow units (IF, WHILE) integrate with the same
/// FIFO scheduler used for straight-line flow: a leaf returns an empty
/// continuation, while IF/WHILE return the children that should run next.
#[async_trait]
pub trait Unit: Send + Sync {
    /// The unit's stable identifier, if one has already been assigned.
    fn id(&self) -> Option<&str>;

    /// Assigns a fresh identifier if none is set yet, and returns it.
    fn preset_id(&mut self) -> String;

    /// The registry type name this unit was constructed from.
    fn type_name(&self) -> &str;

    fn io_config(&self) -> &IoConfig;

    /// Whether this unit implicitly consumes the predecessor's output when it
    /// has no explicit input of its own.
    fn flowable(&self) -> bool;

    fn status(&self) -> UnitStatus;

    fn set_id(&mut self, id: String);
    fn set_io_config(&mut self, io_config: IoConfig);
    fn set_flowable(&mut self, flowable: bool);

    /// The policy governing retries of `execute` at the queue level. Leaves
    /// default to a single attempt; control-flow units should never need
    /// retry since they're documented not to fail on their own logic.
    fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy::default()
    }

    async fn execute(&mut self, env: &Environment, input: Value) -> Result<Value>;

    /// Children to inject into the executor's work queue as the immediate
    /// continuation. Empty for leaves; non-empty for IF/WHILE.
    async fn next(&mut self, env: &Environment, input: &Value) -> Result<Vec<Box<dyn Unit>>>;

    /// Populates any fields beyond `id`/`io_config`/`flowable` from a raw
    /// descriptor. The default does nothing, which is correct for simple
    /// leaves; control-flow units override this to recursively reconstruct
    /// their nested unit arrays through the same registry, dispatching
    /// nested descriptors on the same `type_field` the outer parse used.
    async fn populate_extra(
        &mut self,
        _descriptor: &Value,
        _registry: &crate::registry::UnitRegistry,
        _type_field: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Wraps a plain async closure as a leaf [`Unit`], so tests and downstream
/// collaborators can build ad hoc units without a bespoke type per behavior.
pub struct FnUnit {
    id: Option<String>,
    type_name: String,
    io_config: IoConfig,
    flowable: bool,
    status: UnitStatus,
    retry_policy: crate::retry::RetryPolicy,
    f: Arc<dyn Fn(Value) -> BoxFuture<Result<Value>> + Send + Sync>,
}

impl FnUnit {
    pub fn new<F, Fut>(type_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: None,
            type_name: type_name.into(),
            io_config: IoConfig::default(),
            flowable: true,
            status: UnitStatus::Pending,
            retry_policy: crate::retry::RetryPolicy::default(),
            f: Arc::new(move |input| Box::pin(f(input))),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_io_config(mut self, io_config: IoConfig) -> Self {
        self.io_config = io_config;
        self
    }

    pub fn with_flowable(mut self, flowable: bool) -> Self {
        self.flowable = flowable;
        self
    }

    pub fn with_retry_policy(mut self, policy: crate::retry::RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[async_trait]
impl Unit for FnUnit {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn preset_id(&mut self) -> String {
        if self.id.is_none() {
            self.id = Some(uuid::Uuid::new_v4().to_string());
        }
        self.id.clone().unwrap()
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn io_config(&self) -> &IoConfig {
        &self.io_config
    }

    fn flowable(&self) -> bool {
        self.flowable
    }

    fn status(&self) -> UnitStatus {
        self.status
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn set_io_config(&mut self, io_config: IoConfig) {
        self.io_config = io_config;
    }

    fn set_flowable(&mut self, flowable: bool) {
        self.flowable = flowable;
    }

    fn retry_policy(&self) -> crate::retry::RetryPolicy {
        self.retry_policy
    }

    async fn execute(&mut self, _env: &Environment, input: Value) -> Result<Value> {
        self.status = UnitStatus::Running;
        let result = (self.f)(input).await;
        self.status = match &result {
            Ok(_) => UnitStatus::Completed,
            Err(_) => UnitStatus::Failed,
        };
        result
    }

    async fn next(&mut self, _env: &Environment, _input: &Value) -> Result<Vec<Box<dyn Unit>>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preset_id_assigns_once() {
        let mut unit = FnUnit::new("log", |v| async move { Ok(v) });
        assert!(unit.id().is_none());
        let first = unit.preset_id();
        let second = unit.preset_id();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn fn_unit_runs_its_closure() {
        let mut unit = FnUnit::new("log", |v| async move { Ok(v) });
        let env = Environment::new();
        let out = unit.execute(&env, serde_json::json!("hi")).await.unwrap();
        assert_eq!(out, serde_json::json!("hi"));
        assert_eq!(unit.status(), UnitStatus::Completed);
    }

    #[tokio::test]
    async fn leaf_units_have_no_continuation() {
        let mut unit = FnUnit::new("log", |v| async move { Ok(v) });
        let env = Environment::new();
        let next = unit.next(&env, &Value::Null).await.unwrap();
        assert!(next.is_empty());
    }
}
