//! The built-in control-flow unit categories: branch selection (IF), looping
//! (WHILE), the terminal fail-with-stop signal, and the environment setter.
//!
//! These are part of the engine itself (unlike leaf units such as an HTTP
//! caller or script runner, which are external collaborators) because the
//! pipeline and graph executors depend on their specific `next()` behavior to
//! reshape the work queue.

use async_trait::async_trait;
use serde_json::Value;

use crate::condition::{evaluate_with_scope, Condition};
use crate::error::{EngineError, Result};
use crate::registry::UnitRegistry;
use crate::retry::execute_with_retry;
use crate::unit::{IoConfig, Unit, UnitStatus};
use crate::value::Environment;

/// Evaluates a primary predicate; on match returns its "then" children,
/// otherwise evaluates `else_if` predicates in order, otherwise returns the
/// "else" children (possibly empty).
#[derive(Default)]
pub struct IfUnit {
    id: Option<String>,
    io_config: IoConfig,
    flowable: bool,
    status: UnitStatus,
    pub if_condition: Condition,
    pub else_if: Vec<Condition>,
    if_units: Vec<Box<dyn Unit>>,
    else_if_units: Vec<Vec<Box<dyn Unit>>>,
    else_units: Vec<Box<dyn Unit>>,
}

impl IfUnit {
    pub fn new() -> Self {
        Self {
            flowable: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Unit for IfUnit {
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
        "If"
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

    async fn execute(&mut self, _env: &Environment, input: Value) -> Result<Value> {
        // Branch selection happens in `next`; IF has nothing of its own to
        // compute and passes its input through unchanged.
        self.status = UnitStatus::Completed;
        Ok(input)
    }

    async fn next(&mut self, env: &Environment, _input: &Value) -> Result<Vec<Box<dyn Unit>>> {
        let scope = env.snapshot().await;
        if evaluate_with_scope(&self.if_condition, &scope)? {
            return Ok(std::mem::take(&mut self.if_units));
        }
        for (i, cond) in self.else_if.iter().enumerate() {
            if evaluate_with_scope(cond, &scope)? {
                return Ok(self
                    .else_if_units
                    .get_mut(i)
                    .map(std::mem::take)
                    .unwrap_or_default());
            }
        }
        Ok(std::mem::take(&mut self.else_units))
    }

    async fn populate_extra(&mut self, descriptor: &Value, registry: &UnitRegistry, type_field: &str) -> Result<()> {
        if let Some(c) = descriptor.get("if_condition") {
            self.if_condition =
                serde_json::from_value(c.clone()).map_err(|e| EngineError::BadDescriptor(e.to_string()))?;
        }
        if let Some(arr) = descriptor.get("else_if") {
            self.else_if =
                serde_json::from_value(arr.clone()).map_err(|e| EngineError::BadDescriptor(e.to_string()))?;
        }
        if let Some(units) = descriptor.get("if_units") {
            self.if_units = registry.parse_units_value(units, type_field).await?;
        }
        if let Some(groups) = descriptor.get("else_if_units").and_then(Value::as_array) {
            let mut out = Vec::with_capacity(groups.len());
            for group in groups {
                out.push(registry.parse_units_value(group, type_field).await?);
            }
            self.else_if_units = out;
        }
        if let Some(units) = descriptor.get("else_units") {
            self.else_units = registry.parse_units_value(units, type_field).await?;
        }
        Ok(())
    }
}

/// If its predicate holds, runs its body units in order, repeating for as
/// long as the predicate continues to hold — the engine imposes no iteration
/// cap (a non-terminating predicate is the workflow author's responsibility).
///
/// Where the original source re-inserted the WHILE unit into the work queue
/// to re-observe its predicate, this engine loops internally within
/// `execute`: the body units are owned directly rather than shared through
/// the queue, which keeps the loop free of interior-mutability plumbing while
/// producing the same observable environment writes each iteration. `next`
/// always returns empty, since the loop has already fully run by the time
/// `execute` returns.
#[derive(Default)]
pub struct WhileUnit {
    id: Option<String>,
    io_config: IoConfig,
    flowable: bool,
    status: UnitStatus,
    pub condition: Condition,
    units: Vec<Box<dyn Unit>>,
}

impl WhileUnit {
    pub fn new() -> Self {
        Self {
            flowable: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Unit for WhileUnit {
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
        "While"
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

    async fn execute(&mut self, env: &Environment, input: Value) -> Result<Value> {
        loop {
            let scope = env.snapshot().await;
            if !evaluate_with_scope(&self.condition, &scope)? {
                break;
            }
            for unit in self.units.iter_mut() {
                let policy = unit.retry_policy();
                let body_input = input.clone();
                let result = execute_with_retry(policy, env, || unit.execute(env, body_input.clone())).await?;
                if let Some(id) = unit.id() {
                    env.set_output(id, result).await;
                }
            }
        }
        self.status = UnitStatus::Completed;
        Ok(input)
    }

    async fn next(&mut self, _env: &Environment, _input: &Value) -> Result<Vec<Box<dyn Unit>>> {
        Ok(Vec::new())
    }

    async fn populate_extra(&mut self, descriptor: &Value, registry: &UnitRegistry, type_field: &str) -> Result<()> {
        if let Some(c) = descriptor.get("condition") {
            self.condition =
                serde_json::from_value(c.clone()).map_err(|e| EngineError::BadDescriptor(e.to_string()))?;
        }
        if let Some(units) = descriptor.get("units") {
            self.units = registry.parse_units_value(units, type_field).await?;
        }
        Ok(())
    }
}

/// Always raises a fail-with-stop signal, consumed by the executor as
/// `ExecutionTerminated`.
pub struct TerminalUnit {
    id: Option<String>,
    io_config: IoConfig,
    flowable: bool,
    status: UnitStatus,
    message: String,
}

impl Default for TerminalUnit {
    fn default() -> Self {
        Self {
            id: None,
            io_config: IoConfig::default(),
            flowable: true,
            status: UnitStatus::Pending,
            message: "execution ended".to_string(),
        }
    }
}

impl TerminalUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Unit for TerminalUnit {
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
        "Terminal"
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

    async fn execute(&mut self, _env: &Environment, _input: Value) -> Result<Value> {
        self.status = UnitStatus::Failed;
        Err(EngineError::ExecutionTerminated(self.message.clone()))
    }

    async fn next(&mut self, _env: &Environment, _input: &Value) -> Result<Vec<Box<dyn Unit>>> {
        Ok(Vec::new())
    }

    async fn populate_extra(&mut self, descriptor: &Value, _registry: &UnitRegistry, _type_field: &str) -> Result<()> {
        if let Some(msg) = descriptor.get("message").and_then(Value::as_str) {
            self.message = msg.to_string();
        }
        Ok(())
    }
}

/// Merges its input (a mapping) into the environment and returns the mapping
/// as its own output.
pub struct EnvSetterUnit {
    id: Option<String>,
    io_config: IoConfig,
    flowable: bool,
    status: UnitStatus,
}

impl Default for EnvSetterUnit {
    fn default() -> Self {
        Self {
            id: None,
            io_config: IoConfig::default(),
            flowable: true,
            status: UnitStatus::Pending,
        }
    }
}

impl EnvSetterUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Unit for EnvSetterUnit {
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
        "SetEnv"
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

    async fn execute(&mut self, env: &Environment, input: Value) -> Result<Value> {
        match input.as_object() {
            Some(map) => {
                env.merge(map).await;
                self.status = UnitStatus::Completed;
                Ok(input)
            }
            None => {
                self.status = UnitStatus::Failed;
                Err(EngineError::Other("SetEnv input must be a JSON object".to_string()))
            }
        }
    }

    async fn next(&mut self, _env: &Environment, _input: &Value) -> Result<Vec<Box<dyn Unit>>> {
        Ok(Vec::new())
    }
}

/// Registers the four built-in control-flow unit categories (`If`, `While`,
/// `Terminal`, `SetEnv`) under their wire type names. Callers still register
/// their own leaf unit factories on top of this.
pub async fn register_builtins(registry: &UnitRegistry) {
    registry.register("If", std::sync::Arc::new(|| Box::new(IfUnit::new()) as Box<dyn Unit>)).await;
    registry
        .register("While", std::sync::Arc::new(|| Box::new(WhileUnit::new()) as Box<dyn Unit>))
        .await;
    registry
        .register("Terminal", std::sync::Arc::new(|| Box::new(TerminalUnit::new()) as Box<dyn Unit>))
        .await;
    registry
        .register("SetEnv", std::sync::Arc::new(|| Box::new(EnvSetterUnit::new()) as Box<dyn Unit>))
        .await;
}
