//! Process-wide mapping from a unit's type name to a factory that produces a
//! fresh instance, and the descriptor parser built on top of it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::unit::{IoConfig, Unit};

pub type UnitFactory = Arc<dyn Fn() -> Box<dyn Unit> + Send + Sync>;

/// Reconstructs typed units from serialized descriptors.
///
/// Reads dominate (condition/template evaluation and descriptor parsing all
/// just look up a factory); writes happen only at startup via `register`.
/// Registering an already-registered name replaces the prior factory
/// (documented last-write-wins).
#[derive(Clone, Default)]
pub struct UnitRegistry {
    factories: Arc<RwLock<HashMap<String, UnitFactory>>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, factory: UnitFactory) {
        self.factories.write().await.insert(name.into(), factory);
    }

    pub async fn find(&self, name: &str) -> Option<UnitFactory> {
        self.factories.read().await.get(name).cloned()
    }

    /// Parses a JSON array of unit descriptors into typed unit instances,
    /// dispatching on the descriptor field named by `type_field` (the default
    /// call sites use `"unit_name"`).
    pub async fn parse_units(&self, json_bytes: &[u8], type_field: &str) -> Result<Vec<Box<dyn Unit>>> {
        let value: Value =
            serde_json::from_slice(json_bytes).map_err(|e| EngineError::BadDescriptor(e.to_string()))?;
        self.parse_units_value(&value, type_field).await
    }

    /// Same as [`Self::parse_units`] but operating on an already-parsed JSON
    /// array, used internally for recursive descriptor parsing (IF/WHILE
    /// nested unit arrays).
    pub async fn parse_units_value(&self, value: &Value, type_field: &str) -> Result<Vec<Box<dyn Unit>>> {
        let items = value
            .as_array()
            .ok_or_else(|| EngineError::BadDescriptor("expected a JSON array of unit descriptors".into()))?;
        let mut units = Vec::with_capacity(items.len());
        for item in items {
            units.push(self.parse_unit(item, type_field).await?);
        }
        Ok(units)
    }

    async fn parse_unit(&self, descriptor: &Value, type_field: &str) -> Result<Box<dyn Unit>> {
        let field = if type_field.is_empty() { "unit_name" } else { type_field };
        let type_name = descriptor
            .get(field)
            .and_then(Value::as_str)
            .ok_or(EngineError::MissingTypeField)?;
        let factory = self
            .find(type_name)
            .await
            .ok_or_else(|| EngineError::UnknownUnitType(type_name.to_string()))?;
        let mut unit = factory();

        if let Some(id) = descriptor.get("id").and_then(Value::as_str) {
            unit.set_id(id.to_string());
        }
        if let Some(io) = descriptor.get("io_config") {
            let io_config: IoConfig =
                serde_json::from_value(io.clone()).map_err(|e| EngineError::BadDescriptor(e.to_string()))?;
            unit.set_io_config(io_config);
        }
        if let Some(flowable) = descriptor.get("flowable").and_then(Value::as_bool) {
            unit.set_flowable(flowable);
        }
        unit.populate_extra(descriptor, self, field).await?;
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::FnUnit;

    fn log_factory() -> UnitFactory {
        Arc::new(|| Box::new(FnUnit::new("Log", |v| async move { Ok(v) })))
    }

    #[tokio::test]
    async fn find_returns_none_for_unregistered_name() {
        let registry = UnitRegistry::new();
        assert!(registry.find("Log").await.is_none());
    }

    #[tokio::test]
    async fn register_then_find_round_trips() {
        let registry = UnitRegistry::new();
        registry.register("Log", log_factory()).await;
        assert!(registry.find("Log").await.is_some());
    }

    #[tokio::test]
    async fn later_register_replaces_earlier_factory_for_same_name() {
        let registry = UnitRegistry::new();
        registry.register("Log", log_factory()).await;
        registry
            .register("Log", Arc::new(|| Box::new(FnUnit::new("LogV2", |v| async move { Ok(v) }))))
            .await;
        let unit = (registry.find("Log").await.unwrap())();
        assert_eq!(unit.type_name(), "LogV2");
    }

    #[tokio::test]
    async fn parse_units_assigns_declared_id_and_io_config() {
        let registry = UnitRegistry::new();
        registry.register("Log", log_factory()).await;
        let descriptor = serde_json::json!([
            {
                "unit_name": "Log",
                "id": "A",
                "io_config": {"input": {"data": "hi", "data_type": "plaintext", "slottable": false}},
                "flowable": false
            }
        ]);
        let units = registry
            .parse_units(serde_json::to_vec(&descriptor).unwrap().as_slice(), "unit_name")
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id(), Some("A"));
        assert!(!units[0].flowable());
        assert_eq!(units[0].io_config().input.data, serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn unknown_unit_type_is_an_error() {
        let registry = UnitRegistry::new();
        let descriptor = serde_json::json!([{"unit_name": "Nope"}]);
        let err = registry
            .parse_units(serde_json::to_vec(&descriptor).unwrap().as_slice(), "unit_name")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownUnitType(_)));
    }

    #[tokio::test]
    async fn missing_type_field_is_an_error() {
        let registry = UnitRegistry::new();
        let descriptor = serde_json::json!([{"id": "A"}]);
        let err = registry
            .parse_units(serde_json::to_vec(&descriptor).unwrap().as_slice(), "unit_name")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingTypeField));
    }

    #[tokio::test]
    async fn custom_type_field_dispatches_instead_of_unit_name() {
        let registry = UnitRegistry::new();
        registry.register("Log", log_factory()).await;
        let descriptor = serde_json::json!([{"kind": "Log", "id": "A"}]);
        let units = registry
            .parse_units(serde_json::to_vec(&descriptor).unwrap().as_slice(), "kind")
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id(), Some("A"));
    }
}
