use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A snapshot of a pipeline's progress, sufficient to resume execution at the
/// point just before the next unit would have started.
///
/// Field names mirror the wire record from the external interface exactly
/// (`CurrentStageIndex`, `CurrentUnitIndex`, `Status`, `LastOutput`) rather than
/// idiomatic snake_case, since this struct's `serde` shape is a contract other
/// systems read and write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(rename = "CurrentStageIndex")]
    pub current_stage_index: usize,
    #[serde(rename = "CurrentUnitIndex")]
    pub current_unit_index: usize,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "LastOutput")]
    pub last_output: Value,
}

impl CheckpointState {
    pub fn new(stage_index: usize, unit_index: usize, status: impl Into<String>) -> Self {
        Self {
            current_stage_index: stage_index,
            current_unit_index: unit_index,
            status: status.into(),
            last_output: Value::Null,
        }
    }

    pub fn with_last_output(mut self, output: Value) -> Self {
        self.last_output = output;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_with_exact_field_names() {
        let state = CheckpointState::new(1, 0, "paused").with_last_output(serde_json::json!("hi"));
        let wire = serde_json::to_value(&state).unwrap();
        assert_eq!(wire["CurrentStageIndex"], 1);
        assert_eq!(wire["CurrentUnitIndex"], 0);
        assert_eq!(wire["Status"], "paused");
        assert_eq!(wire["LastOutput"], "hi");

        let back: CheckpointState = serde_json::from_value(wire).unwrap();
        assert_eq!(back, state);
    }
}
