//! Builds a runnable unit sequence from a flat unit set plus a set of
//! from/to lines describing how they connect.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::unit::SharedUnit;

/// One edge in a storyboard: `from` runs immediately before `to`.
#[derive(Debug, Clone)]
pub struct Line {
    pub from: String,
    pub to: String,
}

impl Line {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Resolves a declared unit set and a line set into the sequence a pipeline
/// should run.
///
/// With no lines: a single unit becomes a one-unit pipeline; more than one
/// unit with no lines yields an empty pipeline (there is nothing connecting
/// them, so nothing is emitted — this is a caller error but not one the
/// builder surfaces, since the original interface this is modeled on treats
/// it as silent).
///
/// With lines: each line appends both of its endpoints to the output in
/// order, so a unit referenced by more than one line appears more than
/// once — `[(a,b), (b,c)]` over `{a,b,c}` produces `[a,b,b,c]`, not a
/// deduplicated `[a,b,c]`. Units are shared by reference ([`SharedUnit`]) so
/// the same instance really does run twice.
pub fn build(units: Vec<SharedUnit>, lines: Vec<Line>) -> Result<Vec<SharedUnit>> {
    if lines.is_empty() {
        return match units.len() {
            1 => Ok(units),
            _ => Ok(Vec::new()),
        };
    }

    let mut by_id = HashMap::new();
    for unit in &units {
        if let Some(id) = unit_id(unit) {
            by_id.insert(id, Arc::clone(unit));
        }
    }

    let mut sequence = Vec::with_capacity(lines.len() * 2);
    for line in &lines {
        let from = by_id
            .get(&line.from)
            .cloned()
            .ok_or_else(|| EngineError::BadStoryboard(line.from.clone()))?;
        let to = by_id
            .get(&line.to)
            .cloned()
            .ok_or_else(|| EngineError::BadStoryboardTarget(line.to.clone()))?;
        sequence.push(from);
        sequence.push(to);
    }
    Ok(sequence)
}

fn unit_id(unit: &SharedUnit) -> Option<String> {
    unit.try_lock().ok().and_then(|guard| guard.id().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{shared_unit, FnUnit};

    fn unit(id: &str) -> SharedUnit {
        shared_unit(Box::new(FnUnit::new("Log", |v| async move { Ok(v) }).with_id(id)))
    }

    #[test]
    fn zero_lines_and_one_unit_is_a_single_unit_pipeline() {
        let result = build(vec![unit("a")], Vec::new()).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn zero_lines_and_multiple_units_is_an_empty_pipeline() {
        let result = build(vec![unit("a"), unit("b")], Vec::new()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn shared_endpoints_are_emitted_once_per_line() {
        let units = vec![unit("a"), unit("b"), unit("c")];
        let lines = vec![Line::new("a", "b"), Line::new("b", "c")];
        let result = build(units, lines).unwrap();
        let ids: Vec<String> = result.iter().map(|u| unit_id(u).unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "b", "c"]);
    }

    #[test]
    fn unknown_source_endpoint_is_bad_storyboard() {
        let units = vec![unit("a"), unit("b")];
        let lines = vec![Line::new("missing", "b")];
        let err = build(units, lines).unwrap_err();
        assert!(matches!(err, EngineError::BadStoryboard(_)));
    }

    #[test]
    fn unknown_target_endpoint_is_bad_storyboard_target() {
        let units = vec![unit("a"), unit("b")];
        let lines = vec![Line::new("a", "missing")];
        let err = build(units, lines).unwrap_err();
        assert!(matches!(err, EngineError::BadStoryboardTarget(_)));
    }
}
