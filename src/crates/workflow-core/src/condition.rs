//! Predicate evaluation: a [`Condition`] tree evaluated against the
//! environment with a closed operator set.
//!
//! Both `key` and `value` are template strings rendered against the
//! environment before the operator is applied, so predicates can reference
//! prior unit outputs by name (`"{{A.output}}"`). Numeric operators that
//! cannot coerce their operands fail soft to `false` rather than erroring —
//! only structural problems (e.g. an unparseable template) are fatal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::template;
use crate::value::Environment;

/// The closed operator set predicates may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Like,
    In,
    NotIn,
    InLike,
    Same,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    Empty,
    NotEmpty,
    Exists,
    NonExists,
}

impl Default for Operator {
    fn default() -> Self {
        Operator::Eq
    }
}

/// How a condition node's own predicate combines with its `children`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Joiner {
    And,
    Or,
    Not,
}

/// One node of a condition tree: a predicate plus an optional join to
/// children for nested composition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    pub key: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub joint_next: Option<Joiner>,
    #[serde(default)]
    pub children: Vec<Condition>,
}

impl Condition {
    pub fn new(key: impl Into<String>, operator: Operator, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            operator,
            value,
            joint_next: None,
            children: Vec::new(),
        }
    }
}

/// Evaluates a condition tree against the current environment snapshot.
///
/// The node's own predicate is evaluated first; if it has children, they are
/// folded in left-to-right using `joint_next` (`AND`/`OR`), and `NOT` negates
/// the node's own predicate before folding in children under `AND`.
pub async fn evaluate(condition: &Condition, env: &Environment) -> Result<bool> {
    let scope = env.snapshot().await;
    evaluate_with_scope(condition, &scope)
}

pub(crate) fn evaluate_with_scope(condition: &Condition, scope: &HashMap<String, Value>) -> Result<bool> {
    let own = eval_predicate(condition, scope)?;
    if condition.children.is_empty() {
        return Ok(own);
    }
    let joiner = condition.joint_next.unwrap_or(Joiner::And);
    let mut acc = match joiner {
        Joiner::Not => !own,
        _ => own,
    };
    for child in &condition.children {
        let child_val = evaluate_with_scope(child, scope)?;
        acc = match joiner {
            Joiner::And | Joiner::Not => acc && child_val,
            Joiner::Or => acc || child_val,
        };
    }
    Ok(acc)
}

fn eval_predicate(condition: &Condition, scope: &HashMap<String, Value>) -> Result<bool> {
    let typed_key = template::slot_value(&condition.key, scope);
    let rendered_key = template::render(&condition.key, scope, false)?;
    let key_exists = typed_key.is_some() || !condition.key.trim_start().starts_with("{{");

    match condition.operator {
        Operator::Exists => Ok(key_exists),
        Operator::NonExists => Ok(!key_exists),
        Operator::Empty => Ok(rendered_key.is_empty()),
        Operator::NotEmpty => Ok(!rendered_key.is_empty()),
        Operator::Same => Ok(rendered_key == render_scalar_value(condition, scope)?),
        Operator::Like => Ok(rendered_key.contains(&render_scalar_value(condition, scope)?)),
        Operator::In => Ok(render_list_values(condition, scope)?
            .iter()
            .any(|v| *v == rendered_key)),
        Operator::NotIn => Ok(!render_list_values(condition, scope)?
            .iter()
            .any(|v| *v == rendered_key)),
        Operator::InLike => Ok(render_list_values(condition, scope)?
            .iter()
            .any(|v| rendered_key.contains(v))),
        Operator::Eq | Operator::Ne | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let lhs = coerce_number(typed_key.as_ref(), &rendered_key);
            let rhs = coerce_number(condition.value.as_ref(), &render_scalar_value(condition, scope)?);
            Ok(match (lhs, rhs) {
                (Some(a), Some(b)) => compare_numeric(condition.operator, a, b),
                _ => false,
            })
        }
        Operator::Between => {
            let n = match coerce_number(typed_key.as_ref(), &rendered_key) {
                Some(n) => n,
                None => return Ok(false),
            };
            let bounds = render_scalar_value(condition, scope)?;
            let mut parts = bounds.splitn(2, ',');
            let lo = parts.next().and_then(|s| s.trim().parse::<f64>().ok());
            let hi = parts.next().and_then(|s| s.trim().parse::<f64>().ok());
            Ok(match (lo, hi) {
                (Some(lo), Some(hi)) => n >= lo && n <= hi,
                _ => false,
            })
        }
    }
}

fn compare_numeric(operator: Operator, a: f64, b: f64) -> bool {
    match operator {
        Operator::Eq => a == b,
        Operator::Ne => a != b,
        Operator::Gt => a > b,
        Operator::Gte => a >= b,
        Operator::Lt => a < b,
        Operator::Lte => a <= b,
        _ => unreachable!("compare_numeric only called for numeric operators"),
    }
}

fn coerce_number(typed: Option<&Value>, rendered: &str) -> Option<f64> {
    if let Some(v) = typed {
        if let Some(n) = json_number(v) {
            return Some(n);
        }
    }
    rendered.trim().parse::<f64>().ok()
}

fn json_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn render_scalar_value(condition: &Condition, scope: &HashMap<String, Value>) -> Result<String> {
    match &condition.value {
        Some(Value::String(s)) => template::render(s, scope, false),
        Some(other) => Ok(template::value_to_display(other)),
        None => Ok(String::new()),
    }
}

fn render_list_values(condition: &Condition, scope: &HashMap<String, Value>) -> Result<Vec<String>> {
    match &condition.value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => template::render(s, scope, false),
                other => Ok(template::value_to_display(other)),
            })
            .collect(),
        Some(other) => Ok(vec![template::value_to_display(other)]),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn like_checks_substring_after_rendering() {
        let s = scope(&[("A", serde_json::json!({"output": "hi there"}))]);
        let cond = Condition::new("{{A.output}}", Operator::Like, Some(serde_json::json!("hi")));
        assert!(evaluate_with_scope(&cond, &s).unwrap());
    }

    #[test]
    fn numeric_comparison_coerces_strings() {
        let s = scope(&[("A", serde_json::json!({"output": "42"}))]);
        let cond = Condition::new("{{A.output}}", Operator::Gt, Some(serde_json::json!(10)));
        assert!(evaluate_with_scope(&cond, &s).unwrap());
    }

    #[test]
    fn numeric_coercion_failure_is_false_not_error() {
        let s = scope(&[("A", serde_json::json!({"output": "not-a-number"}))]);
        let cond = Condition::new("{{A.output}}", Operator::Gt, Some(serde_json::json!(10)));
        assert!(!evaluate_with_scope(&cond, &s).unwrap());
    }

    #[test]
    fn exists_is_false_for_unbound_path() {
        let s = scope(&[]);
        let cond = Condition::new("{{missing.output}}", Operator::Exists, None);
        assert!(!evaluate_with_scope(&cond, &s).unwrap());
        let cond = Condition::new("{{missing.output}}", Operator::NonExists, None);
        assert!(evaluate_with_scope(&cond, &s).unwrap());
    }

    #[test]
    fn exists_is_true_for_bound_path_even_if_value_is_empty_string() {
        let s = scope(&[("A", serde_json::json!({"output": ""}))]);
        let exists = Condition::new("{{A.output}}", Operator::Exists, None);
        assert!(evaluate_with_scope(&exists, &s).unwrap());
        let empty = Condition::new("{{A.output}}", Operator::Empty, None);
        assert!(evaluate_with_scope(&empty, &s).unwrap());
    }

    #[test]
    fn between_is_inclusive() {
        let s = scope(&[("A", serde_json::json!({"output": 5}))]);
        let cond = Condition::new("{{A.output}}", Operator::Between, Some(serde_json::json!("1,5")));
        assert!(evaluate_with_scope(&cond, &s).unwrap());
    }

    #[test]
    fn children_combine_with_and_by_default() {
        let s = scope(&[("A", serde_json::json!({"output": "hi"}))]);
        let mut cond = Condition::new("{{A.output}}", Operator::Same, Some(serde_json::json!("hi")));
        cond.children.push(Condition::new(
            "{{A.output}}",
            Operator::NotEmpty,
            None,
        ));
        assert!(evaluate_with_scope(&cond, &s).unwrap());

        cond.children.push(Condition::new(
            "{{A.output}}",
            Operator::Empty,
            None,
        ));
        assert!(!evaluate_with_scope(&cond, &s).unwrap());
    }

    #[test]
    fn children_combine_with_or() {
        let s = scope(&[("A", serde_json::json!({"output": "hi"}))]);
        let mut cond = Condition::new("{{A.output}}", Operator::Same, Some(serde_json::json!("nope")));
        cond.joint_next = Some(Joiner::Or);
        cond.children.push(Condition::new(
            "{{A.output}}",
            Operator::Same,
            Some(serde_json::json!("hi")),
        ));
        assert!(evaluate_with_scope(&cond, &s).unwrap());
    }

    #[test]
    fn default_operator_is_eq() {
        let cond: Condition = serde_json::from_value(serde_json::json!({"key": "{{A.output}}"})).unwrap();
        assert_eq!(cond.operator, Operator::Eq);
    }
}
