//! The graph executor: walks an explicit node set by DFS, honoring branch
//! functions, parallel fan-out, and per-node loop predicates.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::condition::{evaluate_with_scope, Condition};
use crate::error::{EngineError, Result};
use crate::template;
use crate::unit::{BoxFuture, Unit};
use crate::value::Environment;

pub type NodeId = String;

/// Chooses the next node's name from a node's own execution result; the
/// sentinel `"END"` terminates the walk. Structural selections that don't fit
/// a condition expression (spec §4.5) belong here rather than in a
/// [`Condition`].
pub type BranchFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// A before/after observation hook, given the node's name.
pub type HookFn = Arc<dyn Fn(&str) + Send + Sync>;

pub struct GraphNode {
    pub unit: AsyncMutex<Box<dyn Unit>>,
    /// Subfields of this node's result published as `node.field` identifiers
    /// into the render scope of downstream nodes (not parallel siblings).
    pub export_fields: Vec<String>,
    pub branch: Option<BranchFn>,
    pub parallel: bool,
    /// Re-executes the node while this condition holds against the
    /// environment.
    pub loop_condition: Option<Condition>,
}

impl GraphNode {
    pub fn new(unit: Box<dyn Unit>) -> Self {
        Self {
            unit: AsyncMutex::new(unit),
            export_fields: Vec::new(),
            branch: None,
            parallel: false,
            loop_condition: None,
        }
    }

    pub fn with_export_fields(mut self, fields: Vec<String>) -> Self {
        self.export_fields = fields;
        self
    }

    pub fn with_branch(mut self, branch: BranchFn) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_loop_condition(mut self, condition: Condition) -> Self {
        self.loop_condition = Some(condition);
        self
    }
}

/// An explicit node set with adjacency edges, optional branch functions,
/// per-node parallelism, and per-node loop predicates, executed by DFS from a
/// start node.
#[derive(Default)]
pub struct Graph {
    nodes: HashMap<NodeId, GraphNode>,
    edges: HashMap<NodeId, Vec<NodeId>>,
    before: Option<HookFn>,
    after: Option<HookFn>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>, node: GraphNode) -> &mut Self {
        self.nodes.insert(name.into(), node);
        self
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.entry(from.into()).or_default().push(to.into());
        self
    }

    pub fn with_before_hook(mut self, hook: HookFn) -> Self {
        self.before = Some(hook);
        self
    }

    pub fn with_after_hook(mut self, hook: HookFn) -> Self {
        self.after = Some(hook);
        self
    }

    pub async fn run(self: Arc<Self>, start: &str, env: &Environment) -> Result<()> {
        walk(self, start.to_string(), env.clone(), HashMap::new()).await
    }
}

fn walk(
    graph: Arc<Graph>,
    node_name: String,
    env: Environment,
    export_scope: HashMap<String, Value>,
) -> BoxFuture<Result<()>> {
    Box::pin(async move {
        let node = graph
            .nodes
            .get(&node_name)
            .ok_or_else(|| EngineError::UnknownNode(node_name.clone()))?;

        let mut scope = env.snapshot().await;
        scope.extend(export_scope.clone());

        let mut unit = node.unit.lock().await;
        let io = unit.io_config().clone();
        let input = if io.input.slottable {
            render_slot(&io.input.data, &scope)?
        } else {
            io.input.data.clone()
        };

        if let Some(hook) = &graph.before {
            hook(&node_name);
        }

        let mut result = unit.execute(&env, input.clone()).await?;
        if let Some(cond) = &node.loop_condition {
            loop {
                let scope = env.snapshot().await;
                if !evaluate_with_scope(cond, &scope)? {
                    break;
                }
                result = unit.execute(&env, input.clone()).await?;
            }
        }
        env.set_output(&node_name, result.clone()).await;

        if let Some(hook) = &graph.after {
            hook(&node_name);
        }

        let mut next_export_scope = export_scope;
        if !node.export_fields.is_empty() {
            if let Some(obj) = result.as_object() {
                for field in &node.export_fields {
                    if let Some(v) = obj.get(field) {
                        next_export_scope.insert(format!("{node_name}.{field}"), v.clone());
                    }
                }
            }
        }
        drop(unit);

        if let Some(branch) = &node.branch {
            let next = branch(&result);
            if next == "END" {
                return Ok(());
            }
            return walk(graph, next, env, next_export_scope).await;
        }

        let successors = graph.edges.get(&node_name).cloned().unwrap_or_default();
        if successors.is_empty() {
            return Ok(());
        }

        if node.parallel {
            let handles = successors.into_iter().map(|succ| {
                let graph = Arc::clone(&graph);
                let env = env.clone();
                let scope = next_export_scope.clone();
                tokio::spawn(walk(graph, succ, env, scope))
            });
            for joined in join_all(handles).await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "parallel branch failed"),
                    Err(e) => tracing::warn!(error = %e, "parallel branch task panicked"),
                }
            }
            Ok(())
        } else {
            walk(graph, successors[0].clone(), env, next_export_scope).await
        }
    })
}

fn render_slot(data: &Value, scope: &HashMap<String, Value>) -> Result<Value> {
    match data {
        Value::String(s) => Ok(Value::String(template::render(s, scope, true)?)),
        other => Ok(other.clone()),
    }
}
