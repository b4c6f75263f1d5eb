//! A workflow execution engine: a typed unit registry, two executors (a
//! dynamically reshaped FIFO pipeline and a DFS graph walker), the
//! condition and template languages units are driven by, retry policy, and
//! a storyboard builder that turns a flat unit set plus connecting lines
//! into a runnable sequence.
//!
//! Execution state lives in [`value::Environment`]; progress can be
//! checkpointed via [`workflow_checkpoint::CheckpointSaver`] and resumed
//! later from the same point.

pub mod condition;
pub mod control_flow;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod storyboard;
pub mod template;
pub mod unit;
pub mod value;

pub use condition::{Condition, Joiner, Operator};
pub use control_flow::{register_builtins, EnvSetterUnit, IfUnit, TerminalUnit, WhileUnit};
pub use error::{EngineError, Result};
pub use graph::{BranchFn, Graph, GraphNode, HookFn, NodeId};
pub use pipeline::{Pipeline, PipelineStatus, StageCallback, StageEvent, StageStatus};
pub use registry::{UnitFactory, UnitRegistry};
pub use retry::{execute_with_retry, RetryPolicy};
pub use storyboard::Line;
pub use unit::{shared_unit, FnUnit, IoConfig, IoSlot, SharedUnit, Unit, UnitStatus};
pub use value::{DataType, Environment};

pub use workflow_checkpoint::{CheckpointError, CheckpointSaver, CheckpointState, InMemoryCheckpointSaver};
