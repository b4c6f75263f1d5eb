use thiserror::Error;

/// The engine's error surface. Variants map onto the abstract error kinds named
/// in the external interface: registry parsing, graph traversal, template
/// evaluation, unit execution, retry exhaustion, control signals, and
/// storyboard construction.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A descriptor named a `unit_name` with no matching registry entry.
    #[error("unknown unit type: {0}")]
    UnknownUnitType(String),

    /// A descriptor was missing its type-dispatch field entirely.
    #[error("descriptor is missing its type field")]
    MissingTypeField,

    /// A descriptor could not be deserialized into the shape its type expects.
    #[error("bad unit descriptor: {0}")]
    BadDescriptor(String),

    /// A graph walk referenced a node name absent from the node set.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A `{{name}}` slot's key failed identifier validation (only letters,
    /// digits, underscore, and Unicode letters are permitted).
    #[error("bad template key: {0}")]
    BadTemplateKey(String),

    /// An `<% if %>`/`<% end %>` control block was opened but never closed.
    #[error("unterminated control block")]
    UnterminatedBlock,

    /// A control-block expression could not be parsed or evaluated.
    #[error("bad expression: {0}")]
    BadExpression(String),

    /// A unit's `execute` returned an error, wrapped with the unit's identifier.
    #[error("unit {id} failed: {source}")]
    UnitExecuteFailed {
        id: String,
        #[source]
        source: Box<EngineError>,
    },

    /// A unit's retry policy ran out of attempts without a successful execute.
    #[error("retry exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The pipeline was stopped by explicit user request.
    #[error("pipeline terminated by user")]
    UserTerminated,

    /// The ambient cancellation signal fired.
    #[error("pipeline cancelled")]
    Cancelled,

    /// A storyboard line referenced an unknown endpoint after at least one
    /// prior line had already been emitted.
    #[error("bad storyboard: unknown endpoint {0}")]
    BadStoryboard(String),

    /// A storyboard line's target endpoint was missing.
    #[error("bad storyboard: missing target for {0}")]
    BadStoryboardTarget(String),

    /// A leaf unit raised a fail-with-stop signal (the Terminal unit category).
    #[error("execution terminated: {0}")]
    ExecutionTerminated(String),

    /// Propagated from the checkpoint store.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] workflow_checkpoint::CheckpointError),

    /// A generic failure raised by a leaf unit's own logic.
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
