use thiserror::Error;

/// Errors surfaced by a [`crate::CheckpointSaver`].
///
/// Mirrors the narrow save/load surface the engine actually calls: a checkpoint
/// implementation either persists the state or it doesn't, and either returns one
/// or it doesn't.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The store could not persist a checkpoint (disk full, connection dropped, etc).
    #[error("failed to save checkpoint: {0}")]
    SaveFailed(String),

    /// The store could not produce a checkpoint on load (backend unavailable).
    #[error("failed to load checkpoint: {0}")]
    LoadFailed(String),

    /// `load` was called before any checkpoint had ever been saved.
    #[error("no checkpoint has been saved yet")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
