//! Checkpoint persistence for the workflow engine.
//!
//! A checkpoint is a small snapshot of a pipeline's progress — which stage and
//! unit it had reached, its status, and the last output observed — saved on
//! every pause or forced stop so a later `load` can rebuild the run queue from
//! the remembered position. This crate defines the store's contract
//! ([`CheckpointSaver`]) and a process-local reference implementation
//! ([`InMemoryCheckpointSaver`]); durable backends are adapters implemented
//! outside this crate.

mod error;
mod memory;
mod state;

pub use error::{CheckpointError, Result};
pub use memory::{CheckpointSaver, InMemoryCheckpointSaver};
pub use state::CheckpointState;
