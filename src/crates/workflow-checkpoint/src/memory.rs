use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{CheckpointError, Result};
use crate::state::CheckpointState;

/// Persists and retrieves a single [`CheckpointState`].
///
/// The engine calls `save` on every pause entry and forced stop, and `load` on
/// resume. Durable backends (a database, a file) implement this trait; the
/// reference implementation here keeps the most recent state in memory.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    async fn save(&self, state: CheckpointState) -> Result<()>;
    async fn load(&self) -> Result<CheckpointState>;
}

/// Reference [`CheckpointSaver`] holding the latest checkpoint in memory.
///
/// Durability is an adapter concern (spec §4.7); this implementation exists so
/// the engine and its tests have something to run against without a real store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointSaver {
    slot: Mutex<Option<CheckpointState>>,
}

impl InMemoryCheckpointSaver {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn save(&self, state: CheckpointState) -> Result<()> {
        *self.slot.lock().await = Some(state);
        Ok(())
    }

    async fn load(&self) -> Result<CheckpointState> {
        self.slot
            .lock()
            .await
            .clone()
            .ok_or(CheckpointError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_before_any_save_is_not_found() {
        let saver = InMemoryCheckpointSaver::new();
        assert!(matches!(saver.load().await, Err(CheckpointError::NotFound)));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let saver = InMemoryCheckpointSaver::new();
        let state = CheckpointState::new(2, 1, "paused");
        saver.save(state.clone()).await.unwrap();
        let loaded = saver.load().await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn later_saves_overwrite_earlier_ones() {
        let saver = InMemoryCheckpointSaver::new();
        saver.save(CheckpointState::new(0, 0, "running")).await.unwrap();
        saver.save(CheckpointState::new(3, 2, "paused")).await.unwrap();
        let loaded = saver.load().await.unwrap();
        assert_eq!(loaded.current_stage_index, 3);
        assert_eq!(loaded.status, "paused");
    }
}
