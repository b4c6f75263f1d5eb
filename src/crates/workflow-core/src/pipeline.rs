//! The pipeline executor: a FIFO queue of units, dynamically reshaped by
//! IF/WHILE continuations, with pause/resume/stop control and checkpointing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::retry;
use crate::template;
use crate::unit::{shared_unit, SharedUnit, Unit};
use crate::value::Environment;
use workflow_checkpoint::{CheckpointSaver, CheckpointState};

/// How often a paused run polls for a status change before re-checking.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Resume,
    Terminal,
    Completed,
    Failed,
    Retry,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Resume => "resume",
            PipelineStatus::Terminal => "terminal",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Break,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Break => "break",
        }
    }
}

/// What gets reported to a pipeline's callback: either a single unit's status
/// change, or the one final `AllCompleted` notification every run ends with,
/// carrying the run's aggregated error (if any).
#[derive(Debug, Clone)]
pub enum StageEvent {
    Unit { id: String, status: StageStatus },
    AllCompleted { error: Option<String> },
}

pub type StageCallback = Arc<dyn Fn(StageEvent) + Send + Sync>;

struct StageQueue {
    queue: VecDeque<SharedUnit>,
}

/// A linear, dynamically expanded walker over one or more stages of units.
///
/// Each stage is its own FIFO queue; IF/WHILE continuations are prepended
/// onto the *current* stage's queue, so a branch taken partway through a
/// stage runs to completion before the executor moves to the next stage.
/// `current_stage_index`/`current_unit_index` mirror this structure for
/// checkpointing: the former is the stage boundary the walker has crossed
/// into, the latter how many units of that stage have completed.
pub struct Pipeline {
    stages: Vec<StageQueue>,
    current_stage_index: usize,
    current_unit_index: usize,
    env: Environment,
    status: Arc<RwLock<PipelineStatus>>,
    last_output: Value,
    checkpoint: Arc<dyn CheckpointSaver>,
    callback: Option<StageCallback>,
}

impl Pipeline {
    /// Wraps a flat unit sequence as one stage per unit, so simple linear
    /// pipelines get `CurrentStageIndex` advancing per unit and
    /// `CurrentUnitIndex` staying at 0 (each stage has exactly one unit).
    pub fn from_units(units: Vec<Box<dyn Unit>>, checkpoint: Arc<dyn CheckpointSaver>) -> Self {
        let stages = units
            .into_iter()
            .map(|u| StageQueue {
                queue: VecDeque::from([shared_unit(u)]),
            })
            .collect();
        Self::with_stages(stages, checkpoint)
    }

    /// Builds a pipeline from explicit stages, each a group of units that run
    /// as one FIFO queue before the next stage begins.
    pub fn new(stage_unit_groups: Vec<Vec<Box<dyn Unit>>>, checkpoint: Arc<dyn CheckpointSaver>) -> Self {
        let stages = stage_unit_groups
            .into_iter()
            .map(|units| StageQueue {
                queue: units.into_iter().map(shared_unit).collect(),
            })
            .collect();
        Self::with_stages(stages, checkpoint)
    }

    fn with_stages(stages: Vec<StageQueue>, checkpoint: Arc<dyn CheckpointSaver>) -> Self {
        Self {
            stages,
            current_stage_index: 0,
            current_unit_index: 0,
            env: Environment::new(),
            status: Arc::new(RwLock::new(PipelineStatus::Pending)),
            last_output: Value::Null,
            checkpoint,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: StageCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub async fn status(&self) -> PipelineStatus {
        *self.status.read().await
    }

    pub async fn pause(&self) {
        *self.status.write().await = PipelineStatus::Paused;
    }

    pub async fn stop(&self) {
        *self.status.write().await = PipelineStatus::Terminal;
    }

    /// Reloads position and last output from the checkpoint store, discarding
    /// units already consumed in stages before and within the remembered
    /// position, then marks the run as ready to resume.
    pub async fn resume_from_checkpoint(&mut self) -> Result<()> {
        let state = self.checkpoint.load().await?;
        self.current_stage_index = state.current_stage_index;
        self.current_unit_index = state.current_unit_index;
        self.last_output = state.last_output;

        for stage in self.stages.iter_mut().take(self.current_stage_index) {
            stage.queue.clear();
        }
        if let Some(stage) = self.stages.get_mut(self.current_stage_index) {
            for _ in 0..self.current_unit_index {
                stage.queue.pop_front();
            }
        }

        *self.status.write().await = PipelineStatus::Resume;
        Ok(())
    }

    fn emit(&self, event: StageEvent) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }

    async fn save_checkpoint(&self) -> Result<()> {
        let status = self.status().await;
        let state = CheckpointState::new(self.current_stage_index, self.current_unit_index, status.as_str())
            .with_last_output(self.last_output.clone());
        self.checkpoint.save(state).await?;
        Ok(())
    }

    /// Computes a unit's input per its flowable/primary/default rules, and
    /// renders it against the environment if it's marked slottable.
    async fn resolve_input(&self, shared: &SharedUnit) -> Result<Value> {
        let guard = shared.lock().await;
        let io = guard.io_config().clone();
        let flowable = guard.flowable();
        drop(guard);

        if flowable && io.input.is_empty() {
            return Ok(self.last_output.clone());
        }

        let slot = if io.input.is_empty() { &io.default_input } else { &io.input };
        if slot.slottable {
            if let Value::String(s) = &slot.data {
                let scope = self.env.snapshot().await;
                return Ok(Value::String(template::render(s, &scope, true)?));
            }
        }
        Ok(slot.data.clone())
    }

    /// Drives the queue to completion, honoring pause/resume/stop control
    /// signals and retry policy, until the queue empties, cancellation fires,
    /// a unit fails outright, or a terminal unit raises its stop signal.
    pub async fn run(&mut self) -> Result<()> {
        if self.status().await == PipelineStatus::Pending {
            *self.status.write().await = PipelineStatus::Running;
        }
        let result = self.run_inner().await;

        let final_status = match &result {
            Ok(()) => PipelineStatus::Completed,
            Err(EngineError::UserTerminated) | Err(EngineError::Cancelled) => PipelineStatus::Terminal,
            Err(_) => PipelineStatus::Failed,
        };
        tracing::info!(status = final_status.as_str(), "pipeline run finished");
        *self.status.write().await = final_status;
        self.emit(StageEvent::AllCompleted {
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            loop {
                match self.status().await {
                    PipelineStatus::Paused => {
                        self.save_checkpoint().await?;
                        tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                        if self.env.is_cancelled() {
                            return Err(EngineError::Cancelled);
                        }
                    }
                    PipelineStatus::Terminal => {
                        self.save_checkpoint().await?;
                        return Err(EngineError::UserTerminated);
                    }
                    PipelineStatus::Resume => {
                        *self.status.write().await = PipelineStatus::Running;
                        break;
                    }
                    _ => break,
                }
            }

            if self.env.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            while self.current_stage_index < self.stages.len()
                && self.stages[self.current_stage_index].queue.is_empty()
            {
                self.current_stage_index += 1;
                self.current_unit_index = 0;
            }
            if self.current_stage_index >= self.stages.len() {
                return Ok(());
            }

            let shared = self.stages[self.current_stage_index]
                .queue
                .pop_front()
                .expect("non-empty stage checked above");

            let id = {
                let mut guard = shared.lock().await;
                guard.preset_id()
            };
            tracing::debug!(unit = %id, stage = self.current_stage_index, "dispatching unit");
            self.emit(StageEvent::Unit {
                id: id.clone(),
                status: StageStatus::Running,
            });

            let input = self.resolve_input(&shared).await?;
            let policy = shared.lock().await.retry_policy();

            let attempt_unit = Arc::clone(&shared);
            let attempt_env = self.env.clone();
            let attempt_input = input.clone();
            let exec_result = retry::execute_with_retry(policy, &self.env, move || {
                let attempt_unit = Arc::clone(&attempt_unit);
                let attempt_env = attempt_env.clone();
                let attempt_input = attempt_input.clone();
                async move {
                    let mut guard = attempt_unit.lock().await;
                    guard.execute(&attempt_env, attempt_input).await
                }
            })
            .await;

            let output = match exec_result {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(unit = %id, error = %e, "unit failed, stopping pipeline");
                    self.emit(StageEvent::Unit {
                        id,
                        status: StageStatus::Failed,
                    });
                    return Err(e);
                }
            };

            self.env.set_output(&id, output.clone()).await;
            self.last_output = output.clone();
            self.current_unit_index += 1;
            tracing::info!(unit = %id, stage = self.current_stage_index, "unit completed");
            self.emit(StageEvent::Unit {
                id: id.clone(),
                status: StageStatus::Completed,
            });

            let next_units = {
                let mut guard = shared.lock().await;
                guard.next(&self.env, &output).await?
            };
            if !next_units.is_empty() {
                let stage = &mut self.stages[self.current_stage_index];
                for unit in next_units.into_iter().rev() {
                    stage.queue.push_front(shared_unit(unit));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::FnUnit;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use workflow_checkpoint::InMemoryCheckpointSaver;

    fn log_unit(id: &str, out: &'static str) -> Box<dyn Unit> {
        Box::new(FnUnit::new("Log", move |_| async move { Ok(serde_json::json!(out)) }).with_id(id))
    }

    #[tokio::test]
    async fn linear_chain_runs_every_unit_in_order() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let units = vec![log_unit("a", "1"), log_unit("b", "2")];
        let mut pipeline = Pipeline::from_units(units, Arc::new(InMemoryCheckpointSaver::new())).with_callback(
            Arc::new(move |event| {
                if let StageEvent::Unit { id, status: StageStatus::Completed } = event {
                    seen2.lock().unwrap().push(id);
                }
            }),
        );
        pipeline.run().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(pipeline.status().await, PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn flowable_unit_inherits_predecessors_output() {
        let units = vec![
            log_unit("a", "hello"),
            Box::new(FnUnit::new("Echo", |v| async move { Ok(v) }).with_id("b")) as Box<dyn Unit>,
        ];
        let mut pipeline = Pipeline::from_units(units, Arc::new(InMemoryCheckpointSaver::new()));
        pipeline.run().await.unwrap();
        assert_eq!(
            pipeline.environment().get("b").await,
            Some(serde_json::json!({"output": "hello"}))
        );
    }

    #[tokio::test]
    async fn final_callback_carries_no_error_on_success() {
        let error_seen = Arc::new(StdMutex::new(None));
        let error_seen2 = Arc::clone(&error_seen);
        let units = vec![log_unit("a", "1")];
        let mut pipeline = Pipeline::from_units(units, Arc::new(InMemoryCheckpointSaver::new())).with_callback(
            Arc::new(move |event| {
                if let StageEvent::AllCompleted { error } = event {
                    *error_seen2.lock().unwrap() = Some(error);
                }
            }),
        );
        pipeline.run().await.unwrap();
        assert_eq!(*error_seen.lock().unwrap(), Some(None));
    }

    #[tokio::test]
    async fn failing_unit_stops_the_pipeline_and_reports_the_error() {
        let units: Vec<Box<dyn Unit>> = vec![Box::new(
            FnUnit::new("Boom", |_| async move { Err(EngineError::Other("kaboom".into())) }).with_id("a"),
        )];
        let mut pipeline = Pipeline::from_units(units, Arc::new(InMemoryCheckpointSaver::new()));
        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Other(_)));
        assert_eq!(pipeline.status().await, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn stop_requested_before_any_unit_runs_yields_zero_completions() {
        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = Arc::clone(&completed);
        let units = vec![log_unit("a", "1"), log_unit("b", "2"), log_unit("c", "3")];
        let checkpoint = Arc::new(InMemoryCheckpointSaver::new());
        let mut pipeline = Pipeline::from_units(units, Arc::clone(&checkpoint) as Arc<dyn CheckpointSaver>)
            .with_callback(Arc::new(move |event| {
                if let StageEvent::Unit { status: StageStatus::Completed, .. } = event {
                    completed2.fetch_add(1, Ordering::SeqCst);
                }
            }));

        pipeline.pause().await;
        // `stop` requested while still paused wins over the pause: the run
        // loop checks `Terminal` before `Paused` and exits without ever
        // dequeuing a unit.
        pipeline.stop().await;
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(err, EngineError::UserTerminated));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_from_checkpoint_skips_already_completed_units() {
        let units = vec![log_unit("a", "1"), log_unit("b", "2"), log_unit("c", "3")];
        let checkpoint = Arc::new(InMemoryCheckpointSaver::new());
        checkpoint
            .save(CheckpointState::new(1, 0, "paused"))
            .await
            .unwrap();

        let completed = Arc::new(StdMutex::new(Vec::new()));
        let completed2 = Arc::clone(&completed);
        let mut pipeline = Pipeline::from_units(units, Arc::clone(&checkpoint) as Arc<dyn CheckpointSaver>)
            .with_callback(Arc::new(move |event| {
                if let StageEvent::Unit { id, status: StageStatus::Completed } = event {
                    completed2.lock().unwrap().push(id);
                }
            }));
        pipeline.resume_from_checkpoint().await.unwrap();
        pipeline.run().await.unwrap();

        assert_eq!(*completed.lock().unwrap(), vec!["b".to_string(), "c".to_string()]);
    }
}
