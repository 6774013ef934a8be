//! Subtask scheduling and execution loop.
//!
//! The orchestrator drives one task's subtask graph to completion: it
//! dispatches every ready subtask whose capability pool has a free slot,
//! runs them concurrently on a [`JoinSet`], and folds completions back into
//! the graph. Failures cascade as skips to dependents, worker-requested
//! splits graft new subtasks mid-run, and pause and cancellation are
//! observed between scheduling steps.
//!
//! The loop always terminates: every subtask reaches a terminal state, is
//! skipped by the unreachable cascade, or is skipped by cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::build_subtask_context;
use crate::events::{EventSink, TaskEvent};
use crate::graph::{GraphCounts, Subtask, SubtaskGraph, SubtaskId, SubtaskState};
use crate::snapshot::SnapshotStore;
use crate::task::state::TaskState;
use crate::task::{ConversationRole, TaskId, TaskStatus};
use crate::worker::{HumanInput, WorkerFactory, WorkerOutcome, WorkerPools};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const USER_MESSAGE_POLL: Duration = Duration::from_millis(250);

/// Terminal result of one engine run.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub status: TaskStatus,
    pub summary: String,
    pub counts: GraphCounts,
}

struct SubtaskCompletion {
    subtask_id: SubtaskId,
    attempts: u32,
    outcome: WorkerOutcome,
}

/// Executes one task's subtask graph.
pub struct Orchestrator {
    task: Arc<TaskState>,
    task_id: TaskId,
    description: String,
    graph: SubtaskGraph,
    pools: Arc<WorkerPools>,
    factory: Arc<dyn WorkerFactory>,
    store: Arc<dyn SnapshotStore>,
    sink: Arc<dyn EventSink>,
    max_retries: u32,
    context_budget: usize,
    human_timeout: Duration,
    session_id: String,
    working_dir: PathBuf,
    inflight: JoinSet<SubtaskCompletion>,
    running: HashMap<tokio::task::Id, SubtaskId>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: Arc<TaskState>,
        graph: SubtaskGraph,
        pools: Arc<WorkerPools>,
        factory: Arc<dyn WorkerFactory>,
        store: Arc<dyn SnapshotStore>,
        sink: Arc<dyn EventSink>,
        config: &Config,
        session_id: String,
        working_dir: PathBuf,
    ) -> Self {
        let task_id = task.id();
        let description = task.task().description;
        Self {
            task,
            task_id,
            description,
            graph,
            pools,
            factory,
            store,
            sink,
            max_retries: config.max_subtask_retries,
            context_budget: config.conversation_budget_bytes,
            human_timeout: config.human_response_timeout,
            session_id,
            working_dir,
            inflight: JoinSet::new(),
            running: HashMap::new(),
        }
    }

    /// Run the graph to a terminal state.
    pub async fn run(mut self) -> EngineOutcome {
        loop {
            self.task.increment_loop_iteration();
            self.task.wait_while_paused().await;
            if self.task.is_cancelled() {
                return self.finish_cancelled().await;
            }

            self.schedule_ready().await;

            if self.graph.all_terminal() && self.running.is_empty() {
                break;
            }

            if self.running.is_empty() {
                self.advance_idle().await;
            } else {
                self.await_next_event().await;
            }
        }
        self.finish().await
    }

    /// Dispatch every ready subtask that can take a pool slot right now.
    async fn schedule_ready(&mut self) {
        for id in self.graph.ready_subtasks() {
            let capability = match self.graph.get(id) {
                Some(subtask) => subtask.capability,
                None => continue,
            };
            let Some(permit) = self.pools.try_acquire(capability) else {
                continue;
            };
            self.dispatch(id, permit).await;
        }
    }

    /// Nothing in flight and nothing dispatched: either wait for a pool
    /// slot for the next ready subtask, or collapse unreachable work.
    async fn advance_idle(&mut self) {
        let ready = self.graph.ready_subtasks();
        if let Some(&next) = ready.first() {
            let capability = match self.graph.get(next) {
                Some(subtask) => subtask.capability,
                None => return,
            };
            let cancel = self.task.cancellation_token();
            if let Some(permit) = self.pools.acquire(capability, &cancel).await {
                self.dispatch(next, permit).await;
            }
            return;
        }

        let skipped = self.graph.skip_unreachable();
        self.publish_skipped(skipped).await;

        if !self.graph.all_terminal() && self.graph.ready_subtasks().is_empty() {
            // No runnable work is left but open subtasks remain. A validated
            // graph cannot reach this; close it out rather than spin.
            tracing::error!(task_id = %self.task_id, "graph stalled with open subtasks");
            let skipped = self.graph.skip_remaining();
            self.publish_skipped(skipped).await;
        }
    }

    /// Wait for the next completion, cancellation, or steering message.
    async fn await_next_event(&mut self) {
        let task = self.task.clone();
        let sink = self.sink.clone();
        let cancel = self.task.cancellation_token();
        let task_id = self.task_id;
        tokio::select! {
            _ = cancel.cancelled() => {}
            joined = self.inflight.join_next_with_id() => {
                if let Some(joined) = joined {
                    self.handle_completion(joined).await;
                }
            }
            message = task.get_user_message(USER_MESSAGE_POLL) => {
                if let Some(message) = message {
                    task.add_conversation(ConversationRole::User, message.clone());
                    sink.emit(TaskEvent::Conversation {
                        task_id,
                        role: ConversationRole::User,
                        content: message,
                    })
                    .await;
                }
            }
        }
        // If another arm won, the message wait above may still be
        // registered; drop it so it cannot swallow a later message.
        self.task.cancel_last_get_user_message();
    }

    async fn dispatch(&mut self, id: SubtaskId, permit: OwnedSemaphorePermit) {
        let subtask = match self.graph.get(id) {
            Some(subtask) => subtask.clone(),
            None => return,
        };
        let _ = self.graph.mark(id, SubtaskState::Assigned, None, None);
        self.publish_subtask(id, SubtaskState::Assigned, None).await;

        let context = build_subtask_context(
            &self.description,
            &self.task.conversation(),
            self.context_budget,
        );

        let _ = self.graph.mark(id, SubtaskState::Running, None, None);
        self.store
            .update_subtask_state(self.task_id, id, SubtaskState::Running, None, None)
            .await;
        self.publish_subtask(id, SubtaskState::Running, None).await;

        tracing::debug!(task_id = %self.task_id, subtask_id = %id, capability = %subtask.capability, "dispatching subtask");
        let human = HumanInput::new(self.task.clone(), self.sink.clone(), self.human_timeout);
        let handle = self.inflight.spawn(execute_subtask(
            self.factory.clone(),
            subtask,
            context,
            human,
            self.task.cancellation_token(),
            self.session_id.clone(),
            self.working_dir.clone(),
            self.max_retries,
            permit,
        ));
        self.running.insert(handle.id(), id);
    }

    async fn handle_completion(
        &mut self,
        joined: Result<(tokio::task::Id, SubtaskCompletion), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((handle_id, completion)) => {
                self.running.remove(&handle_id);
                if let Some(subtask) = self.graph.get_mut(completion.subtask_id) {
                    subtask.attempts = completion.attempts;
                }
                self.apply_outcome(completion.subtask_id, completion.outcome)
                    .await;
            }
            Err(join_err) => {
                let Some(subtask_id) = self.running.remove(&join_err.id()) else {
                    tracing::error!(task_id = %self.task_id, "completion for untracked subtask: {}", join_err);
                    return;
                };
                self.fail_subtask(subtask_id, format!("subtask aborted: {}", join_err))
                    .await;
            }
        }
    }

    async fn apply_outcome(&mut self, id: SubtaskId, outcome: WorkerOutcome) {
        if let Some(split) = outcome.split {
            match self
                .graph
                .graft_split(id, split.progress_summary.clone(), split.followups)
            {
                Ok(new_ids) => {
                    tracing::info!(task_id = %self.task_id, subtask_id = %id, grafted = new_ids.len(), "subtask split into follow-ups");
                    self.task
                        .add_conversation(ConversationRole::TaskResult, split.progress_summary);
                    self.publish_subtask(id, SubtaskState::Done, None).await;
                    // The graph changed shape; persist it whole.
                    self.persist_graph().await;
                    self.publish_progress().await;
                }
                Err(err) => {
                    self.fail_subtask(id, format!("invalid split request: {}", err))
                        .await;
                }
            }
            return;
        }

        if outcome.success {
            let _ = self
                .graph
                .mark(id, SubtaskState::Done, Some(outcome.output.clone()), None);
            self.store
                .update_subtask_state(
                    self.task_id,
                    id,
                    SubtaskState::Done,
                    Some(outcome.output.clone()),
                    None,
                )
                .await;
            self.task
                .add_conversation(ConversationRole::TaskResult, outcome.output);
            self.publish_subtask(id, SubtaskState::Done, None).await;
            self.publish_progress().await;
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "worker failed without detail".to_string());
            self.fail_subtask(id, error).await;
        }
    }

    async fn fail_subtask(&mut self, id: SubtaskId, error: String) {
        tracing::warn!(task_id = %self.task_id, subtask_id = %id, "subtask failed: {}", error);
        let _ = self
            .graph
            .mark(id, SubtaskState::Failed, None, Some(error.clone()));
        self.store
            .update_subtask_state(
                self.task_id,
                id,
                SubtaskState::Failed,
                None,
                Some(error.clone()),
            )
            .await;
        self.publish_subtask(id, SubtaskState::Failed, Some(error))
            .await;

        let skipped = self.graph.skip_unreachable();
        self.publish_skipped(skipped).await;
        self.publish_progress().await;
    }

    async fn publish_skipped(&self, skipped: Vec<SubtaskId>) {
        for id in skipped {
            self.store
                .update_subtask_state(self.task_id, id, SubtaskState::Skipped, None, None)
                .await;
            self.publish_subtask(id, SubtaskState::Skipped, None).await;
        }
    }

    async fn publish_subtask(&self, id: SubtaskId, state: SubtaskState, error: Option<String>) {
        self.sink
            .emit(TaskEvent::SubtaskUpdate {
                task_id: self.task_id,
                subtask_id: id,
                state,
                error,
            })
            .await;
    }

    async fn publish_progress(&self) {
        let counts = self.graph.counts();
        let terminal = counts.done + counts.failed + counts.skipped;
        let percent = ((terminal * 100) / counts.total.max(1)) as u8;
        self.task.set_progress(percent);
        let current = self
            .graph
            .subtasks()
            .iter()
            .find(|s| s.state == SubtaskState::Running)
            .map(|s| s.content.clone());
        self.sink
            .emit(TaskEvent::Progress {
                task_id: self.task_id,
                total_subtasks: counts.total,
                completed_subtasks: counts.done,
                current_subtask: current,
            })
            .await;
    }

    /// Replace the persisted subtask list with the live graph.
    async fn persist_graph(&self) {
        match self.store.load(self.task_id).await {
            Ok(Some(mut snapshot)) => {
                snapshot.subtasks = self.graph.subtasks().to_vec();
                snapshot.touch();
                if let Err(err) = self.store.save(&snapshot).await {
                    tracing::warn!(task_id = %self.task_id, "graph persist failed: {}", err);
                }
            }
            Ok(None) => {
                tracing::warn!(task_id = %self.task_id, "no snapshot to persist graph into");
            }
            Err(err) => {
                tracing::warn!(task_id = %self.task_id, "snapshot load failed: {}", err);
            }
        }
    }

    async fn finish_cancelled(&mut self) -> EngineOutcome {
        // Abort in-flight work; pool permits release as the futures drop.
        self.inflight.shutdown().await;
        self.running.clear();
        let skipped = self.graph.skip_remaining();
        self.publish_skipped(skipped).await;
        self.persist_graph().await;
        EngineOutcome {
            status: TaskStatus::Cancelled,
            summary: "task cancelled".to_string(),
            counts: self.graph.counts(),
        }
    }

    async fn finish(&mut self) -> EngineOutcome {
        self.persist_graph().await;
        let counts = self.graph.counts();
        let (status, summary) = if counts.done == 0 && counts.failed > 0 {
            let first_error = self
                .graph
                .subtasks()
                .iter()
                .find(|s| s.state == SubtaskState::Failed)
                .and_then(|s| s.error.clone())
                .unwrap_or_else(|| "all subtasks failed".to_string());
            (TaskStatus::Failed, first_error)
        } else if counts.failed > 0 || counts.skipped > 0 {
            let deliverable = self.graph.deliverable().unwrap_or("").to_string();
            let summary = format!(
                "completed {} of {} subtasks ({} failed, {} skipped). {}",
                counts.done, counts.total, counts.failed, counts.skipped, deliverable
            );
            (TaskStatus::Completed, summary.trim_end().to_string())
        } else {
            let summary = self
                .graph
                .deliverable()
                .unwrap_or("all subtasks completed")
                .to_string();
            (TaskStatus::Completed, summary)
        };
        EngineOutcome {
            status,
            summary,
            counts,
        }
    }
}

/// Run one subtask to completion, retrying failures with jittered
/// exponential backoff. The pool permit is held for the whole attempt
/// sequence and released exactly once when this future ends, however it
/// ends.
#[allow(clippy::too_many_arguments)]
async fn execute_subtask(
    factory: Arc<dyn WorkerFactory>,
    subtask: Subtask,
    context: String,
    human: HumanInput,
    cancel: CancellationToken,
    session_id: String,
    working_dir: PathBuf,
    max_retries: u32,
    _permit: OwnedSemaphorePermit,
) -> SubtaskCompletion {
    let subtask_id = subtask.id;
    let mut last_error = String::new();
    for attempt in 0..=max_retries {
        let attempts = attempt + 1;
        if cancel.is_cancelled() {
            return SubtaskCompletion {
                subtask_id,
                attempts,
                outcome: WorkerOutcome::failure("cancelled"),
            };
        }

        let outcome = match factory
            .create_worker(subtask.capability, &session_id, &working_dir)
            .await
        {
            Ok(worker) => worker.execute(&subtask, &context, &human, &cancel).await,
            Err(err) => WorkerOutcome::failure(err.to_string()),
        };

        if outcome.success || cancel.is_cancelled() {
            return SubtaskCompletion {
                subtask_id,
                attempts,
                outcome,
            };
        }
        last_error = outcome
            .error
            .unwrap_or_else(|| "worker failed without detail".to_string());

        if attempt < max_retries {
            tracing::debug!(subtask_id = %subtask_id, attempt = attempts, "retrying subtask: {}", last_error);
            tokio::select! {
                _ = tokio::time::sleep(retry_backoff(attempt)) => {}
                _ = cancel.cancelled() => {
                    return SubtaskCompletion {
                        subtask_id,
                        attempts,
                        outcome: WorkerOutcome::failure(last_error),
                    };
                }
            }
        }
    }
    SubtaskCompletion {
        subtask_id,
        attempts: max_retries + 1,
        outcome: WorkerOutcome::failure(last_error),
    }
}

/// Exponential backoff with ±50% jitter, capped.
fn retry_backoff(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RETRY_MAX_DELAY);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(jitter).min(RETRY_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::graph::{CapabilityType, PlannedSubtask};
    use crate::snapshot::{MemorySnapshotStore, SnapshotStore, TaskSnapshot};
    use crate::worker::{EchoWorkerFactory, SplitRequest, WorkerError, WorkerHandle};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn planned(content: &str, deps: Vec<usize>) -> PlannedSubtask {
        PlannedSubtask {
            content: content.to_string(),
            capability: CapabilityType::Code,
            depends_on: deps,
        }
    }

    struct Harness {
        task: Arc<TaskState>,
        store: Arc<MemorySnapshotStore>,
        sink: Arc<MemoryEventSink>,
        pools: Arc<WorkerPools>,
    }

    async fn orchestrator(
        plan: Vec<PlannedSubtask>,
        factory: Arc<dyn WorkerFactory>,
        config: &Config,
    ) -> (Orchestrator, Harness) {
        let task = Arc::new(TaskState::new("integration task"));
        task.mark_running().unwrap();
        let graph = SubtaskGraph::from_planned(plan).unwrap();
        let store = Arc::new(MemorySnapshotStore::new());
        let mut snapshot = TaskSnapshot::new(task.id(), "integration task");
        snapshot.status = TaskStatus::Running;
        snapshot.subtasks = graph.subtasks().to_vec();
        store.save(&snapshot).await.unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let pools = Arc::new(WorkerPools::new(config));
        let engine = Orchestrator::new(
            task.clone(),
            graph,
            pools.clone(),
            factory,
            store.clone(),
            sink.clone(),
            config,
            "session".to_string(),
            std::env::temp_dir(),
        );
        (engine, Harness { task, store, sink, pools })
    }

    #[tokio::test]
    async fn linear_plan_runs_to_completion() {
        let config = Config::for_tests();
        let plan = vec![
            planned("collect input", vec![]),
            planned("produce report", vec![0]),
        ];
        let (engine, harness) =
            orchestrator(plan, Arc::new(EchoWorkerFactory), &config).await;
        let outcome = engine.run().await;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.counts.done, 2);
        assert!(outcome.summary.contains("produce report"));

        let snapshot = harness.store.load(harness.task.id()).await.unwrap().unwrap();
        assert!(snapshot
            .subtasks
            .iter()
            .all(|s| s.state == SubtaskState::Done));
    }

    struct CountingWorker {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerHandle for CountingWorker {
        async fn execute(
            &self,
            subtask: &Subtask,
            _context: &str,
            _human: &HumanInput,
            _cancel: &CancellationToken,
        ) -> WorkerOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            WorkerOutcome::success(subtask.content.clone())
        }
    }

    struct CountingFactory {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerFactory for CountingFactory {
        async fn create_worker(
            &self,
            _capability: CapabilityType,
            _session_id: &str,
            _working_dir: &Path,
        ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
            Ok(Arc::new(CountingWorker {
                active: self.active.clone(),
                peak: self.peak.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_subtasks() {
        let mut config = Config::for_tests();
        config.code_pool_size = 1;
        let peak = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory {
            active: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        });
        let plan = vec![
            planned("a", vec![]),
            planned("b", vec![]),
            planned("c", vec![]),
        ];
        let (engine, _harness) = orchestrator(plan, factory, &config).await;
        let outcome = engine.run().await;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    struct ScriptedWorker;

    #[async_trait]
    impl WorkerHandle for ScriptedWorker {
        async fn execute(
            &self,
            subtask: &Subtask,
            _context: &str,
            _human: &HumanInput,
            _cancel: &CancellationToken,
        ) -> WorkerOutcome {
            if subtask.content.contains("explode") {
                WorkerOutcome::failure("scripted failure")
            } else {
                WorkerOutcome::success(subtask.content.clone())
            }
        }
    }

    struct ScriptedFactory;

    #[async_trait]
    impl WorkerFactory for ScriptedFactory {
        async fn create_worker(
            &self,
            _capability: CapabilityType,
            _session_id: &str,
            _working_dir: &Path,
        ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
            Ok(Arc::new(ScriptedWorker))
        }
    }

    #[tokio::test]
    async fn failure_cascades_skips_to_dependents() {
        let mut config = Config::for_tests();
        config.max_subtask_retries = 0;
        let plan = vec![
            planned("explode early", vec![]),
            planned("depends on failure", vec![0]),
            planned("independent branch", vec![]),
        ];
        let (engine, harness) = orchestrator(plan, Arc::new(ScriptedFactory), &config).await;
        let outcome = engine.run().await;
        // The independent branch still completed, so the task did too.
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.counts.failed, 1);
        assert_eq!(outcome.counts.skipped, 1);
        assert_eq!(outcome.counts.done, 1);

        let events = harness.sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::SubtaskUpdate { state: SubtaskState::Skipped, .. }
        )));
    }

    #[tokio::test]
    async fn all_failures_fail_the_task() {
        let mut config = Config::for_tests();
        config.max_subtask_retries = 0;
        let plan = vec![planned("explode now", vec![])];
        let (engine, _harness) = orchestrator(plan, Arc::new(ScriptedFactory), &config).await;
        let outcome = engine.run().await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.summary, "scripted failure");
    }

    struct FlakyWorker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerHandle for FlakyWorker {
        async fn execute(
            &self,
            subtask: &Subtask,
            _context: &str,
            _human: &HumanInput,
            _cancel: &CancellationToken,
        ) -> WorkerOutcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                WorkerOutcome::failure("transient")
            } else {
                WorkerOutcome::success(subtask.content.clone())
            }
        }
    }

    struct FlakyFactory {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerFactory for FlakyFactory {
        async fn create_worker(
            &self,
            _capability: CapabilityType,
            _session_id: &str,
            _working_dir: &Path,
        ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
            Ok(Arc::new(FlakyWorker {
                calls: self.calls.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let config = Config::for_tests();
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(FlakyFactory { calls: calls.clone() });
        let plan = vec![planned("fetch flaky endpoint", vec![])];
        let (engine, _harness) = orchestrator(plan, factory, &config).await;
        let outcome = engine.run().await;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct SplittingWorker;

    #[async_trait]
    impl WorkerHandle for SplittingWorker {
        async fn execute(
            &self,
            subtask: &Subtask,
            _context: &str,
            _human: &HumanInput,
            _cancel: &CancellationToken,
        ) -> WorkerOutcome {
            if subtask.content.contains("survey the whole site") {
                WorkerOutcome {
                    success: true,
                    output: String::new(),
                    error: None,
                    split: Some(SplitRequest {
                        progress_summary: "found three sections".to_string(),
                        followups: vec![
                            planned("read section one", vec![]),
                            planned("read section two", vec![]),
                            planned("merge section notes", vec![0, 1]),
                        ],
                    }),
                }
            } else {
                WorkerOutcome::success(subtask.content.clone())
            }
        }
    }

    struct SplittingFactory;

    #[async_trait]
    impl WorkerFactory for SplittingFactory {
        async fn create_worker(
            &self,
            _capability: CapabilityType,
            _session_id: &str,
            _working_dir: &Path,
        ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
            Ok(Arc::new(SplittingWorker))
        }
    }

    #[tokio::test]
    async fn split_grafts_followups_and_completes() {
        let config = Config::for_tests();
        let plan = vec![
            planned("survey the whole site", vec![]),
            planned("write final summary", vec![0]),
        ];
        let (engine, harness) = orchestrator(plan, Arc::new(SplittingFactory), &config).await;
        let outcome = engine.run().await;
        assert_eq!(outcome.status, TaskStatus::Completed);
        // 2 original + 3 grafted.
        assert_eq!(outcome.counts.total, 5);
        assert_eq!(outcome.counts.done, 5);

        let snapshot = harness.store.load(harness.task.id()).await.unwrap().unwrap();
        assert_eq!(snapshot.subtasks.len(), 5);
        // The final summary still ran after every follow-up.
        assert!(outcome.summary.contains("write final summary"));
    }

    struct SlowWorker;

    #[async_trait]
    impl WorkerHandle for SlowWorker {
        async fn execute(
            &self,
            _subtask: &Subtask,
            _context: &str,
            _human: &HumanInput,
            cancel: &CancellationToken,
        ) -> WorkerOutcome {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => WorkerOutcome::success("done"),
                _ = cancel.cancelled() => WorkerOutcome::failure("cancelled"),
            }
        }
    }

    struct SlowFactory;

    #[async_trait]
    impl WorkerFactory for SlowFactory {
        async fn create_worker(
            &self,
            _capability: CapabilityType,
            _session_id: &str,
            _working_dir: &Path,
        ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
            Ok(Arc::new(SlowWorker))
        }
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_subtasks() {
        let config = Config::for_tests();
        let plan = vec![planned("slow step", vec![]), planned("after", vec![0])];
        let (engine, harness) = orchestrator(plan, Arc::new(SlowFactory), &config).await;
        let task = harness.task.clone();
        let run = tokio::spawn(engine.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.mark_cancelled();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        let counts = outcome.counts;
        assert_eq!(counts.done + counts.failed + counts.skipped, counts.total);
        assert!(counts.skipped >= 1);
        // Aborted work returned its pool slot; nothing leaked.
        assert_eq!(
            harness.pools.available(CapabilityType::Code),
            config.code_pool_size
        );
    }

    #[tokio::test]
    async fn pause_defers_new_dispatch() {
        let config = Config::for_tests();
        let plan = vec![planned("only step", vec![])];
        let (engine, harness) =
            orchestrator(plan, Arc::new(EchoWorkerFactory), &config).await;
        harness.task.pause();
        let run = tokio::spawn(engine.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(harness.sink.events().is_empty());
        assert!(!run.is_finished());

        harness.task.resume();
        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
    }

    struct AskingWorker;

    #[async_trait]
    impl WorkerHandle for AskingWorker {
        async fn execute(
            &self,
            subtask: &Subtask,
            _context: &str,
            human: &HumanInput,
            _cancel: &CancellationToken,
        ) -> WorkerOutcome {
            match human.request("which environment?").await {
                Some(answer) => {
                    WorkerOutcome::success(format!("{} in {}", subtask.content, answer))
                }
                None => WorkerOutcome::failure("no answer from operator"),
            }
        }
    }

    struct AskingFactory;

    #[async_trait]
    impl WorkerFactory for AskingFactory {
        async fn create_worker(
            &self,
            _capability: CapabilityType,
            _session_id: &str,
            _working_dir: &Path,
        ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
            Ok(Arc::new(AskingWorker))
        }
    }

    #[tokio::test]
    async fn worker_question_is_answered_mid_run() {
        let config = Config::for_tests();
        let plan = vec![planned("deploy the service", vec![])];
        let (engine, harness) = orchestrator(plan, Arc::new(AskingFactory), &config).await;
        let task = harness.task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            task.provide_human_response("staging");
        });

        let outcome = engine.run().await;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert!(outcome.summary.contains("staging"));
        assert!(harness
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, TaskEvent::HumanInputRequested { .. })));
    }

    #[tokio::test]
    async fn mid_run_user_message_lands_in_conversation() {
        let config = Config::for_tests();
        let plan = vec![planned("slow step", vec![])];
        let (engine, harness) = orchestrator(plan, Arc::new(SlowFactory), &config).await;
        let task = harness.task.clone();
        let run = tokio::spawn(engine.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.put_user_message("prefer the short version");
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.mark_cancelled();
        let _ = run.await.unwrap();

        assert!(task
            .conversation()
            .iter()
            .any(|e| e.content == "prefer the short version"));
    }
}
