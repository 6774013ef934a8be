//! Top-level task pipeline.
//!
//! Owns the shared services (registry, pools, snapshot store, workspaces,
//! session chain) and runs each submitted request through the same
//! lifecycle: plan, validate, persist, execute, finalize. The terminal
//! handler runs exactly once per task however the engine ends, so the
//! end-of-task event and the final snapshot are never skipped and never
//! doubled.

use std::sync::Arc;

use crate::config::Config;
use crate::engine::{EngineOutcome, Orchestrator};
use crate::events::{EventSink, TaskEvent};
use crate::graph::planner::{LearnedPlan, PlanOutcome, Planner};
use crate::graph::{CapabilityType, GraphError, PlannedSubtask, SubtaskGraph, SubtaskState};
use crate::session::{HistoryCursor, HistoryPage, SessionManager};
use crate::snapshot::{SnapshotError, SnapshotStore, TaskSnapshot};
use crate::task::state::TaskState;
use crate::task::{ConversationRole, TaskId, TaskRegistry, TaskStatus};
use crate::worker::{WorkerFactory, WorkerPools};
use crate::workspace::WorkspaceManager;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] GraphError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Shared orchestration services plus the submit/control surface.
pub struct TaskPipeline {
    config: Config,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn SnapshotStore>,
    pools: Arc<WorkerPools>,
    factory: Arc<dyn WorkerFactory>,
    planner: Arc<dyn Planner>,
    workspaces: Arc<WorkspaceManager>,
    sessions: Arc<SessionManager>,
}

impl TaskPipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn SnapshotStore>,
        factory: Arc<dyn WorkerFactory>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        let pools = Arc::new(WorkerPools::new(&config));
        let workspaces = Arc::new(WorkspaceManager::new(config.workspace_root.clone()));
        let sessions = Arc::new(SessionManager::new(
            config.session_idle,
            config.session_carry_forward,
        ));
        Self {
            config,
            registry: Arc::new(TaskRegistry::new()),
            store,
            pools,
            factory,
            planner,
            workspaces,
            sessions,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Submit a request for execution. Returns once the task is planned,
    /// persisted and running; execution continues in the background.
    pub async fn submit(
        &self,
        description: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Result<TaskId, PipelineError> {
        self.submit_with_plan(description, None, sink).await
    }

    /// Submit with a previously learned plan as the decomposition seed.
    pub async fn submit_with_plan(
        &self,
        description: impl Into<String>,
        seed: Option<&LearnedPlan>,
        sink: Arc<dyn EventSink>,
    ) -> Result<TaskId, PipelineError> {
        let description = description.into();
        let task = Arc::new(TaskState::with_budget(
            &description,
            self.config.conversation_budget_bytes,
        ));
        let task_id = task.id();
        self.registry.insert(task.clone());

        self.sessions
            .append(ConversationRole::User, description.clone());
        let session_id = self.sessions.current_session_id().to_string();

        sink.emit(TaskEvent::Started {
            task_id,
            description: description.clone(),
        })
        .await;

        let plan = self.plan_or_fallback(&description, seed).await;
        let graph = match SubtaskGraph::from_planned(plan.subtasks) {
            Ok(graph) => graph,
            Err(err) => {
                // Fail fast before anything runs; the submitter gets the
                // error and the sink gets its one end event.
                tracing::warn!(task_id = %task_id, "plan rejected: {}", err);
                let _ = task.mark_failed(err.to_string());
                let mut snapshot = TaskSnapshot::new(task_id, &description);
                snapshot.status = TaskStatus::Failed;
                if let Err(save_err) = self.store.save(&snapshot).await {
                    tracing::warn!(task_id = %task_id, "failed-snapshot save failed: {}", save_err);
                }
                sink.emit(TaskEvent::Error {
                    task_id,
                    message: err.to_string(),
                })
                .await;
                sink.emit_end(task_id, TaskStatus::Failed, err.to_string())
                    .await;
                sink.close().await;
                self.registry.remove(task_id);
                return Err(err.into());
            }
        };

        let working_dir = self.workspaces.create_workspace(task_id).await;

        let mut snapshot = TaskSnapshot::new(task_id, &description);
        snapshot.plan_summary = plan.plan_summary;
        snapshot.subtasks = graph.subtasks().to_vec();
        self.store.save(&snapshot).await?;

        let _ = task.mark_running();
        self.store.update_status(task_id, TaskStatus::Running).await;
        sink.emit(TaskEvent::StatusChanged {
            task_id,
            status: TaskStatus::Running,
        })
        .await;

        self.spawn_engine(task, graph, sink, session_id, working_dir);
        Ok(task_id)
    }

    async fn plan_or_fallback(
        &self,
        description: &str,
        seed: Option<&LearnedPlan>,
    ) -> PlanOutcome {
        match self.planner.plan(description, seed).await {
            Ok(outcome) if !outcome.subtasks.is_empty() => outcome,
            Ok(_) => {
                tracing::warn!("planner produced an empty plan, using single step");
                single_step(description)
            }
            Err(err) => {
                tracing::warn!("planner failed, using single step: {}", err);
                single_step(description)
            }
        }
    }

    fn spawn_engine(
        &self,
        task: Arc<TaskState>,
        graph: SubtaskGraph,
        sink: Arc<dyn EventSink>,
        session_id: String,
        working_dir: std::path::PathBuf,
    ) {
        let engine = Orchestrator::new(
            task.clone(),
            graph,
            self.pools.clone(),
            self.factory.clone(),
            self.store.clone(),
            sink.clone(),
            &self.config,
            session_id,
            working_dir,
        );
        let registry = self.registry.clone();
        let store = self.store.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let outcome = engine.run().await;
            finalize(task, outcome, registry, store, sessions, sink).await;
        });
    }

    fn live_task(&self, task_id: TaskId) -> Result<Arc<TaskState>, PipelineError> {
        self.registry
            .get(task_id)
            .ok_or(PipelineError::UnknownTask(task_id))
    }

    /// Suspend scheduling for a running task.
    pub fn pause(&self, task_id: TaskId) -> Result<(), PipelineError> {
        self.live_task(task_id)?.pause();
        Ok(())
    }

    pub fn resume(&self, task_id: TaskId) -> Result<(), PipelineError> {
        self.live_task(task_id)?.resume();
        Ok(())
    }

    /// Cancel a task. The engine observes the signal, skips remaining
    /// subtasks and the terminal handler emits the end event.
    pub fn cancel(&self, task_id: TaskId) -> Result<(), PipelineError> {
        self.live_task(task_id)?.mark_cancelled();
        Ok(())
    }

    /// Deliver a mid-task steering message from the user.
    pub fn post_user_message(
        &self,
        task_id: TaskId,
        message: impl Into<String>,
    ) -> Result<(), PipelineError> {
        self.live_task(task_id)?.put_user_message(message);
        Ok(())
    }

    /// Answer an outstanding human-input request.
    pub fn provide_human_response(
        &self,
        task_id: TaskId,
        response: impl Into<String>,
    ) -> Result<(), PipelineError> {
        self.live_task(task_id)?.provide_human_response(response);
        Ok(())
    }

    /// Page backward through the cross-task conversation history.
    pub fn history_before(&self, cursor: Option<HistoryCursor>, limit: usize) -> HistoryPage {
        self.sessions.history_before(cursor, limit)
    }

    /// Resume every incomplete task found in the store, most recently
    /// active first. In-flight subtasks from before the restart are reset
    /// to open and re-run.
    pub async fn resume_incomplete<F>(&self, make_sink: F) -> Result<Vec<TaskId>, PipelineError>
    where
        F: Fn(TaskId) -> Arc<dyn EventSink>,
    {
        let incomplete = self.store.recover_incomplete().await?;
        let mut resumed = Vec::new();
        for mut snapshot in incomplete {
            let task_id = snapshot.task_id;
            if self.registry.get(task_id).is_some() {
                continue;
            }

            for subtask in &mut snapshot.subtasks {
                if matches!(
                    subtask.state,
                    SubtaskState::Assigned | SubtaskState::Running
                ) {
                    subtask.state = SubtaskState::Open;
                }
            }
            snapshot.status = TaskStatus::Running;
            snapshot.touch();
            self.store.save(&snapshot).await?;

            let mut record = crate::task::Task::new(&snapshot.user_request);
            record.id = task_id;
            record.created_at = snapshot.created_at;
            let task = Arc::new(TaskState::from_task(
                record,
                self.config.conversation_budget_bytes,
            ));
            let _ = task.mark_running();
            self.registry.insert(task.clone());

            let graph = SubtaskGraph::from_subtasks(snapshot.subtasks.clone());
            let working_dir = self.workspaces.create_workspace(task_id).await;
            let session_id = self.sessions.current_session_id().to_string();
            let sink = make_sink(task_id);
            sink.emit(TaskEvent::StatusChanged {
                task_id,
                status: TaskStatus::Running,
            })
            .await;

            tracing::info!(task_id = %task_id, "resuming incomplete task");
            self.spawn_engine(task, graph, sink, session_id, working_dir);
            resumed.push(task_id);
        }
        Ok(resumed)
    }
}

fn single_step(description: &str) -> PlanOutcome {
    PlanOutcome {
        plan_summary: None,
        subtasks: vec![PlannedSubtask::new(
            description,
            CapabilityType::infer(description),
        )],
    }
}

/// Terminal handler: record the final status everywhere, exactly once.
async fn finalize(
    task: Arc<TaskState>,
    outcome: EngineOutcome,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn SnapshotStore>,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn EventSink>,
) {
    let task_id = task.id();
    match outcome.status {
        TaskStatus::Completed => {
            let _ = task.mark_completed(Some(outcome.summary.clone()));
        }
        TaskStatus::Failed => {
            let _ = task.mark_failed(outcome.summary.clone());
        }
        // Cancellation already transitioned the task.
        _ => {}
    }
    let final_status = task.status();

    store.update_status(task_id, final_status).await;
    sessions.append(ConversationRole::TaskResult, outcome.summary.clone());

    sink.emit(TaskEvent::StatusChanged {
        task_id,
        status: final_status,
    })
    .await;
    sink.emit_end(task_id, final_status, outcome.summary).await;
    sink.close().await;

    registry.remove(task_id);
    tracing::info!(task_id = %task_id, status = %final_status, "task finalized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::graph::planner::SingleStepPlanner;
    use crate::snapshot::MemorySnapshotStore;
    use crate::worker::EchoWorkerFactory;
    use std::time::Duration;

    fn pipeline() -> TaskPipeline {
        TaskPipeline::new(
            Config::for_tests(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(EchoWorkerFactory),
            Arc::new(SingleStepPlanner),
        )
    }

    async fn wait_for_end(sink: &MemoryEventSink) {
        for _ in 0..100 {
            if sink.end_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task never emitted its end event");
    }

    #[tokio::test]
    async fn submit_runs_to_completion_with_one_end_event() {
        let pipeline = pipeline();
        let sink = Arc::new(MemoryEventSink::new());
        let task_id = pipeline
            .submit("summarize the weekly report", sink.clone())
            .await
            .unwrap();

        wait_for_end(&sink).await;
        assert_eq!(sink.end_count(), 1);
        assert!(sink.is_closed());
        // The live handle is gone once the task is terminal.
        assert!(pipeline.registry().get(task_id).is_none());

        let events = sink.events();
        assert!(matches!(events.first(), Some(TaskEvent::Started { .. })));
        match events.last() {
            Some(TaskEvent::End { status, .. }) => assert_eq!(*status, TaskStatus::Completed),
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_during_run_ends_exactly_once() {
        let pipeline = pipeline();
        let sink = Arc::new(MemoryEventSink::new());
        let seed = LearnedPlan {
            summary: "many steps".into(),
            subtasks: (0..4)
                .map(|i| PlannedSubtask::new(format!("step {i}"), CapabilityType::Code))
                .collect(),
        };
        let task_id = pipeline
            .submit_with_plan("long batch", Some(&seed), sink.clone())
            .await
            .unwrap();
        // Cancel may race normal completion; either way there is one end.
        let _ = pipeline.cancel(task_id);

        wait_for_end(&sink).await;
        assert_eq!(sink.end_count(), 1);
    }

    #[tokio::test]
    async fn invalid_plan_fails_fast() {
        let pipeline = pipeline();
        let sink = Arc::new(MemoryEventSink::new());
        let seed = LearnedPlan {
            summary: "broken".into(),
            subtasks: vec![
                PlannedSubtask::new("a", CapabilityType::Code).with_dependencies(vec![1]),
                PlannedSubtask::new("b", CapabilityType::Code).with_dependencies(vec![0]),
            ],
        };
        let result = pipeline
            .submit_with_plan("cyclic request", Some(&seed), sink.clone())
            .await;
        assert!(matches!(result, Err(PipelineError::InvalidPlan(_))));
        assert_eq!(sink.end_count(), 1);
        match sink.events().last() {
            Some(TaskEvent::End { status, .. }) => assert_eq!(*status, TaskStatus::Failed),
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_operations_reject_unknown_tasks() {
        let pipeline = pipeline();
        let id = TaskId::new();
        assert!(matches!(pipeline.pause(id), Err(PipelineError::UnknownTask(_))));
        assert!(matches!(pipeline.cancel(id), Err(PipelineError::UnknownTask(_))));
        assert!(matches!(
            pipeline.post_user_message(id, "hi"),
            Err(PipelineError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn restart_resumes_incomplete_tasks() {
        let store = Arc::new(MemorySnapshotStore::new());
        // A snapshot left behind by a previous process, mid-execution.
        let mut snapshot = TaskSnapshot::new(TaskId::new(), "finish the migration");
        snapshot.status = TaskStatus::Running;
        let mut first = crate::graph::Subtask::new("step one", CapabilityType::Code);
        first.state = SubtaskState::Running;
        let second = crate::graph::Subtask::new("step two", CapabilityType::Code);
        snapshot.subtasks = vec![first, second];
        store.save(&snapshot).await.unwrap();

        let pipeline = TaskPipeline::new(
            Config::for_tests(),
            store.clone(),
            Arc::new(EchoWorkerFactory),
            Arc::new(SingleStepPlanner),
        );
        let sink = Arc::new(MemoryEventSink::new());
        let sink_for_task = sink.clone();
        let resumed = pipeline
            .resume_incomplete(move |_| sink_for_task.clone() as Arc<dyn EventSink>)
            .await
            .unwrap();
        assert_eq!(resumed, vec![snapshot.task_id]);

        wait_for_end(&sink).await;
        let stored = store.load(snapshot.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored
            .subtasks
            .iter()
            .all(|s| s.state == SubtaskState::Done));
    }

    #[tokio::test]
    async fn task_results_land_in_the_session_chain() {
        let pipeline = pipeline();
        let sink = Arc::new(MemoryEventSink::new());
        pipeline.submit("quick request", sink.clone()).await.unwrap();
        wait_for_end(&sink).await;

        let page = pipeline.history_before(None, 10);
        assert!(page
            .messages
            .iter()
            .any(|m| m.role == ConversationRole::User && m.content == "quick request"));
        assert!(page
            .messages
            .iter()
            .any(|m| m.role == ConversationRole::TaskResult));
    }
}
