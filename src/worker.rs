//! Worker capability seams and per-capability execution pools.
//!
//! Workers are opaque executors: the engine hands a subtask plus formatted
//! context to a handle from the [`WorkerFactory`] and awaits a
//! [`WorkerOutcome`]. Concurrency per capability is capped by a bounded
//! semaphore pool shared across all running tasks (e.g. concurrent browser
//! sessions), with permits released exactly once on drop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{EventSink, TaskEvent};
use crate::graph::{CapabilityType, PlannedSubtask, Subtask};
use crate::task::state::TaskState;
use crate::task::ConversationRole;

/// A worker's request to split remaining scope into new subtasks.
#[derive(Debug, Clone)]
pub struct SplitRequest {
    /// Summary of the progress already made by the splitting subtask.
    pub progress_summary: String,
    /// Self-contained follow-up subtasks; index deps refer to this batch.
    pub followups: Vec<PlannedSubtask>,
}

/// Result of a worker executing one subtask.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Present when the worker determined remaining scope is too large and
    /// requests a re-plan instead of finishing.
    pub split: Option<SplitRequest>,
}

impl WorkerOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            split: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            split: None,
        }
    }

    pub fn split(progress_summary: impl Into<String>, followups: Vec<PlannedSubtask>) -> Self {
        Self {
            success: true,
            output: String::new(),
            error: None,
            split: Some(SplitRequest {
                progress_summary: progress_summary.into(),
                followups,
            }),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("no worker available for capability {0}: {1}")]
    Unavailable(CapabilityType, String),
}

/// Mid-execution channel for asking the human operator a question.
///
/// The task is marked waiting while the question is outstanding, and the
/// answer (when one arrives) joins the conversation so later subtasks see
/// it in their context.
pub struct HumanInput {
    task: Arc<TaskState>,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
}

impl HumanInput {
    pub fn new(task: Arc<TaskState>, sink: Arc<dyn EventSink>, timeout: Duration) -> Self {
        Self {
            task,
            sink,
            timeout,
        }
    }

    /// Ask and suspend until an answer, the timeout, or cancellation.
    pub async fn request(&self, prompt: impl Into<String>) -> Option<String> {
        let prompt = prompt.into();
        self.sink
            .emit(TaskEvent::HumanInputRequested {
                task_id: self.task.id(),
                prompt,
            })
            .await;
        let _ = self.task.mark_waiting();
        let answer = self.task.wait_for_human_response(self.timeout).await;
        let _ = self.task.mark_running();
        if let Some(answer) = &answer {
            self.task
                .add_conversation(ConversationRole::User, answer.clone());
        }
        answer
    }
}

/// An external executor bound to one capability. Opaque to the engine.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Execute one subtask. Implementations must observe `cancel` at their
    /// own suspension points and return promptly once it fires.
    async fn execute(
        &self,
        subtask: &Subtask,
        context: &str,
        human: &HumanInput,
        cancel: &CancellationToken,
    ) -> WorkerOutcome;
}

/// Creates worker handles per capability, session and working directory.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create_worker(
        &self,
        capability: CapabilityType,
        session_id: &str,
        working_dir: &Path,
    ) -> Result<Arc<dyn WorkerHandle>, WorkerError>;
}

/// Process-wide per-capability execution pools.
///
/// The only cross-task shared state: each capability has a bounded number
/// of slots, acquisition queues when exhausted, and a permit is released
/// exactly once when the holder drops it — including on abnormal
/// termination of the holding task.
pub struct WorkerPools {
    browser: Arc<Semaphore>,
    document: Arc<Semaphore>,
    code: Arc<Semaphore>,
    multi_modal: Arc<Semaphore>,
}

impl WorkerPools {
    pub fn new(config: &Config) -> Self {
        let pool = |capability| Arc::new(Semaphore::new(config.pool_size(capability)));
        Self {
            browser: pool(CapabilityType::Browser),
            document: pool(CapabilityType::Document),
            code: pool(CapabilityType::Code),
            multi_modal: pool(CapabilityType::MultiModal),
        }
    }

    fn semaphore(&self, capability: CapabilityType) -> &Arc<Semaphore> {
        match capability {
            CapabilityType::Browser => &self.browser,
            CapabilityType::Document => &self.document,
            CapabilityType::Code => &self.code,
            CapabilityType::MultiModal => &self.multi_modal,
        }
    }

    /// Take a slot without waiting. Returns `None` when the pool is
    /// exhausted; the scheduler retries on the next tick.
    pub fn try_acquire(&self, capability: CapabilityType) -> Option<OwnedSemaphorePermit> {
        self.semaphore(capability).clone().try_acquire_owned().ok()
    }

    /// Wait for a slot, aborting the wait on cancellation.
    pub async fn acquire(
        &self,
        capability: CapabilityType,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(capability).clone();
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        }
    }

    pub fn available(&self, capability: CapabilityType) -> usize {
        self.semaphore(capability).available_permits()
    }
}

/// Trivial worker that completes a subtask by echoing its content.
///
/// Stands in for real capability runtimes in the headless binary and in
/// tests; a deployment registers its own [`WorkerFactory`].
pub struct EchoWorker {
    capability: CapabilityType,
}

#[async_trait]
impl WorkerHandle for EchoWorker {
    async fn execute(
        &self,
        subtask: &Subtask,
        _context: &str,
        _human: &HumanInput,
        cancel: &CancellationToken,
    ) -> WorkerOutcome {
        if cancel.is_cancelled() {
            return WorkerOutcome::failure("cancelled");
        }
        WorkerOutcome::success(format!("[{}] {}", self.capability, subtask.content))
    }
}

/// Factory producing [`EchoWorker`]s for every capability.
#[derive(Debug, Default)]
pub struct EchoWorkerFactory;

#[async_trait]
impl WorkerFactory for EchoWorkerFactory {
    async fn create_worker(
        &self,
        capability: CapabilityType,
        _session_id: &str,
        _working_dir: &Path,
    ) -> Result<Arc<dyn WorkerHandle>, WorkerError> {
        Ok(Arc::new(EchoWorker { capability }))
    }
}

/// Working directory passed to workers when workspace provisioning failed.
pub fn degraded_working_dir() -> PathBuf {
    std::env::temp_dir().join("taskweave")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;

    fn pools_with(browser: usize) -> WorkerPools {
        let mut config = Config::for_tests();
        config.browser_pool_size = browser;
        WorkerPools::new(&config)
    }

    #[tokio::test]
    async fn try_acquire_respects_capacity() {
        let pools = pools_with(2);
        let a = pools.try_acquire(CapabilityType::Browser);
        let b = pools.try_acquire(CapabilityType::Browser);
        let c = pools.try_acquire(CapabilityType::Browser);
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
        drop(a);
        assert_eq!(pools.available(CapabilityType::Browser), 1);
    }

    #[tokio::test]
    async fn permit_released_exactly_once_on_drop() {
        let pools = pools_with(1);
        {
            let permit = pools.try_acquire(CapabilityType::Browser).unwrap();
            assert_eq!(pools.available(CapabilityType::Browser), 0);
            drop(permit);
        }
        assert_eq!(pools.available(CapabilityType::Browser), 1);
    }

    #[tokio::test]
    async fn acquire_aborts_on_cancellation() {
        let pools = pools_with(1);
        let _held = pools.try_acquire(CapabilityType::Browser).unwrap();
        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            deadline.cancel();
        });
        // Pool is exhausted, so this queues until cancellation fires.
        let permit = pools.acquire(CapabilityType::Browser, &cancel).await;
        assert!(permit.is_none());
    }

    fn human_input_for_tests() -> (Arc<TaskState>, Arc<MemoryEventSink>, HumanInput) {
        let task = Arc::new(TaskState::new("t"));
        task.mark_running().unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let human = HumanInput::new(task.clone(), sink.clone(), Duration::from_millis(100));
        (task, sink, human)
    }

    #[tokio::test]
    async fn echo_worker_completes_subtask() {
        let factory = EchoWorkerFactory;
        let worker = factory
            .create_worker(CapabilityType::Code, "session", Path::new("/tmp"))
            .await
            .unwrap();
        let subtask = Subtask::new("write the parser", CapabilityType::Code);
        let (_task, _sink, human) = human_input_for_tests();
        let outcome = worker
            .execute(&subtask, "", &human, &CancellationToken::new())
            .await;
        assert!(outcome.success);
        assert!(outcome.output.contains("write the parser"));
    }

    #[tokio::test]
    async fn human_input_round_trip() {
        let (task, sink, human) = human_input_for_tests();
        let answered = {
            let task = task.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                task.provide_human_response("use the blue theme");
            })
        };
        let answer = human.request("which theme?").await;
        answered.await.unwrap();

        assert_eq!(answer.as_deref(), Some("use the blue theme"));
        // The question was surfaced and the answer joined the conversation.
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, TaskEvent::HumanInputRequested { .. })));
        assert!(task
            .conversation()
            .iter()
            .any(|e| e.content == "use the blue theme"));
        assert_eq!(task.status(), crate::task::TaskStatus::Running);
    }

    #[tokio::test]
    async fn human_input_times_out_to_none() {
        let (_task, _sink, human) = human_input_for_tests();
        assert!(human.request("anyone there?").await.is_none());
    }
}
