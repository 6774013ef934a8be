//! Per-task runtime state and blocking/suspending primitives.
//!
//! One [`TaskState`] exists per in-flight task. It owns:
//! - the authoritative [`Task`] record and its status transitions,
//! - the size-bounded conversation buffer,
//! - FIFO wait queues for human responses and user messages,
//! - the pause gate and the cancellation token.
//!
//! Every suspension point is cancellation-aware, and every registered wait
//! has a guaranteed removal path (response, timeout, explicit cancel, or
//! task cancellation) — no waiter is ever leaked.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::{
    ConversationEntry, ConversationRole, Task, TaskError, TaskId, TaskStatus, ToolCallRecord,
};

/// Default aggregate conversation budget (100 KB).
pub const DEFAULT_CONVERSATION_BUDGET_BYTES: usize = 100 * 1024;

/// At least this many entries are always retained, regardless of size.
pub const MIN_RETAINED_ENTRIES: usize = 2;

/// Cap on the recorded tool-call log.
const MAX_TOOL_CALLS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    HumanResponse,
    UserMessage,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Option<String>>,
}

#[derive(Default)]
struct WaitQueues {
    human: VecDeque<Waiter>,
    user_msg: VecDeque<Waiter>,
    /// Messages put while no `get_user_message` waiter existed.
    buffered: VecDeque<String>,
}

struct Conversation {
    entries: VecDeque<ConversationEntry>,
    total_bytes: usize,
    budget: usize,
}

/// Authoritative in-memory state for one task.
pub struct TaskState {
    task: Mutex<Task>,
    conversation: Mutex<Conversation>,
    waits: Mutex<WaitQueues>,
    paused: AtomicBool,
    pause_notify: Notify,
    cancel: CancellationToken,
    next_wait_id: AtomicU64,
}

impl TaskState {
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_budget(description, DEFAULT_CONVERSATION_BUDGET_BYTES)
    }

    pub fn with_budget(description: impl Into<String>, budget: usize) -> Self {
        Self::from_task(Task::new(description), budget)
    }

    /// Wrap an existing task record (restart recovery keeps the id).
    pub fn from_task(task: Task, budget: usize) -> Self {
        Self {
            task: Mutex::new(task),
            conversation: Mutex::new(Conversation {
                entries: VecDeque::new(),
                total_bytes: 0,
                budget,
            }),
            waits: Mutex::new(WaitQueues::default()),
            paused: AtomicBool::new(false),
            pause_notify: Notify::new(),
            cancel: CancellationToken::new(),
            next_wait_id: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.lock().expect("task mutex poisoned").id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.lock().expect("task mutex poisoned").status
    }

    /// Snapshot of the current task record.
    pub fn task(&self) -> Task {
        self.task.lock().expect("task mutex poisoned").clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ── Status transitions ───────────────────────────────────────────────

    fn transition(&self, target: TaskStatus) -> Result<(), TaskError> {
        self.task
            .lock()
            .expect("task mutex poisoned")
            .transition_to(target)
    }

    pub fn mark_running(&self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Running)
    }

    pub fn mark_waiting(&self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Waiting)
    }

    pub fn mark_completed(&self, result: Option<String>) -> Result<(), TaskError> {
        let mut task = self.task.lock().expect("task mutex poisoned");
        task.transition_to(TaskStatus::Completed)?;
        task.result = result;
        task.progress = 100;
        Ok(())
    }

    pub fn mark_failed(&self, error: impl Into<String>) -> Result<(), TaskError> {
        let mut task = self.task.lock().expect("task mutex poisoned");
        task.transition_to(TaskStatus::Failed)?;
        task.error = Some(error.into());
        Ok(())
    }

    /// Cancel the task: raise the cancellation signal, unblock the pause
    /// gate, and force-resolve every outstanding wait with `None` so no
    /// waiter is leaked. Idempotent; a no-op on already-terminal tasks
    /// except for the waiter drain, which always runs.
    pub fn mark_cancelled(&self) {
        {
            let mut task = self.task.lock().expect("task mutex poisoned");
            if !task.status.is_terminal() {
                // Cancellation is valid from every non-terminal state.
                let _ = task.transition_to(TaskStatus::Cancelled);
            }
        }
        self.cancel.cancel();
        self.paused.store(false, Ordering::SeqCst);
        self.pause_notify.notify_waiters();

        let drained: Vec<Waiter> = {
            let mut waits = self.waits.lock().expect("waits mutex poisoned");
            let waits = &mut *waits;
            waits.human.drain(..).chain(waits.user_msg.drain(..)).collect()
        };
        for waiter in drained {
            let _ = waiter.tx.send(None);
        }
    }

    // ── Conversation ─────────────────────────────────────────────────────

    /// Append an entry, then evict from the oldest end while the aggregate
    /// size exceeds the budget, always retaining at least
    /// [`MIN_RETAINED_ENTRIES`]. Entries are never reordered.
    pub fn add_conversation(&self, role: ConversationRole, content: impl Into<String>) {
        let entry = ConversationEntry::new(role, content);
        let mut conv = self.conversation.lock().expect("conversation mutex poisoned");
        conv.total_bytes += entry.approx_bytes();
        conv.entries.push_back(entry);
        while conv.entries.len() > MIN_RETAINED_ENTRIES && conv.total_bytes > conv.budget {
            if let Some(evicted) = conv.entries.pop_front() {
                conv.total_bytes -= evicted.approx_bytes();
            }
        }
    }

    pub fn conversation(&self) -> Vec<ConversationEntry> {
        self.conversation
            .lock()
            .expect("conversation mutex poisoned")
            .entries
            .iter()
            .cloned()
            .collect()
    }

    pub fn conversation_bytes(&self) -> usize {
        self.conversation
            .lock()
            .expect("conversation mutex poisoned")
            .total_bytes
    }

    // ── Telemetry ────────────────────────────────────────────────────────

    pub fn record_tool_call(&self, name: impl Into<String>, args: serde_json::Value) {
        let mut task = self.task.lock().expect("task mutex poisoned");
        task.tool_calls.push(ToolCallRecord {
            name: name.into(),
            args,
            timestamp: chrono::Utc::now(),
        });
        if task.tool_calls.len() > MAX_TOOL_CALLS {
            let excess = task.tool_calls.len() - MAX_TOOL_CALLS;
            task.tool_calls.drain(..excess);
        }
    }

    pub fn set_progress(&self, percent: u8) {
        let mut task = self.task.lock().expect("task mutex poisoned");
        task.progress = percent.min(100);
        task.updated_at = chrono::Utc::now();
    }

    pub fn increment_loop_iteration(&self) {
        self.task.lock().expect("task mutex poisoned").loop_iteration += 1;
    }

    // ── Human-response waits ─────────────────────────────────────────────

    /// Suspend until a matching [`provide_human_response`] arrives or the
    /// timeout elapses. Returns `None` on timeout or cancellation.
    /// Concurrent waiters are served FIFO relative to responses.
    ///
    /// [`provide_human_response`]: TaskState::provide_human_response
    pub async fn wait_for_human_response(&self, timeout: Duration) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let id = self.next_wait_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut waits = self.waits.lock().expect("waits mutex poisoned");
            waits.human.push_back(Waiter { id, tx });
        }
        self.await_waiter(WaitKind::HumanResponse, id, rx, timeout)
            .await
    }

    /// Resolve the oldest outstanding human-response wait; a no-op when
    /// none is pending.
    pub fn provide_human_response(&self, value: impl Into<String>) {
        let value = value.into();
        let mut waits = self.waits.lock().expect("waits mutex poisoned");
        while let Some(waiter) = waits.human.pop_front() {
            // A send failure means the waiter timed out concurrently and
            // dropped its receiver; fall through to the next oldest.
            if waiter.tx.send(Some(value.clone())).is_ok() {
                return;
            }
        }
    }

    // ── User-message mailbox ─────────────────────────────────────────────

    /// Deliver a message: immediately to an existing waiter, bypassing the
    /// buffer, otherwise buffered for the next `get_user_message`.
    pub fn put_user_message(&self, message: impl Into<String>) {
        let message = message.into();
        let mut waits = self.waits.lock().expect("waits mutex poisoned");
        while let Some(waiter) = waits.user_msg.pop_front() {
            if waiter.tx.send(Some(message.clone())).is_ok() {
                return;
            }
        }
        waits.buffered.push_back(message);
    }

    /// Drain the buffer, or suspend until a message arrives or the timeout
    /// elapses. Returns `None` on timeout or cancellation.
    pub async fn get_user_message(&self, timeout: Duration) -> Option<String> {
        let (id, rx) = {
            let mut waits = self.waits.lock().expect("waits mutex poisoned");
            if let Some(message) = waits.buffered.pop_front() {
                return Some(message);
            }
            if self.cancel.is_cancelled() {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            let id = self.next_wait_id.fetch_add(1, Ordering::SeqCst);
            waits.user_msg.push_back(Waiter { id, tx });
            (id, rx)
        };
        self.await_waiter(WaitKind::UserMessage, id, rx, timeout).await
    }

    /// Resolve and remove the most recently registered, not-yet-satisfied
    /// `get_user_message` wait. Used when the race between "new message"
    /// and "next engine step" is lost, so an orphaned wait cannot silently
    /// consume a future message. Returns whether a wait was removed.
    pub fn cancel_last_get_user_message(&self) -> bool {
        let waiter = self
            .waits
            .lock()
            .expect("waits mutex poisoned")
            .user_msg
            .pop_back();
        match waiter {
            Some(waiter) => {
                let _ = waiter.tx.send(None);
                true
            }
            None => false,
        }
    }

    /// Count of registered, unresolved waits (both kinds).
    pub fn outstanding_waits(&self) -> usize {
        let waits = self.waits.lock().expect("waits mutex poisoned");
        waits.human.len() + waits.user_msg.len()
    }

    fn remove_waiter(&self, kind: WaitKind, id: u64) -> bool {
        let mut waits = self.waits.lock().expect("waits mutex poisoned");
        let queue = match kind {
            WaitKind::HumanResponse => &mut waits.human,
            WaitKind::UserMessage => &mut waits.user_msg,
        };
        match queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    async fn await_waiter(
        &self,
        kind: WaitKind,
        id: u64,
        rx: oneshot::Receiver<Option<String>>,
        timeout: Duration,
    ) -> Option<String> {
        let mut rx = rx;
        tokio::select! {
            result = &mut rx => result.ok().flatten(),
            _ = tokio::time::sleep(timeout) => {
                if self.remove_waiter(kind, id) {
                    None
                } else {
                    // The waiter was taken between the deadline firing and
                    // removal — the response is already in flight.
                    rx.await.ok().flatten()
                }
            }
            _ = self.cancel.cancelled() => {
                if self.remove_waiter(kind, id) {
                    None
                } else {
                    rx.await.ok().flatten()
                }
            }
        }
    }

    // ── Pause gate ───────────────────────────────────────────────────────

    /// Cooperatively suspend scheduling: sets status to waiting and closes
    /// the pause gate. In-flight work continues; the engine suspends at
    /// [`wait_while_paused`] until [`resume`] or cancellation.
    ///
    /// [`wait_while_paused`]: TaskState::wait_while_paused
    /// [`resume`]: TaskState::resume
    pub fn pause(&self) {
        let mut task = self.task.lock().expect("task mutex poisoned");
        if task.status.is_terminal() {
            return;
        }
        self.paused.store(true, Ordering::SeqCst);
        if task.status == TaskStatus::Running {
            let _ = task.transition_to(TaskStatus::Waiting);
        }
    }

    /// Reopen the pause gate. A no-op on tasks already in a terminal state.
    pub fn resume(&self) {
        let mut task = self.task.lock().expect("task mutex poisoned");
        if task.status.is_terminal() {
            return;
        }
        self.paused.store(false, Ordering::SeqCst);
        if task.status == TaskStatus::Waiting {
            let _ = task.transition_to(TaskStatus::Running);
        }
        drop(task);
        self.pause_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Suspend while the pause gate is closed. Returns immediately when not
    /// paused; cancellation force-resolves the suspension.
    pub async fn wait_while_paused(&self) {
        loop {
            if !self.paused.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                return;
            }
            let notified = self.pause_notify.notified();
            // Re-check after arming the notification to close the gap
            // between the load and notified().
            if !self.paused.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }
}
