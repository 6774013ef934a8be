//! Lifecycle events pushed to the UI layer.
//!
//! The [`EventSink`] is the only channel between the execution core and
//! whatever renders it; the core is transport-agnostic, so any SSE/WS/bus
//! binding can wrap a sink. The sink must receive an end-of-task event even
//! on abnormal termination, and exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::graph::{SubtaskId, SubtaskState};
use crate::task::{ConversationRole, TaskId, TaskStatus};

/// A structured event emitted during task execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task_id: TaskId,
        description: String,
    },
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
    Progress {
        task_id: TaskId,
        total_subtasks: usize,
        completed_subtasks: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_subtask: Option<String>,
    },
    SubtaskUpdate {
        task_id: TaskId,
        subtask_id: SubtaskId,
        state: SubtaskState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Conversation {
        task_id: TaskId,
        role: ConversationRole,
        content: String,
    },
    ToolCall {
        task_id: TaskId,
        name: String,
        args: serde_json::Value,
    },
    HumanInputRequested {
        task_id: TaskId,
        prompt: String,
    },
    Error {
        task_id: TaskId,
        message: String,
    },
    End {
        task_id: TaskId,
        status: TaskStatus,
        message: String,
    },
}

impl TaskEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            TaskEvent::Started { .. } => "started",
            TaskEvent::StatusChanged { .. } => "status_changed",
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::SubtaskUpdate { .. } => "subtask_update",
            TaskEvent::Conversation { .. } => "conversation",
            TaskEvent::ToolCall { .. } => "tool_call",
            TaskEvent::HumanInputRequested { .. } => "human_input_requested",
            TaskEvent::Error { .. } => "error",
            TaskEvent::End { .. } => "end",
        }
    }
}

/// Sink for one task's lifecycle events.
///
/// `emit_end` is effective once: later calls are logged and dropped so
/// partial failures (explicit cancel plus the pipeline's terminal handler)
/// cannot produce a second end-of-task event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TaskEvent);

    async fn emit_end(&self, task_id: TaskId, status: TaskStatus, message: String);

    /// Release the transport. Safe to call after `emit_end`.
    async fn close(&self);
}

/// Broadcast-backed sink: fans events out to any number of subscribers.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<TaskEvent>,
    ended: AtomicBool,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            ended: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: TaskEvent) {
        // No subscribers is fine; the send result only reports that.
        let _ = self.tx.send(event);
    }

    async fn emit_end(&self, task_id: TaskId, status: TaskStatus, message: String) {
        if self.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!(task_id = %task_id, "duplicate end event suppressed");
            return;
        }
        let _ = self.tx.send(TaskEvent::End {
            task_id,
            status,
            message,
        });
    }

    async fn close(&self) {}
}

/// Sink that logs events through `tracing` (headless runs, debugging).
#[derive(Default)]
pub struct TracingEventSink {
    ended: AtomicBool,
}

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: TaskEvent) {
        tracing::info!(event = event.event_name(), payload = ?event, "task event");
    }

    async fn emit_end(&self, task_id: TaskId, status: TaskStatus, message: String) {
        if self.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!(task_id = %task_id, "duplicate end event suppressed");
            return;
        }
        tracing::info!(task_id = %task_id, status = %status, message = %message, "task ended");
    }

    async fn close(&self) {}
}

/// Sink that records events in memory. Non-persistent, for testing.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<TaskEvent>>,
    ended: AtomicBool,
    closed: AtomicBool,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().expect("event sink mutex poisoned").clone()
    }

    pub fn end_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TaskEvent::End { .. }))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: TaskEvent) {
        self.events
            .lock()
            .expect("event sink mutex poisoned")
            .push(event);
    }

    async fn emit_end(&self, task_id: TaskId, status: TaskStatus, message: String) {
        if self.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!(task_id = %task_id, "duplicate end event suppressed");
            return;
        }
        self.emit(TaskEvent::End {
            task_id,
            status,
            message,
        })
        .await;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn end_event_is_emitted_exactly_once() {
        let sink = MemoryEventSink::new();
        let id = TaskId::new();
        sink.emit_end(id, TaskStatus::Cancelled, "cancelled by user".into())
            .await;
        sink.emit_end(id, TaskStatus::Failed, "terminal handler".into())
            .await;
        assert_eq!(sink.end_count(), 1);
        match &sink.events()[0] {
            TaskEvent::End { status, .. } => assert_eq!(*status, TaskStatus::Cancelled),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();
        let id = TaskId::new();
        sink.emit(TaskEvent::Started {
            task_id: id,
            description: "demo".into(),
        })
        .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_name(), "started");
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = TaskEvent::SubtaskUpdate {
            task_id: TaskId::new(),
            subtask_id: crate::graph::SubtaskId::new(),
            state: SubtaskState::Running,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "subtask_update");
        assert_eq!(json["state"], "running");
    }
}
