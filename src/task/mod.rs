//! Task records and per-task runtime state.
//!
//! A [`Task`] is the durable record of one user-issued request. Its mutable
//! runtime counterpart ([`state::TaskState`]) owns the concurrency
//! primitives: conversation buffer, blocking waits, pause gate and
//! cancellation signal.

pub mod registry;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use registry::TaskRegistry;
pub use state::TaskState;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Running <-> Waiting
///                   \-> Completed
///                   \-> Failed
///        \-> Cancelled (from any non-terminal state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task has been submitted but not started.
    Pending,
    /// Task is executing subtasks.
    Running,
    /// Task is suspended (paused or waiting for human input).
    Waiting,
    /// Task completed (possibly with partial subtask failures).
    Completed,
    /// Task failed overall.
    Failed,
    /// Task was cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is still active (can make progress).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check whether a transition to `target` is allowed.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        if *self == target {
            return false;
        }
        match (self, target) {
            // Cancellation is allowed from any non-terminal state.
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Waiting) | (Running, Completed) | (Running, Failed) => true,
            (Waiting, Running) | (Waiting, Completed) | (Waiting, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Role of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
    TaskResult,
    ToolCall,
}

impl ConversationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::TaskResult => "task_result",
            Self::ToolCall => "tool_call",
        }
    }
}

/// One entry in a task's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(role: ConversationRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Approximate in-memory size used for eviction accounting.
    pub fn approx_bytes(&self) -> usize {
        // Role tag, timestamp and struct overhead.
        self.content.len() + 32
    }
}

/// A recorded tool invocation (telemetry, surfaced to the UI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Durable record of one user-issued task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    /// Completion percentage in [0, 100].
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of engine scheduling iterations performed.
    pub loop_iteration: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            description: description.into(),
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            loop_iteration: 0,
            tool_calls: Vec::new(),
        }
    }

    /// Apply a validated status transition, updating `updated_at`.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}
