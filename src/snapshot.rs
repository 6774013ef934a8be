//! Durable task snapshots and restart recovery.
//!
//! The snapshot is the unit of persistence: the full task record plus its
//! subtask graph, written after every meaningful state change. Stores keep
//! an in-memory map as the source of truth and persist through a tmp-file
//! plus rename so a crash never leaves a torn snapshot on disk.
//!
//! Incremental updates (`update_subtask_state`, `update_status`) are
//! deliberately infallible: a persistence hiccup mid-task is logged and the
//! task keeps running on the in-memory state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::graph::{Subtask, SubtaskId, SubtaskState};
use crate::task::{TaskId, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistent record of one task: enough to resume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub user_request: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<String>,
    pub subtasks: Vec<Subtask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn new(task_id: TaskId, user_request: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            user_request: user_request.into(),
            status: TaskStatus::Pending,
            plan_summary: None,
            subtasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`, keeping it strictly monotonic even when the
    /// clock has not advanced between writes.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::milliseconds(1)
        };
    }
}

/// Persistence seam for task snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn is_persistent(&self) -> bool;

    /// Write or replace the full snapshot for a task.
    async fn save(&self, snapshot: &TaskSnapshot) -> Result<(), SnapshotError>;

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskSnapshot>, SnapshotError>;

    /// Record one subtask's new state. Unknown task or subtask ids are
    /// logged and dropped; persistence failures never surface.
    async fn update_subtask_state(
        &self,
        task_id: TaskId,
        subtask_id: SubtaskId,
        state: SubtaskState,
        result: Option<String>,
        error: Option<String>,
    );

    /// Record the task's status. Same failure contract as
    /// `update_subtask_state`.
    async fn update_status(&self, task_id: TaskId, status: TaskStatus);

    /// All snapshots whose status is non-terminal, most recently updated
    /// first. Used at startup to find work interrupted by a shutdown.
    async fn recover_incomplete(&self) -> Result<Vec<TaskSnapshot>, SnapshotError>;

    /// Remove a task's snapshot. Returns whether one existed.
    async fn delete(&self, task_id: TaskId) -> Result<bool, SnapshotError>;
}

/// JSON file-backed store: one `snapshot.json` per task directory.
#[derive(Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
    snapshots: Arc<RwLock<HashMap<TaskId, TaskSnapshot>>>,
    persist_lock: Arc<Mutex<()>>,
}

impl FileSnapshotStore {
    /// Open the store rooted at `root`, loading every parseable snapshot
    /// already on disk. Unparseable files are logged and skipped so one
    /// corrupt snapshot cannot block startup.
    pub async fn new(root: PathBuf) -> Result<Self, SnapshotError> {
        fs::create_dir_all(&root).await?;
        let mut snapshots = HashMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join("snapshot.json");
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::warn!("failed to read snapshot {}: {}", path.display(), err);
                    continue;
                }
            };
            match serde_json::from_slice::<TaskSnapshot>(&bytes) {
                Ok(snapshot) => {
                    snapshots.insert(snapshot.task_id, snapshot);
                }
                Err(err) => {
                    tracing::warn!("failed to parse snapshot {}: {}", path.display(), err);
                }
            }
        }
        Ok(Self {
            root,
            snapshots: Arc::new(RwLock::new(snapshots)),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    async fn persist(&self, task_id: TaskId) -> Result<(), SnapshotError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = match self.snapshots.read().await.get(&task_id).cloned() {
            Some(snapshot) => snapshot,
            None => return Ok(()),
        };
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await?;
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let path = dir.join("snapshot.json");
        let tmp_path = dir.join("snapshot.json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn persist_best_effort(&self, task_id: TaskId) {
        if let Err(err) = self.persist(task_id).await {
            tracing::warn!(task_id = %task_id, "snapshot persist failed: {}", err);
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn save(&self, snapshot: &TaskSnapshot) -> Result<(), SnapshotError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.task_id, snapshot.clone());
        self.persist(snapshot.task_id).await
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskSnapshot>, SnapshotError> {
        Ok(self.snapshots.read().await.get(&task_id).cloned())
    }

    async fn update_subtask_state(
        &self,
        task_id: TaskId,
        subtask_id: SubtaskId,
        state: SubtaskState,
        result: Option<String>,
        error: Option<String>,
    ) {
        {
            let mut snapshots = self.snapshots.write().await;
            let Some(snapshot) = snapshots.get_mut(&task_id) else {
                tracing::warn!(task_id = %task_id, "subtask update for unknown task");
                return;
            };
            let Some(subtask) = snapshot.subtasks.iter_mut().find(|s| s.id == subtask_id) else {
                tracing::warn!(task_id = %task_id, subtask_id = %subtask_id, "update for unknown subtask");
                return;
            };
            subtask.state = state;
            if result.is_some() {
                subtask.result = result;
            }
            if error.is_some() {
                subtask.error = error;
            }
            snapshot.touch();
        }
        self.persist_best_effort(task_id).await;
    }

    async fn update_status(&self, task_id: TaskId, status: TaskStatus) {
        {
            let mut snapshots = self.snapshots.write().await;
            let Some(snapshot) = snapshots.get_mut(&task_id) else {
                tracing::warn!(task_id = %task_id, "status update for unknown task");
                return;
            };
            snapshot.status = status;
            snapshot.touch();
        }
        self.persist_best_effort(task_id).await;
    }

    async fn recover_incomplete(&self) -> Result<Vec<TaskSnapshot>, SnapshotError> {
        let mut incomplete: Vec<TaskSnapshot> = self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect();
        incomplete.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(incomplete)
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool, SnapshotError> {
        let removed = self.snapshots.write().await.remove(&task_id).is_some();
        let dir = self.task_dir(task_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(removed)
    }
}

/// In-memory store. Non-persistent, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<TaskId, TaskSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn save(&self, snapshot: &TaskSnapshot) -> Result<(), SnapshotError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.task_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskSnapshot>, SnapshotError> {
        Ok(self.snapshots.read().await.get(&task_id).cloned())
    }

    async fn update_subtask_state(
        &self,
        task_id: TaskId,
        subtask_id: SubtaskId,
        state: SubtaskState,
        result: Option<String>,
        error: Option<String>,
    ) {
        let mut snapshots = self.snapshots.write().await;
        let Some(snapshot) = snapshots.get_mut(&task_id) else {
            tracing::warn!(task_id = %task_id, "subtask update for unknown task");
            return;
        };
        let Some(subtask) = snapshot.subtasks.iter_mut().find(|s| s.id == subtask_id) else {
            tracing::warn!(task_id = %task_id, subtask_id = %subtask_id, "update for unknown subtask");
            return;
        };
        subtask.state = state;
        if result.is_some() {
            subtask.result = result;
        }
        if error.is_some() {
            subtask.error = error;
        }
        snapshot.touch();
    }

    async fn update_status(&self, task_id: TaskId, status: TaskStatus) {
        let mut snapshots = self.snapshots.write().await;
        if let Some(snapshot) = snapshots.get_mut(&task_id) {
            snapshot.status = status;
            snapshot.touch();
        }
    }

    async fn recover_incomplete(&self) -> Result<Vec<TaskSnapshot>, SnapshotError> {
        let mut incomplete: Vec<TaskSnapshot> = self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect();
        incomplete.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(incomplete)
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool, SnapshotError> {
        Ok(self.snapshots.write().await.remove(&task_id).is_some())
    }
}
