//! Per-task working directories.
//!
//! Every task gets its own directory under the configured root; workers
//! write artifacts there. Provisioning failure degrades to a shared temp
//! directory rather than failing the task.

use std::path::{Path, PathBuf};

use crate::task::TaskId;
use crate::worker::degraded_working_dir;

pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_path(&self, task_id: TaskId) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    /// Create the task's working directory, falling back to the degraded
    /// shared directory when creation fails.
    pub async fn create_workspace(&self, task_id: TaskId) -> PathBuf {
        let path = self.workspace_path(task_id);
        match tokio::fs::create_dir_all(&path).await {
            Ok(()) => path,
            Err(err) => {
                tracing::warn!(task_id = %task_id, "workspace creation failed, using degraded dir: {}", err);
                let fallback = degraded_working_dir();
                if let Err(err) = tokio::fs::create_dir_all(&fallback).await {
                    tracing::warn!("degraded workspace creation failed: {}", err);
                }
                fallback
            }
        }
    }

    /// Best-effort removal of a task's working directory.
    pub async fn remove_workspace(&self, task_id: TaskId) {
        let path = self.workspace_path(task_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(task_id = %task_id, "workspace removal failed: {}", err);
            }
        }
    }
}
