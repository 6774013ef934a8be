//! Configuration for the orchestrator.
//!
//! Configuration can be set via environment variables:
//! - `TASKWEAVE_WORKSPACE_ROOT` - Optional. Root for per-task workspaces. Defaults to `./workspaces`.
//! - `TASKWEAVE_SNAPSHOT_ROOT` - Optional. Root for persisted task snapshots. Defaults to `./snapshots`.
//! - `TASKWEAVE_BROWSER_POOL` - Optional. Concurrent browser workers. Defaults to `2`.
//! - `TASKWEAVE_DOCUMENT_POOL` - Optional. Concurrent document workers. Defaults to `4`.
//! - `TASKWEAVE_CODE_POOL` - Optional. Concurrent code workers. Defaults to `4`.
//! - `TASKWEAVE_MULTI_MODAL_POOL` - Optional. Concurrent multi-modal workers. Defaults to `2`.
//! - `TASKWEAVE_MAX_SUBTASK_RETRIES` - Optional. Retries after a subtask's first failure. Defaults to `2`.
//! - `TASKWEAVE_CONVERSATION_BUDGET_BYTES` - Optional. Per-task conversation budget. Defaults to `102400`.
//! - `TASKWEAVE_SESSION_IDLE_SECS` - Optional. Session inactivity window. Defaults to `1800`.
//! - `TASKWEAVE_HUMAN_RESPONSE_TIMEOUT_SECS` - Optional. Human-in-the-loop wait bound. Defaults to `3600`.
//! - `TASKWEAVE_RECOVER_ON_START` - Optional. Resume incomplete tasks at startup. Defaults to `true`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::graph::CapabilityType;
use crate::task::state::DEFAULT_CONVERSATION_BUDGET_BYTES;
use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for per-task working directories
    pub workspace_root: PathBuf,

    /// Root directory for persisted task snapshots
    pub snapshot_root: PathBuf,

    /// Concurrent browser workers across all tasks
    pub browser_pool_size: usize,

    /// Concurrent document workers across all tasks
    pub document_pool_size: usize,

    /// Concurrent code workers across all tasks
    pub code_pool_size: usize,

    /// Concurrent multi-modal workers across all tasks
    pub multi_modal_pool_size: usize,

    /// Retries granted to a subtask after its first failure
    pub max_subtask_retries: u32,

    /// Aggregate byte budget for a task's conversation buffer
    pub conversation_budget_bytes: usize,

    /// Inactivity window after which a new session is chained
    pub session_idle: Duration,

    /// Messages carried forward into a chained session
    pub session_carry_forward: usize,

    /// Upper bound on a human-in-the-loop wait
    pub human_response_timeout: Duration,

    /// Whether to resume incomplete tasks at startup
    pub recover_on_start: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_root = std::env::var("TASKWEAVE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./workspaces"));

        let snapshot_root = std::env::var("TASKWEAVE_SNAPSHOT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./snapshots"));

        let browser_pool_size = env_usize("TASKWEAVE_BROWSER_POOL", 2)?;
        let document_pool_size = env_usize("TASKWEAVE_DOCUMENT_POOL", 4)?;
        let code_pool_size = env_usize("TASKWEAVE_CODE_POOL", 4)?;
        let multi_modal_pool_size = env_usize("TASKWEAVE_MULTI_MODAL_POOL", 2)?;

        let max_subtask_retries = env_usize("TASKWEAVE_MAX_SUBTASK_RETRIES", 2)? as u32;
        let conversation_budget_bytes = env_usize(
            "TASKWEAVE_CONVERSATION_BUDGET_BYTES",
            DEFAULT_CONVERSATION_BUDGET_BYTES,
        )?;

        let session_idle =
            Duration::from_secs(env_usize("TASKWEAVE_SESSION_IDLE_SECS", 1800)? as u64);
        let human_response_timeout = Duration::from_secs(env_usize(
            "TASKWEAVE_HUMAN_RESPONSE_TIMEOUT_SECS",
            3600,
        )? as u64);

        let recover_on_start = env_var_bool("TASKWEAVE_RECOVER_ON_START", true);

        Ok(Self {
            workspace_root,
            snapshot_root,
            browser_pool_size,
            document_pool_size,
            code_pool_size,
            multi_modal_pool_size,
            max_subtask_retries,
            conversation_budget_bytes,
            session_idle,
            session_carry_forward: 5,
            human_response_timeout,
            recover_on_start,
        })
    }

    /// Concurrency cap for one capability's pool.
    pub fn pool_size(&self, capability: CapabilityType) -> usize {
        match capability {
            CapabilityType::Browser => self.browser_pool_size,
            CapabilityType::Document => self.document_pool_size,
            CapabilityType::Code => self.code_pool_size,
            CapabilityType::MultiModal => self.multi_modal_pool_size,
        }
    }

    /// Config with small, fast values (useful for testing).
    pub fn for_tests() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("taskweave-test-workspaces"),
            snapshot_root: std::env::temp_dir().join("taskweave-test-snapshots"),
            browser_pool_size: 2,
            document_pool_size: 2,
            code_pool_size: 2,
            multi_modal_pool_size: 2,
            max_subtask_retries: 1,
            conversation_budget_bytes: DEFAULT_CONVERSATION_BUDGET_BYTES,
            session_idle: Duration::from_secs(1800),
            session_carry_forward: 5,
            human_response_timeout: Duration::from_millis(200),
            recover_on_start: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_maps_every_capability() {
        let mut config = Config::for_tests();
        config.browser_pool_size = 1;
        config.document_pool_size = 3;
        config.code_pool_size = 5;
        config.multi_modal_pool_size = 7;
        assert_eq!(config.pool_size(CapabilityType::Browser), 1);
        assert_eq!(config.pool_size(CapabilityType::Document), 3);
        assert_eq!(config.pool_size(CapabilityType::Code), 5);
        assert_eq!(config.pool_size(CapabilityType::MultiModal), 7);
    }
}
