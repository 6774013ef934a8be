//! Task decomposition seam.
//!
//! The engine treats planning as a black box: a [`Planner`] turns a task
//! description (optionally seeded by a previously learned plan) into
//! self-contained subtasks with declared dependencies. The language-model
//! call, when there is one, lives behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::CapabilityType;

/// A planned subtask before stable ids exist. Dependencies are indices into
/// the same plan batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedSubtask {
    /// Self-contained description of what to do — no implicit reference to
    /// a previous subtask's output.
    pub content: String,
    pub capability: CapabilityType,
    /// Indices of subtasks in this batch that must complete first. Declared
    /// only for genuine data dependencies so independent subtasks can run
    /// in parallel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<usize>,
}

impl PlannedSubtask {
    pub fn new(content: impl Into<String>, capability: CapabilityType) -> Self {
        Self {
            content: content.into(),
            capability,
            depends_on: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<usize>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// A previously learned plan used to seed decomposition of a similar task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPlan {
    /// Short description of the task shape this plan solves.
    pub summary: String,
    pub subtasks: Vec<PlannedSubtask>,
}

/// Output of decomposition.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Optional human-readable plan summary, persisted with the snapshot.
    pub plan_summary: Option<String>,
    pub subtasks: Vec<PlannedSubtask>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlannerError {
    #[error("planning failed: {0}")]
    Failed(String),
}

/// Converts a task description into a subtask plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        description: &str,
        seed: Option<&LearnedPlan>,
    ) -> Result<PlanOutcome, PlannerError>;
}

/// Fallback planner: the whole task becomes one subtask with an inferred
/// capability. Used when no richer planner is wired in, and as the degraded
/// path when a planner fails.
#[derive(Debug, Default)]
pub struct SingleStepPlanner;

#[async_trait]
impl Planner for SingleStepPlanner {
    async fn plan(
        &self,
        description: &str,
        seed: Option<&LearnedPlan>,
    ) -> Result<PlanOutcome, PlannerError> {
        if let Some(seed) = seed {
            if !seed.subtasks.is_empty() {
                return Ok(PlanOutcome {
                    plan_summary: Some(seed.summary.clone()),
                    subtasks: seed.subtasks.clone(),
                });
            }
        }
        Ok(PlanOutcome {
            plan_summary: None,
            subtasks: vec![PlannedSubtask::new(
                description,
                CapabilityType::infer(description),
            )],
        })
    }
}
