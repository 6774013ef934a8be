//! Subtask graph: a mutable arena of dependency-linked subtasks.
//!
//! Subtask ids are stable — re-planning appends new nodes and never
//! renumbers existing ones, so in-flight references stay valid.

pub mod planner;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use planner::{LearnedPlan, PlanOutcome, PlannedSubtask, Planner, PlannerError};

/// Unique identifier for a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskId(Uuid);

impl SubtaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubtaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker capability required by a subtask.
///
/// This is a closed set: scheduling, pooling and dispatch all match on it
/// exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    /// Web browsing / page automation.
    Browser,
    /// Document reading and authoring.
    Document,
    /// Code authoring and shell execution.
    Code,
    /// Image/audio/video understanding.
    MultiModal,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 4] = [
        Self::Browser,
        Self::Document,
        Self::Code,
        Self::MultiModal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Document => "document",
            Self::Code => "code",
            Self::MultiModal => "multi_modal",
        }
    }

    /// Heuristic capability match for planner fallbacks: compares the
    /// operations a description implies against capability descriptions.
    pub fn infer(content: &str) -> Self {
        let lower = content.to_lowercase();
        if ["http", "www.", "browse", "website", "web page", "search the web"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::Browser
        } else if ["image", "screenshot", "photo", "audio", "video", "diagram"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::MultiModal
        } else if ["report", "document", "write up", "summarize", "article", "pdf"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::Document
        } else {
            Self::Code
        }
    }
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution state of a subtask.
///
/// Open -> Assigned -> Running -> {Done | Failed}; Skipped is applied to
/// subtasks that can never run (cancellation, failed dependencies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Open,
    Assigned,
    Running,
    Done,
    Failed,
    Skipped,
}

impl SubtaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// An atomic unit of work assigned to exactly one worker capability.
///
/// Subtasks are self-contained: `content` must carry everything the worker
/// needs, with no implicit reference to a previous subtask's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub content: String,
    pub capability: CapabilityType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<SubtaskId>,
    pub state: SubtaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution attempts so far (for retry accounting).
    #[serde(default)]
    pub attempts: u32,
}

impl Subtask {
    pub fn new(content: impl Into<String>, capability: CapabilityType) -> Self {
        Self {
            id: SubtaskId::new(),
            content: content.into(),
            capability,
            depends_on: Vec::new(),
            state: SubtaskState::Open,
            result: None,
            error: None,
            attempts: 0,
        }
    }
}

/// Errors raised by graph construction and mutation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    #[error("subtask plan is empty")]
    Empty,

    #[error("subtask {subtask_index} has invalid dependency index {dependency_index}")]
    InvalidDependency {
        subtask_index: usize,
        dependency_index: usize,
    },

    #[error("subtask {subtask_index} depends on itself")]
    SelfDependency { subtask_index: usize },

    #[error("dependency cycle detected in subtask graph")]
    CircularDependency,

    #[error("unknown subtask {0}")]
    UnknownSubtask(SubtaskId),
}

/// Counts of subtasks per terminal bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

/// Append-only arena of subtasks addressed by stable ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskGraph {
    subtasks: Vec<Subtask>,
}

impl SubtaskGraph {
    /// Build a graph from planner output, resolving index-based dependencies
    /// to stable ids. Rejects empty plans, bad indices and self-deps.
    pub fn from_planned(planned: Vec<PlannedSubtask>) -> Result<Self, GraphError> {
        if planned.is_empty() {
            return Err(GraphError::Empty);
        }
        let ids: Vec<SubtaskId> = planned.iter().map(|_| SubtaskId::new()).collect();
        let mut subtasks = Vec::with_capacity(planned.len());
        for (i, p) in planned.into_iter().enumerate() {
            let mut depends_on = Vec::with_capacity(p.depends_on.len());
            for &dep in &p.depends_on {
                if dep >= ids.len() {
                    return Err(GraphError::InvalidDependency {
                        subtask_index: i,
                        dependency_index: dep,
                    });
                }
                if dep == i {
                    return Err(GraphError::SelfDependency { subtask_index: i });
                }
                depends_on.push(ids[dep]);
            }
            subtasks.push(Subtask {
                id: ids[i],
                content: p.content,
                capability: p.capability,
                depends_on,
                state: SubtaskState::Open,
                result: None,
                error: None,
                attempts: 0,
            });
        }
        let graph = Self { subtasks };
        graph.validate()?;
        Ok(graph)
    }

    /// Reconstruct a graph from persisted subtasks (snapshot recovery).
    pub fn from_subtasks(subtasks: Vec<Subtask>) -> Self {
        Self { subtasks }
    }

    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn get(&self, id: SubtaskId) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SubtaskId) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    /// Validate the dependency structure: unknown ids and cycles are
    /// rejected before execution begins (Kahn's algorithm).
    pub fn validate(&self) -> Result<(), GraphError> {
        let index: HashMap<SubtaskId, usize> = self
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id, i))
            .collect();

        let n = self.subtasks.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, subtask) in self.subtasks.iter().enumerate() {
            for dep in &subtask.depends_on {
                let &j = index
                    .get(dep)
                    .ok_or(GraphError::UnknownSubtask(*dep))?;
                if j == i {
                    return Err(GraphError::SelfDependency { subtask_index: i });
                }
                adj[j].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited != n {
            Err(GraphError::CircularDependency)
        } else {
            Ok(())
        }
    }

    /// Open subtasks whose dependencies are all done. Independent subtasks
    /// appear together so they can run in parallel.
    pub fn ready_subtasks(&self) -> Vec<SubtaskId> {
        self.subtasks
            .iter()
            .filter(|s| s.state == SubtaskState::Open)
            .filter(|s| {
                s.depends_on.iter().all(|dep| {
                    self.get(*dep)
                        .map(|d| d.state == SubtaskState::Done)
                        .unwrap_or(false)
                })
            })
            .map(|s| s.id)
            .collect()
    }

    /// Apply a state transition to one subtask.
    pub fn mark(
        &mut self,
        id: SubtaskId,
        state: SubtaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), GraphError> {
        let subtask = self.get_mut(id).ok_or(GraphError::UnknownSubtask(id))?;
        subtask.state = state;
        if result.is_some() {
            subtask.result = result;
        }
        if error.is_some() {
            subtask.error = error;
        }
        Ok(())
    }

    /// Mark open subtasks that can never run — a dependency failed or was
    /// skipped — as skipped. Returns the ids that changed. Repeats until a
    /// fixpoint so chains of dependents collapse in one call.
    pub fn skip_unreachable(&mut self) -> Vec<SubtaskId> {
        let mut skipped = Vec::new();
        loop {
            let blocked: Vec<SubtaskId> = self
                .subtasks
                .iter()
                .filter(|s| s.state == SubtaskState::Open)
                .filter(|s| {
                    s.depends_on.iter().any(|dep| {
                        self.get(*dep)
                            .map(|d| {
                                matches!(d.state, SubtaskState::Failed | SubtaskState::Skipped)
                            })
                            .unwrap_or(true)
                    })
                })
                .map(|s| s.id)
                .collect();
            if blocked.is_empty() {
                break;
            }
            for id in blocked {
                if let Some(s) = self.get_mut(id) {
                    s.state = SubtaskState::Skipped;
                }
                skipped.push(id);
            }
        }
        skipped
    }

    /// Mark every non-terminal subtask as skipped (cancellation path).
    /// Returns the ids that changed.
    pub fn skip_remaining(&mut self) -> Vec<SubtaskId> {
        let mut skipped = Vec::new();
        for subtask in &mut self.subtasks {
            if !subtask.state.is_terminal() {
                subtask.state = SubtaskState::Skipped;
                skipped.push(subtask.id);
            }
        }
        skipped
    }

    /// Graft a mid-execution split: the in-flight subtask `origin` reports a
    /// progress summary plus self-contained follow-ups. The origin is marked
    /// done with the summary as its result; follow-ups are appended as its
    /// successors; subtasks that depended on the origin's output now also
    /// wait on every follow-up.
    ///
    /// Returns the ids of the grafted follow-ups.
    pub fn graft_split(
        &mut self,
        origin: SubtaskId,
        summary: String,
        followups: Vec<PlannedSubtask>,
    ) -> Result<Vec<SubtaskId>, GraphError> {
        if self.get(origin).is_none() {
            return Err(GraphError::UnknownSubtask(origin));
        }
        if followups.is_empty() {
            return Err(GraphError::Empty);
        }

        let new_ids: Vec<SubtaskId> = followups.iter().map(|_| SubtaskId::new()).collect();
        let mut grafted = Vec::with_capacity(followups.len());
        for (i, p) in followups.into_iter().enumerate() {
            // Index deps refer to the follow-up batch itself.
            let mut depends_on = vec![origin];
            for &dep in &p.depends_on {
                if dep >= new_ids.len() {
                    return Err(GraphError::InvalidDependency {
                        subtask_index: i,
                        dependency_index: dep,
                    });
                }
                if dep == i {
                    return Err(GraphError::SelfDependency { subtask_index: i });
                }
                depends_on.push(new_ids[dep]);
            }
            grafted.push(Subtask {
                id: new_ids[i],
                content: p.content,
                capability: p.capability,
                depends_on,
                state: SubtaskState::Open,
                result: None,
                error: None,
                attempts: 0,
            });
        }

        // Preserve edges that referenced the origin's output: anything that
        // depended on the origin must now also wait for its follow-ups.
        let dependent_ids: HashSet<SubtaskId> = self
            .subtasks
            .iter()
            .filter(|s| s.id != origin && s.depends_on.contains(&origin))
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.id)
            .collect();
        for subtask in &mut self.subtasks {
            if dependent_ids.contains(&subtask.id) {
                subtask.depends_on.extend(new_ids.iter().copied());
            }
        }

        self.subtasks.extend(grafted);
        self.mark(origin, SubtaskState::Done, Some(summary), None)?;
        self.validate()?;
        Ok(new_ids)
    }

    /// Whether every subtask has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.subtasks.iter().all(|s| s.state.is_terminal())
    }

    pub fn counts(&self) -> GraphCounts {
        let mut counts = GraphCounts {
            total: self.subtasks.len(),
            ..Default::default()
        };
        for s in &self.subtasks {
            match s.state {
                SubtaskState::Done => counts.done += 1,
                SubtaskState::Failed => counts.failed += 1,
                SubtaskState::Skipped => counts.skipped += 1,
                _ => {}
            }
        }
        counts
    }

    /// Result of the final deliverable subtask: a done sink node — one no
    /// other subtask depends on. Splits graft follow-ups after the plan's
    /// last subtask, so arena position does not identify the deliverable;
    /// the dependency structure does. Falls back to the last done result
    /// when every sink failed or was skipped.
    pub fn deliverable(&self) -> Option<&str> {
        let depended_on: HashSet<SubtaskId> = self
            .subtasks
            .iter()
            .flat_map(|s| s.depends_on.iter().copied())
            .collect();
        self.subtasks
            .iter()
            .rev()
            .filter(|s| s.state == SubtaskState::Done)
            .filter(|s| !depended_on.contains(&s.id))
            .find_map(|s| s.result.as_deref())
            .or_else(|| {
                self.subtasks
                    .iter()
                    .rev()
                    .filter(|s| s.state == SubtaskState::Done)
                    .find_map(|s| s.result.as_deref())
            })
    }
}
