//! # taskweave
//!
//! Orchestration core for capability-typed worker agents.
//!
//! A submitted request is decomposed into a dependency graph of subtasks,
//! each tagged with the worker capability it needs (browser, document,
//! code, multi-modal). The engine runs independent subtasks in parallel
//! under bounded per-capability pools, cascades failures as skips, grafts
//! worker-requested splits into the live graph, and survives restarts by
//! replaying file snapshots.
//!
//! ## Task Flow
//! 1. Submit a request through the [`pipeline::TaskPipeline`]
//! 2. The [`graph::Planner`] decomposes it into subtasks
//! 3. The [`engine::Orchestrator`] schedules and executes the graph
//! 4. Lifecycle events stream through an [`events::EventSink`]
//! 5. The snapshot store persists every state change for recovery
//!
//! ## Modules
//! - `task`: task records, runtime state, blocking primitives
//! - `graph`: subtask graph, validation, re-planning
//! - `engine`: the scheduling and execution loop
//! - `worker`: capability seams and bounded execution pools
//! - `snapshot`: durable snapshots and restart recovery
//! - `session`: chained conversation sessions
//! - `pipeline`: the submit/control surface tying it together

pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod graph;
pub mod pipeline;
pub mod session;
pub mod snapshot;
pub mod task;
pub mod util;
pub mod worker;
pub mod workspace;

pub use config::Config;
pub use events::{EventSink, TaskEvent};
pub use pipeline::{PipelineError, TaskPipeline};
pub use task::{TaskId, TaskStatus};
