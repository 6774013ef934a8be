//! taskweave - Headless Entry Point
//!
//! Starts the orchestrator, resumes any incomplete tasks from the snapshot
//! store and, when a request is given on the command line, submits it with
//! the built-in echo workers.

use std::sync::Arc;

use taskweave::config::Config;
use taskweave::events::{EventSink, TracingEventSink};
use taskweave::graph::planner::SingleStepPlanner;
use taskweave::pipeline::TaskPipeline;
use taskweave::snapshot::FileSnapshotStore;
use taskweave::worker::EchoWorkerFactory;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskweave=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: workspaces={}, snapshots={}",
        config.workspace_root.display(),
        config.snapshot_root.display()
    );

    let store = Arc::new(FileSnapshotStore::new(config.snapshot_root.clone()).await?);
    let recover = config.recover_on_start;
    let pipeline = Arc::new(TaskPipeline::new(
        config,
        store,
        Arc::new(EchoWorkerFactory),
        Arc::new(SingleStepPlanner),
    ));

    if recover {
        let resumed = pipeline
            .resume_incomplete(|_| Arc::new(TracingEventSink::default()) as Arc<dyn EventSink>)
            .await?;
        if !resumed.is_empty() {
            info!("Resumed {} incomplete task(s)", resumed.len());
        }
    }

    if let Some(request) = std::env::args().nth(1) {
        let sink = Arc::new(TracingEventSink::default());
        let task_id = pipeline.submit(request, sink).await?;
        info!("Submitted task {}", task_id);
    }

    info!("Orchestrator running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for id in pipeline.registry().ids() {
        let _ = pipeline.cancel(id);
    }
    Ok(())
}
