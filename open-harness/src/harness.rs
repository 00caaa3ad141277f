//! Top-level assembly: configuration in, running harness out.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{GoalOutcome, Orchestrator};
use crate::config::{HarnessConfig, tasks_db_path};
use crate::error::HarnessError;
use crate::events::{EventBus, EventStream};
use crate::llm::LmClient;
use crate::tasks::{Task, TaskQueue, TaskStore, WorkerContext};
use crate::tools::ToolRegistry;

/// A fully wired harness: one workspace, one LM endpoint, one background
/// task worker.
#[derive(Debug)]
pub struct Harness {
    config: Arc<HarnessConfig>,
    bus: EventBus,
    orchestrator: Orchestrator,
    queue: TaskQueue,
}

impl Harness {
    /// Wire up the harness for the workspace at `root`.
    ///
    /// Initialization failures here are the only fatal errors; everything
    /// after this point is goal-scoped.
    pub fn init(config: HarnessConfig, root: PathBuf) -> Result<Self, HarnessError> {
        config.endpoint.parsed_base_url()?;
        let config = Arc::new(config);
        let bus = EventBus::new();

        let client = LmClient::new(
            config.endpoint.clone(),
            config.model_tiers.clone(),
            bus.clone(),
        )?;
        let backend: Arc<dyn crate::llm::ChatBackend> = Arc::new(client);

        let registry = Arc::new(ToolRegistry::builtin(&config));
        info!(tools = registry.names().len(), "harness initialized");

        let workspace_lock = Arc::new(tokio::sync::Mutex::new(()));
        let orchestrator = Orchestrator::new(
            Arc::clone(&config),
            Arc::clone(&backend),
            Arc::clone(&registry),
            bus.clone(),
            root.clone(),
            Arc::clone(&workspace_lock),
        );

        let store = TaskStore::open(tasks_db_path()?)?;
        let queue = TaskQueue::start(
            store,
            WorkerContext {
                config: Arc::clone(&config),
                backend,
                registry,
                bus: bus.clone(),
                root,
                workspace_lock,
            },
        )?;

        Ok(Self {
            config,
            bus,
            orchestrator,
            queue,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Run one interactive goal to completion.
    pub async fn run_goal(&self, goal: &str, cancel: CancellationToken) -> GoalOutcome {
        self.orchestrator.run_goal(goal, cancel).await
    }

    /// Enqueue a background goal; returns its task synchronously.
    pub fn submit_task(&self, goal: &str) -> Result<Task, HarnessError> {
        self.queue.submit(goal)
    }

    /// List background tasks, newest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>, HarnessError> {
        self.queue.list()
    }

    /// Fetch one background task by id.
    pub fn task_result(&self, id: &str) -> Result<Option<Task>, HarnessError> {
        self.queue.result(id)
    }

    /// Stop the background worker and release the queue.
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
    }
}
