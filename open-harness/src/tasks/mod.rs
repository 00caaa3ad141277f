//! Background task queue: persistent FIFO of goals with crash recovery.
//!
//! One worker, strictly sequential — every task writes the same workspace,
//! so parallelism is deliberately absent. Each task runs in its own
//! orchestrator with a fresh context store; no state crosses tasks. A
//! terminal-bell event is emitted on completion for UI consumers.

mod store;

pub use store::{Task, TaskStatus, TaskStore, TaskStoreError};

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{GoalStatus, Orchestrator};
use crate::config::{HarnessConfig, logs_dir};
use crate::error::HarnessError;
use crate::events::{Event, EventBus};
use crate::llm::ChatBackend;
use crate::message::epoch_secs;
use crate::tools::ToolRegistry;

/// Idle poll interval; a fallback in case a notify is missed.
const IDLE_POLL: Duration = Duration::from_secs(5);

/// Everything the worker needs to build a per-task orchestrator.
#[derive(Clone)]
pub struct WorkerContext {
    /// Harness configuration.
    pub config: Arc<HarnessConfig>,
    /// Chat backend shared with the interactive session.
    pub backend: Arc<dyn ChatBackend>,
    /// The tool registry.
    pub registry: Arc<ToolRegistry>,
    /// Event bus.
    pub bus: EventBus,
    /// Workspace root.
    pub root: PathBuf,
    /// The workspace mutex shared with the interactive session.
    pub workspace_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    /// A fresh orchestrator for one task.
    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            self.bus.clone(),
            self.root.clone(),
            Arc::clone(&self.workspace_lock),
        )
    }
}

/// The queue handle. Submission is synchronous; execution is backgrounded.
#[derive(Debug)]
pub struct TaskQueue {
    store: TaskStore,
    bus: EventBus,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    logs: PathBuf,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Recover crashed tasks and start the worker, logging under the
    /// default `~/.open_harness/logs` directory.
    pub fn start(store: TaskStore, ctx: WorkerContext) -> Result<Self, HarnessError> {
        let logs = logs_dir()?;
        Self::start_with_logs(store, ctx, logs)
    }

    /// As [`start`](Self::start) with an explicit log directory.
    pub fn start_with_logs(
        store: TaskStore,
        ctx: WorkerContext,
        logs: PathBuf,
    ) -> Result<Self, HarnessError> {
        let scrubbed = store.recover_crashed()?;
        if scrubbed > 0 {
            warn!(scrubbed, "recovered tasks left running by a previous process");
        }

        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let bus = ctx.bus.clone();
        let worker = tokio::spawn(worker_loop(
            store.clone(),
            ctx,
            Arc::clone(&notify),
            cancel.clone(),
        ));

        Ok(Self {
            store,
            bus,
            notify,
            cancel,
            logs,
            worker: Some(worker),
        })
    }

    /// Enqueue a goal; returns the persisted task synchronously.
    pub fn submit(&self, goal: &str) -> Result<Task, HarnessError> {
        let log_path = task_log_path(&self.logs, goal);
        let task = self.store.submit(goal, &log_path.to_string_lossy())?;
        info!(id = %task.id, "task submitted");
        self.bus.emit(Event::TaskSubmitted {
            id: task.id.clone(),
        });
        self.notify.notify_one();
        Ok(task)
    }

    /// All tasks, newest first. Read-only.
    pub fn list(&self) -> Result<Vec<Task>, HarnessError> {
        Ok(self.store.list()?)
    }

    /// One task by id. Read-only.
    pub fn result(&self, id: &str) -> Result<Option<Task>, HarnessError> {
        Ok(self.store.get(id)?)
    }

    /// Stop the worker after the current task finishes.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.notify.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

fn worker_loop(
    store: TaskStore,
    ctx: WorkerContext,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>> {
    Box::pin(async move {
        if cancel.is_cancelled() {
            return;
        }

        match store.next_queued() {
            Ok(Some(task)) => {
                run_task(store.clone(), ctx.clone(), task, cancel.clone()).await;
            }
            Ok(None) => {
                if !wait_for_work(Arc::clone(&notify), cancel.clone()).await {
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "task store poll failed");
                tokio::time::sleep(IDLE_POLL).await;
            }
        }

        worker_loop(store, ctx, notify, cancel).await;
    })
}

/// Waits for new work, a cancellation, or the idle poll timeout. Returns
/// `false` if the worker should stop (cancelled).
async fn wait_for_work(notify: Arc<Notify>, cancel: CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = notify.notified() => true,
        () = tokio::time::sleep(IDLE_POLL) => true,
    }
}

async fn run_task(store: TaskStore, ctx: WorkerContext, task: Task, cancel: CancellationToken) {
    if let Err(e) = store.mark_running(&task.id) {
        error!(id = %task.id, error = %e, "cannot mark task running");
        return;
    }
    info!(id = %task.id, goal = %task.goal, "task started");
    append_log(&task.log_path, &format!("task {} started: {}", task.id, task.goal));

    let orchestrator = ctx.orchestrator();
    let outcome = orchestrator.run_goal(&task.goal, cancel.child_token()).await;

    let status = match outcome.status {
        GoalStatus::Succeeded => TaskStatus::Succeeded,
        GoalStatus::Failed => TaskStatus::Failed,
        GoalStatus::Cancelled => TaskStatus::Cancelled,
    };
    if let Err(e) = store.finish(&task.id, status, &outcome.summary) {
        error!(id = %task.id, error = %e, "cannot finish task");
    }
    append_log(&task.log_path, &outcome.summary);
    info!(id = %task.id, %status, "task finished");

    ctx.bus.emit(Event::TaskCompleted {
        id: task.id.clone(),
        status: status.as_str().to_string(),
    });
    ctx.bus.emit(Event::TerminalBell);
}

/// `task_<epoch>_<slug>.log` under the configured log directory. The slug
/// is a filename-safe fragment of the goal for operator grepping.
fn task_log_path(dir: &std::path::Path, goal: &str) -> PathBuf {
    let slug: String = goal
        .chars()
        .take(24)
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    dir.join(format!("task_{}_{slug}.log", epoch_secs()))
}

fn append_log(path: &str, line: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(e) = result {
        warn!(path, error = %e, "cannot append task log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, LmError, LmResponse};
    use async_trait::async_trait;

    /// Backend that immediately answers so tasks complete fast.
    struct AnswerBackend;

    #[async_trait]
    impl ChatBackend for AnswerBackend {
        async fn chat(
            &self,
            _request: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<LmResponse, LmError> {
            Ok(LmResponse {
                assistant_text: "[{\"title\": \"Run the check\", \"instruction\": \"verify the state\"}]"
                    .to_string(),
                ..LmResponse::default()
            })
        }
    }

    fn worker_context(root: &std::path::Path) -> WorkerContext {
        let config = Arc::new(HarnessConfig::default());
        WorkerContext {
            registry: Arc::new(ToolRegistry::builtin(&config)),
            config,
            backend: Arc::new(AnswerBackend),
            bus: EventBus::new(),
            root: root.to_path_buf(),
            workspace_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    #[tokio::test]
    async fn test_submit_runs_and_bells() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = worker_context(dir.path());
        let mut events = ctx.bus.subscribe();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        let queue =
            TaskQueue::start_with_logs(TaskStore::in_memory().unwrap(), ctx, logs).unwrap();

        let task = queue.submit("check the workspace state").unwrap();
        assert_eq!(task.status, TaskStatus::Queued);

        // Wait for the terminal bell (bounded).
        let bell = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Some(Event::TerminalBell) => break true,
                    Some(_) => {}
                    None => break false,
                }
            }
        })
        .await
        .unwrap();
        assert!(bell);

        let finished = queue.result(&task.id).unwrap().unwrap();
        assert!(matches!(
            finished.status,
            TaskStatus::Succeeded | TaskStatus::Failed
        ));
        assert!(finished.result.is_some());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_sequential_fifo_execution() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = worker_context(dir.path());
        let store = TaskStore::in_memory().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        let queue = TaskQueue::start_with_logs(store.clone(), ctx, logs).unwrap();

        let a = queue.submit("first goal").unwrap();
        let b = queue.submit("second goal").unwrap();

        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let done = queue
                    .list()
                    .unwrap()
                    .iter()
                    .filter(|t| !matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
                    .count();
                if done == 2 {
                    break;
                }
                // At no point may two tasks run at once.
                assert!(store.running_count().unwrap() <= 1);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let a_done = queue.result(&a.id).unwrap().unwrap();
        let b_done = queue.result(&b.id).unwrap().unwrap();
        // FIFO: the first submission finished no later than the second.
        assert!(a_done.finished_at.unwrap() <= b_done.finished_at.unwrap());
        queue.shutdown().await;
    }
}
