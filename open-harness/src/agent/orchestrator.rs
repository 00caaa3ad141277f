//! Goal orchestrator: plan, execute, checkpoint, recover, summarize.
//!
//! Drives the planner and the executor loop over the checkpointed
//! workspace. The workspace mutex is held for the lifetime of the goal so
//! the interactive session and the background task worker never interleave
//! writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::planner::{Complexity, CriticVerdict, Plan, Planner, Step, critique};
use super::runner::{LoopOutcome, RunStats, Runner};
use crate::checkpoint::CheckpointManager;
use crate::compensate::CompensationPipeline;
use crate::config::HarnessConfig;
use crate::context::ContextStore;
use crate::error::HarnessError;
use crate::events::{Event, EventBus};
use crate::llm::ChatBackend;
use crate::message::Message;
use crate::parser::ResponseParser;
use crate::policy::PolicyEngine;
use crate::tools::{ToolContext, ToolRegistry};

/// How many upcoming steps the plan layer shows beside the current one.
const PLAN_LOOKAHEAD: usize = 2;
/// Memory rows rendered into the system layer.
const MEMORY_SLICE: usize = 8;

/// Terminal status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalStatus {
    /// The goal ran to a final answer.
    Succeeded,
    /// The goal failed terminally.
    Failed,
    /// The goal's cancel token fired.
    Cancelled,
}

/// End-of-goal statistics for the user-visible summary.
#[derive(Debug, Clone, Default)]
pub struct GoalStats {
    /// Agent steps consumed.
    pub agent_steps: u32,
    /// Tool calls executed.
    pub tool_calls: u32,
    /// Compensations applied, by failure class.
    pub compensations: BTreeMap<&'static str, u32>,
    /// Snapshots taken (baseline excluded).
    pub checkpoints: u32,
    /// Rollbacks performed.
    pub rollbacks: u32,
    /// Files modified (post-rollback view).
    pub files_modified: Vec<String>,
    /// Pass/fail counts from the last test run, when tests ran.
    pub tests: Option<(u32, u32)>,
    /// Wall-clock time.
    pub elapsed_ms: u64,
}

/// Result of [`Orchestrator::run_goal`].
#[derive(Debug, Clone)]
pub struct GoalOutcome {
    /// Terminal status.
    pub status: GoalStatus,
    /// Human-readable summary.
    pub summary: String,
    /// Counters.
    pub stats: GoalStats,
}

/// The goal driver. One per harness; goals run serially under the
/// workspace mutex.
pub struct Orchestrator {
    config: Arc<HarnessConfig>,
    backend: Arc<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    bus: EventBus,
    root: PathBuf,
    workspace_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator for a workspace root.
    #[must_use]
    pub fn new(
        config: Arc<HarnessConfig>,
        backend: Arc<dyn ChatBackend>,
        registry: Arc<ToolRegistry>,
        bus: EventBus,
        root: PathBuf,
        workspace_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            config,
            backend,
            registry,
            bus,
            root,
            workspace_lock,
        }
    }

    /// Run one goal to completion. Never panics on goal-scope failures;
    /// every outcome is reported through the returned [`GoalOutcome`] and
    /// the event bus.
    pub async fn run_goal(&self, goal: &str, cancel: CancellationToken) -> GoalOutcome {
        let _workspace = self.workspace_lock.lock().await;
        let started = Instant::now();
        self.bus.emit(Event::GoalStarted {
            goal: goal.to_string(),
        });
        info!(goal, "goal started");

        let mut checkpoint = CheckpointManager::enter(&self.root, self.bus.clone()).await;
        let mut run = GoalRun::new(self, goal, &cancel);

        let result = run.execute(&mut checkpoint).await;
        let outcome = run.finish(result, &mut checkpoint, started).await;

        match outcome.status {
            GoalStatus::Succeeded => self.bus.emit(Event::GoalCompleted {
                summary: outcome.summary.clone(),
            }),
            _ => self.bus.emit(Event::GoalFailed {
                summary: outcome.summary.clone(),
            }),
        }
        outcome
    }

    fn tool_context(&self, cancel: &CancellationToken) -> ToolContext {
        ToolContext {
            root: self.root.clone(),
            shell_timeout: std::time::Duration::from_secs(self.config.tools.shell_timeout_secs),
            test_command: self.config.tools.test_command.clone(),
            cancel: cancel.clone(),
        }
    }

    fn project_facts(&self) -> String {
        let mut facts = format!(
            "You are a coding agent working in the project at {}.\n\
             Use the registered tools to inspect and modify the workspace. \
             When the goal is done, reply with a plain-text summary and no tool calls.",
            self.root.display()
        );
        let mut markers = Vec::new();
        for (file, label) in [
            ("Cargo.toml", "Rust (cargo)"),
            ("package.json", "JavaScript/TypeScript (npm)"),
            ("pyproject.toml", "Python"),
            ("go.mod", "Go"),
        ] {
            if self.root.join(file).is_file() {
                markers.push(label);
            }
        }
        if !markers.is_empty() {
            facts.push_str(&format!("\nProject type: {}.", markers.join(", ")));
        }
        facts
    }
}

/// Mutable state of one goal run.
struct GoalRun<'a> {
    orchestrator: &'a Orchestrator,
    goal: String,
    cancel: &'a CancellationToken,
    store: ContextStore,
    policy: PolicyEngine,
    planner: Planner,
    runner: Runner,
    tool_ctx: ToolContext,
    stats: RunStats,
    completed_steps: Vec<(String, String)>,
    final_answer: Option<String>,
}

impl<'a> GoalRun<'a> {
    fn new(orchestrator: &'a Orchestrator, goal: &str, cancel: &'a CancellationToken) -> Self {
        let config = &orchestrator.config;
        let tier = config.default_tier();

        let policy = PolicyEngine::new(
            config.policy.preset,
            &orchestrator.root,
            &config.policy.writable_paths,
        );

        let mut store = ContextStore::new();
        store.set_facts(orchestrator.project_facts());
        store.set_policy_summary(policy.summary());
        store.set_memories(load_memories());

        let pipeline = CompensationPipeline::new(
            Arc::clone(&orchestrator.backend),
            ResponseParser::new(orchestrator.registry.names()),
            orchestrator.bus.clone(),
            config.retry_limit(),
        );
        let runner = Runner::new(
            pipeline,
            Arc::clone(&orchestrator.registry),
            orchestrator.bus.clone(),
            config.context_budget(),
            tier,
        );
        let planner = Planner::new(Arc::clone(&orchestrator.backend), tier);
        let tool_ctx = orchestrator.tool_context(cancel);

        Self {
            orchestrator,
            goal: goal.to_string(),
            cancel,
            store,
            policy,
            planner,
            runner,
            tool_ctx,
            stats: RunStats::default(),
            completed_steps: Vec::new(),
            final_answer: None,
        }
    }

    /// Plan and execute; the error path carries terminal failures only.
    async fn execute(&mut self, checkpoint: &mut CheckpointManager) -> Result<(), HarnessError> {
        let facts = self.orchestrator.project_facts();
        let plan = match self
            .planner
            .plan(&self.goal, &facts, self.cancel)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "planning failed, falling back to direct execution");
                return self.run_direct(checkpoint).await;
            }
        };

        match critique(&plan, &self.orchestrator.registry) {
            CriticVerdict::Accepted => self.run_plan(plan, checkpoint).await,
            CriticVerdict::Rejected(reason) => {
                info!(reason, "plan rejected by critic, direct execution");
                self.run_direct(checkpoint).await
            }
        }
    }

    /// Execute a critic-accepted plan step by step.
    async fn run_plan(
        &mut self,
        mut plan: Plan,
        checkpoint: &mut CheckpointManager,
    ) -> Result<(), HarnessError> {
        let mut replans_left = plan.complexity.replan_allowance();
        let mut index = 0;

        while index < plan.steps.len() {
            if self.cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }
            let step = plan.steps[index].clone();
            self.orchestrator.bus.emit(Event::PlanStepStarted {
                index,
                title: step.title.clone(),
            });
            self.store.set_plan_window(Some(render_plan_window(&plan, index)));
            self.store
                .push_user(Message::user(step_instruction(&step)))?;

            match self.run_step(&step, checkpoint).await {
                Ok(answer) => {
                    self.orchestrator.bus.emit(Event::PlanStepCompleted {
                        index,
                        title: step.title.clone(),
                    });
                    checkpoint
                        .snapshot(&format!("plan step '{}'", step.title))
                        .await
                        .ok();
                    self.completed_steps
                        .push((step.title.clone(), head(&answer, 120)));
                    self.final_answer = Some(answer);
                    index += 1;
                }
                Err(failure_detail) => {
                    self.orchestrator.bus.emit(Event::PlanStepFailed {
                        index,
                        title: step.title.clone(),
                        detail: failure_detail.to_string(),
                    });
                    checkpoint.rollback_last().await.ok();
                    self.store.summary_mut().prune_missing(&self.orchestrator.root);

                    match failure_detail {
                        HarnessError::Cancelled => return Err(HarnessError::Cancelled),
                        HarnessError::ContextOverflow { .. } => return Err(failure_detail),
                        detail => {
                            if replans_left == 0 {
                                info!("replan allowance exhausted, direct execution fallback");
                                return self.run_direct(checkpoint).await;
                            }
                            replans_left -= 1;
                            let failure = failure_of(&detail);
                            plan = self
                                .planner
                                .replan(&plan, &self.completed_steps, &step, &failure, self.cancel)
                                .await?;
                            if plan.steps.is_empty() {
                                return self.run_direct(checkpoint).await;
                            }
                            index = 0;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// One scoped loop invocation for one plan step.
    async fn run_step(
        &mut self,
        step: &Step,
        checkpoint: &mut CheckpointManager,
    ) -> Result<String, HarnessError> {
        let outcome = self
            .runner
            .run_scoped(
                &mut self.store,
                &self.policy,
                &self.tool_ctx,
                &mut self.stats,
                step.step_budget,
                self.cancel,
                async || {
                    checkpoint.note_write().await;
                },
            )
            .await?;
        match outcome {
            LoopOutcome::Answer(text) => Ok(text),
            LoopOutcome::BudgetExhausted => Err(HarnessError::internal(format!(
                "step budget of {} agent steps exhausted",
                step.step_budget
            ))),
        }
    }

    /// Direct execution: the goal as a single step, context preserved.
    async fn run_direct(&mut self, checkpoint: &mut CheckpointManager) -> Result<(), HarnessError> {
        debug!("direct execution");
        self.store.set_plan_window(None);
        self.store.push_user(Message::user(format!(
            "Goal: {}\nWork on this goal directly with the registered tools.",
            self.goal
        )))?;
        let budget = Complexity::Medium.step_budget();
        let outcome = self
            .runner
            .run_scoped(
                &mut self.store,
                &self.policy,
                &self.tool_ctx,
                &mut self.stats,
                budget,
                self.cancel,
                async || {
                    checkpoint.note_write().await;
                },
            )
            .await?;
        match outcome {
            LoopOutcome::Answer(text) => {
                self.final_answer = Some(text);
                Ok(())
            }
            LoopOutcome::BudgetExhausted => Err(HarnessError::internal(
                "agent-step budget exhausted without an answer",
            )),
        }
    }

    /// Close the checkpoint lifecycle and assemble the outcome.
    async fn finish(
        mut self,
        result: Result<(), HarnessError>,
        checkpoint: &mut CheckpointManager,
        started: Instant,
    ) -> GoalOutcome {
        let status = match &result {
            Ok(()) => GoalStatus::Succeeded,
            Err(HarnessError::Cancelled) => GoalStatus::Cancelled,
            Err(_) => GoalStatus::Failed,
        };

        match status {
            GoalStatus::Succeeded => {
                if let Err(e) = checkpoint.commit(&self.goal).await {
                    warn!(error = %e, "final squash-merge failed");
                }
            }
            GoalStatus::Failed | GoalStatus::Cancelled => {
                checkpoint.rollback_all().await.ok();
                self.store.summary_mut().prune_missing(&self.orchestrator.root);
                if self.completed_steps.is_empty() {
                    checkpoint.abandon().await.ok();
                } else {
                    // Keep what the completed steps committed.
                    if let Err(e) = checkpoint.commit(&self.goal).await {
                        warn!(error = %e, "partial merge failed");
                    }
                }
            }
        }

        let summary_view = self.store.summary();
        let stats = GoalStats {
            agent_steps: self.stats.agent_steps,
            tool_calls: self.stats.tool_calls,
            compensations: self.stats.compensations.clone(),
            checkpoints: checkpoint.snapshots().len().saturating_sub(1) as u32,
            rollbacks: checkpoint.rollbacks(),
            files_modified: summary_view.files_modified().iter().cloned().collect(),
            tests: summary_view
                .last_test_result()
                .map(|t| (t.passed, t.failed)),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        let summary = render_summary(&self.goal, status, &result, self.final_answer.as_deref(), &stats);
        GoalOutcome {
            status,
            summary,
            stats,
        }
    }
}

/// Bounded in-memory slice of the external project-memory store.
///
/// The schema is owned by an external collaborator; everything here is
/// best-effort and a missing file, table or column yields an empty slice.
fn load_memories() -> Vec<String> {
    let Ok(path) = crate::config::memory_db_path() else {
        return Vec::new();
    };
    if !path.is_file() {
        return Vec::new();
    }
    read_memory_rows(&path).unwrap_or_default()
}

fn read_memory_rows(path: &Path) -> Option<Vec<String>> {
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .ok()?;
    let mut stmt = conn
        .prepare("SELECT content FROM memories ORDER BY rowid DESC LIMIT ?1")
        .ok()?;
    let rows = stmt
        .query_map([MEMORY_SLICE as i64], |row| row.get::<_, String>(0))
        .ok()?;
    Some(rows.flatten().collect())
}

fn render_plan_window(plan: &Plan, index: usize) -> String {
    let step = &plan.steps[index];
    let mut out = format!(
        "Plan step {}/{}: {}\nInstruction: {}\nSuccess criteria:\n",
        index + 1,
        plan.steps.len(),
        step.title,
        step.instruction
    );
    for criterion in &step.success_criteria {
        out.push_str("  - ");
        out.push_str(criterion);
        out.push('\n');
    }
    let upcoming: Vec<&str> = plan
        .steps
        .iter()
        .skip(index + 1)
        .take(PLAN_LOOKAHEAD)
        .map(|s| s.title.as_str())
        .collect();
    if !upcoming.is_empty() {
        out.push_str(&format!("Next: {}", upcoming.join("; ")));
    }
    out
}

fn step_instruction(step: &Step) -> String {
    format!(
        "Work on this step now: {}\nReply with tool calls, or a plain-text \
         summary when the step is complete.",
        step.instruction
    )
}

fn failure_of(error: &HarnessError) -> crate::classify::Failure {
    use crate::classify::{Failure, FailureClass};
    match error {
        HarnessError::CompensationExhausted { failure, .. } => failure.clone(),
        other => Failure::new(FailureClass::ToolExecution, other.to_string()),
    }
}

fn head(text: &str, limit: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(limit)
        .collect();
    flat
}

fn render_summary(
    goal: &str,
    status: GoalStatus,
    result: &Result<(), HarnessError>,
    final_answer: Option<&str>,
    stats: &GoalStats,
) -> String {
    let mut out = match status {
        GoalStatus::Succeeded => format!("Goal succeeded: {goal}\n"),
        GoalStatus::Failed => format!("Goal failed: {goal}\n"),
        GoalStatus::Cancelled => format!("Goal cancelled: {goal}\n"),
    };
    if let Some(answer) = final_answer {
        out.push_str(answer.trim());
        out.push('\n');
    }
    if let Err(e) = result {
        out.push_str(&format!("Failure: {e}\n"));
    }
    out.push_str(&format!(
        "\n{} agent steps, {} tool calls, {} checkpoints, {} rollbacks, {:.1}s elapsed\n",
        stats.agent_steps,
        stats.tool_calls,
        stats.checkpoints,
        stats.rollbacks,
        stats.elapsed_ms as f64 / 1000.0
    ));
    if !stats.compensations.is_empty() {
        let parts: Vec<String> = stats
            .compensations
            .iter()
            .map(|(class, count)| format!("{class}×{count}"))
            .collect();
        out.push_str(&format!("Compensations: {}\n", parts.join(", ")));
    }
    if !stats.files_modified.is_empty() {
        out.push_str(&format!("Files modified: {}\n", stats.files_modified.join(", ")));
    }
    if let Some((passed, failed)) = stats.tests {
        out.push_str(&format!("Tests: {passed} passed, {failed} failed\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::planner::Complexity;

    fn plan_of(titles: &[&str]) -> Plan {
        Plan {
            goal: "g".into(),
            complexity: Complexity::Medium,
            steps: titles
                .iter()
                .map(|t| Step {
                    title: (*t).to_string(),
                    instruction: format!("do {t}"),
                    success_criteria: vec!["done".into()],
                    step_budget: 12,
                })
                .collect(),
            assumptions: vec![],
        }
    }

    #[test]
    fn test_plan_window_shows_current_plus_two() {
        let plan = plan_of(&["one", "two", "three", "four", "five"]);
        let window = render_plan_window(&plan, 1);
        assert!(window.contains("Plan step 2/5: two"));
        assert!(window.contains("Next: three; four"));
        assert!(!window.contains("five"));
    }

    #[test]
    fn test_plan_window_last_step_has_no_next() {
        let plan = plan_of(&["one", "two"]);
        let window = render_plan_window(&plan, 1);
        assert!(!window.contains("Next:"));
    }

    #[test]
    fn test_summary_includes_counters() {
        let mut stats = GoalStats {
            agent_steps: 7,
            tool_calls: 12,
            checkpoints: 2,
            rollbacks: 1,
            elapsed_ms: 4200,
            ..GoalStats::default()
        };
        stats.compensations.insert("malformed_json", 2);
        stats.files_modified = vec!["src/a.rs".into()];
        stats.tests = Some((10, 0));
        let summary = render_summary("fix it", GoalStatus::Succeeded, &Ok(()), Some("done"), &stats);
        assert!(summary.contains("7 agent steps"));
        assert!(summary.contains("malformed_json×2"));
        assert!(summary.contains("Tests: 10 passed, 0 failed"));
    }

    #[test]
    fn test_missing_memory_db_is_empty_slice() {
        // No memory DB in the test environment's home is fine either way;
        // the call must never error.
        let _ = load_memories();
    }
}
