//! The reasoner/executor loop: one scoped invocation of the agent.
//!
//! Each iteration builds the context, runs the compensation-wrapped LM turn,
//! then executes the returned tool calls strictly sequentially in
//! declaration order. Tool failures are data: they go back to the model as
//! tool messages and the loop continues. Only terminal compensation
//! failures, context overflow and cancellation end the invocation early.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::compensate::CompensationPipeline;
use crate::config::Tier;
use crate::context::ContextStore;
use crate::error::HarnessError;
use crate::events::EventBus;
use crate::llm::ChatRequest;
use crate::message::Message;
use crate::policy::PolicyEngine;
use crate::tools::{SideEffect, ToolContext, ToolRegistry};

/// How a scoped invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The model produced a plain answer.
    Answer(String),
    /// The agent-step budget for this invocation ran out.
    BudgetExhausted,
}

/// Running counters shared across one goal.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Loop iterations consumed.
    pub agent_steps: u32,
    /// Tool calls executed.
    pub tool_calls: u32,
    /// Compensations applied, by class.
    pub compensations: BTreeMap<&'static str, u32>,
}

/// The loop engine. One per goal; scoped per plan step.
pub struct Runner {
    pipeline: CompensationPipeline,
    registry: Arc<ToolRegistry>,
    bus: EventBus,
    budget_tokens: usize,
    tier: Tier,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("budget_tokens", &self.budget_tokens)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Build a loop engine.
    #[must_use]
    pub fn new(
        pipeline: CompensationPipeline,
        registry: Arc<ToolRegistry>,
        bus: EventBus,
        budget_tokens: usize,
        tier: Tier,
    ) -> Self {
        Self {
            pipeline,
            registry,
            bus,
            budget_tokens,
            tier,
        }
    }

    /// Run up to `step_budget` agent steps against the store.
    ///
    /// A tier escalated by the compensation pipeline stays escalated for the
    /// remainder of this invocation, then reverts to the configured default.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_scoped(
        &self,
        store: &mut ContextStore,
        policy: &PolicyEngine,
        tool_ctx: &ToolContext,
        stats: &mut RunStats,
        step_budget: u32,
        cancel: &CancellationToken,
        mut on_write: impl AsyncFnMut(),
    ) -> Result<LoopOutcome, HarnessError> {
        let mut tier = self.tier;

        for step in 0..step_budget {
            if cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }

            let messages = store.build_messages(self.budget_tokens)?;
            let request =
                ChatRequest::new(messages, tier).with_tools(self.registry.schemas());
            debug!(step, %tier, "loop iteration");

            let turn = self.pipeline.run(&self.registry, request, cancel).await?;
            tier = turn.tier;
            stats.agent_steps += 1;
            policy.note_agent_step();
            for record in &turn.compensations {
                *stats.compensations.entry(record.class.as_str()).or_insert(0) += 1;
            }

            if turn.calls.is_empty() {
                store.push_assistant(Message::assistant(turn.narrative.clone()))?;
                info!(steps = step + 1, "loop produced an answer");
                return Ok(LoopOutcome::Answer(turn.narrative));
            }

            store.push_assistant(Message::assistant_with_calls(
                turn.narrative.clone(),
                turn.calls.clone(),
            ))?;

            // Strictly sequential, declaration order. Never in parallel:
            // the checkpoint and policy model stays linear.
            for call in &turn.calls {
                if cancel.is_cancelled() {
                    // Close the exchange so the store invariant holds.
                    let cancelled = crate::message::ToolResult {
                        call_id: call.id.clone(),
                        ok: false,
                        payload: "cancelled before execution".to_string(),
                        elapsed_ms: 0,
                        truncation_note: None,
                    };
                    store.push_tool(Message::from_result(&call.name, &cancelled))?;
                    continue;
                }

                let result = self
                    .registry
                    .execute(call, policy, tool_ctx, &self.bus)
                    .await;
                stats.tool_calls += 1;

                store.record_result(call, &result);
                store.push_tool(Message::from_result(&call.name, &result))?;

                let is_write = self
                    .registry
                    .descriptor(&call.name)
                    .is_some_and(|d| d.side_effect == SideEffect::Write);
                if is_write && result.ok {
                    on_write().await;
                }
            }

            if cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }
        }

        info!(step_budget, "agent-step budget exhausted");
        Ok(LoopOutcome::BudgetExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::events::EventBus;
    use crate::llm::{ChatBackend, LmError, LmResponse, RawToolCall};
    use crate::message::Role;
    use crate::parser::ResponseParser;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    struct ScriptedBackend {
        script: Mutex<Vec<LmResponse>>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(
            &self,
            _request: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<LmResponse, LmError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(LmResponse {
                    assistant_text: "done".into(),
                    ..LmResponse::default()
                })
            } else {
                Ok(script.remove(0))
            }
        }
    }

    fn call_response(name: &str, arguments: &str) -> LmResponse {
        LmResponse {
            tool_calls: vec![RawToolCall {
                id: format!("c_{name}"),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            ..LmResponse::default()
        }
    }

    fn harness(
        script: Vec<LmResponse>,
        root: &Path,
    ) -> (Runner, Arc<ToolRegistry>, PolicyEngine, ToolContext) {
        let config = HarnessConfig::default();
        let registry = Arc::new(ToolRegistry::builtin(&config));
        let backend = Arc::new(ScriptedBackend {
            script: Mutex::new(script),
        });
        let bus = EventBus::new();
        let pipeline = CompensationPipeline::new(
            backend,
            ResponseParser::new(registry.names()),
            bus.clone(),
            3,
        );
        let runner = Runner::new(pipeline, Arc::clone(&registry), bus, 16_384, Tier::Small);
        let policy = PolicyEngine::new(crate::config::PresetName::Balanced, root, &[]);
        let tool_ctx = ToolContext {
            root: root.to_path_buf(),
            shell_timeout: std::time::Duration::from_secs(30),
            test_command: None,
            cancel: CancellationToken::new(),
        };
        (runner, registry, policy, tool_ctx)
    }

    #[tokio::test]
    async fn test_answer_ends_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _registry, policy, ctx) = harness(
            vec![LmResponse {
                assistant_text: "all good".into(),
                ..LmResponse::default()
            }],
            dir.path(),
        );
        let mut store = ContextStore::new();
        store.push_user(Message::user("goal")).unwrap();
        let mut stats = RunStats::default();
        let outcome = runner
            .run_scoped(
                &mut store,
                &policy,
                &ctx,
                &mut stats,
                8,
                &CancellationToken::new(),
                async || {},
            )
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::Answer("all good".into()));
        assert_eq!(stats.agent_steps, 1);
    }

    #[tokio::test]
    async fn test_tool_call_turn_appends_pair() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "contents").unwrap();
        let (runner, _registry, policy, ctx) = harness(
            vec![
                call_response("read_file", "{\"path\": \"a.txt\"}"),
                LmResponse {
                    assistant_text: "read it".into(),
                    ..LmResponse::default()
                },
            ],
            dir.path(),
        );
        let mut store = ContextStore::new();
        store.push_user(Message::user("goal")).unwrap();
        let mut stats = RunStats::default();
        let outcome = runner
            .run_scoped(
                &mut store,
                &policy,
                &ctx,
                &mut stats,
                8,
                &CancellationToken::new(),
                async || {},
            )
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::Answer("read it".into()));
        assert_eq!(stats.tool_calls, 1);

        // The store holds user, exchange pair, answer.
        let messages = store.build_messages(100_000).unwrap();
        let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.contains("contents"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        // Every turn issues another git_status call; the loop must stop at
        // the step budget.
        let script: Vec<LmResponse> = (0..10).map(|_| call_response("git_status", "{}")).collect();
        let (runner, _registry, policy, ctx) = harness(script, dir.path());
        let mut store = ContextStore::new();
        store.push_user(Message::user("goal")).unwrap();
        let mut stats = RunStats::default();
        let outcome = runner
            .run_scoped(
                &mut store,
                &policy,
                &ctx,
                &mut stats,
                3,
                &CancellationToken::new(),
                async || {},
            )
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::BudgetExhausted);
        assert_eq!(stats.agent_steps, 3);
    }

    #[tokio::test]
    async fn test_write_callback_fires_on_success_only() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _registry, policy, ctx) = harness(
            vec![
                call_response(
                    "write_file",
                    "{\"path\": \"out.txt\", \"content\": \"data\"}",
                ),
                call_response("read_file", "{\"path\": \"out.txt\"}"),
                LmResponse {
                    assistant_text: "done".into(),
                    ..LmResponse::default()
                },
            ],
            dir.path(),
        );
        let mut store = ContextStore::new();
        store.push_user(Message::user("goal")).unwrap();
        let mut stats = RunStats::default();
        let writes = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = std::sync::Arc::clone(&writes);
        runner
            .run_scoped(
                &mut store,
                &policy,
                &ctx,
                &mut stats,
                8,
                &CancellationToken::new(),
                async move || {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                },
            )
            .await
            .unwrap();
        assert_eq!(writes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_tool_is_fed_back_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _registry, policy, ctx) = harness(
            vec![
                call_response("read_file", "{\"path\": \"missing.txt\"}"),
                LmResponse {
                    assistant_text: "file is missing".into(),
                    ..LmResponse::default()
                },
            ],
            dir.path(),
        );
        let mut store = ContextStore::new();
        store.push_user(Message::user("goal")).unwrap();
        let mut stats = RunStats::default();
        let outcome = runner
            .run_scoped(
                &mut store,
                &policy,
                &ctx,
                &mut stats,
                8,
                &CancellationToken::new(),
                async || {},
            )
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::Answer("file is missing".into()));
        let messages = store.build_messages(100_000).unwrap();
        let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.starts_with("error:"));
    }
}
