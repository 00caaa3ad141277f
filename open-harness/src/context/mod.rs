//! Layered context store with two-level history compression.
//!
//! Layers, in render order:
//!
//! - *System*: project facts, policy summary, memory slice and the
//!   structured summary. Regenerated each turn, never trimmed (except the
//!   memory section under terminal pressure).
//! - *Plan*: the current plan step plus the next two. Never trimmed.
//! - *History*: L0 exchanges (assistant-with-calls plus its tool replies).
//!   Under pressure each pair compresses to an L1 one-liner
//!   `tool=X args_hash=Y ok=true|false`; runs of ≥ 4 L1 lines coalesce into
//!   an L2 aggregate `n tool calls (k writes, m failures)`.
//! - *Working*: the most recent turns at full fidelity.
//!
//! The store enforces the pairing invariant on append: an assistant message
//! that declares tool calls must be completed by its tool replies, in call
//! order, before the next assistant message is accepted.

mod summary;

pub use summary::{StructuredSummary, TestOutcome};

use std::collections::VecDeque;

use tracing::debug;

use crate::error::HarnessError;
use crate::message::{Message, ToolCall, ToolResult, estimate_tokens};

/// Token bucket size used to scale the working-layer width.
const WORKING_TOKENS_PER_TURN: usize = 8192;
/// Minimum working-layer width in turns.
const WORKING_MIN_TURNS: usize = 2;
/// Minimum run length of L1 lines that coalesces into an L2 aggregate.
const L2_RUN_LENGTH: usize = 4;

/// One closed turn of history.
#[derive(Debug, Clone)]
enum Turn {
    /// Assistant message with tool calls plus its replies, in call order.
    Exchange {
        assistant: Message,
        replies: Vec<Message>,
    },
    /// A user message or a plain assistant answer.
    Plain(Message),
}

/// An assistant-with-calls awaiting its tool replies.
#[derive(Debug)]
struct OpenExchange {
    assistant: Message,
    replies: Vec<Message>,
    expected: VecDeque<String>,
}

/// An L1 pair summary with the counts the L2 level aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
struct L1Line {
    text: String,
    calls: u32,
    writes: u32,
    failures: u32,
}

/// Compression state of one old-history turn during a build.
#[derive(Debug, Clone)]
enum Rep {
    Full(usize),
    Line(L1Line),
    Agg { calls: u32, writes: u32, failures: u32 },
}

/// The layered message store for one goal.
#[derive(Debug, Default)]
pub struct ContextStore {
    facts: String,
    policy_summary: String,
    memories: Vec<String>,
    plan_window: Option<String>,
    summary: StructuredSummary,
    turns: Vec<Turn>,
    open: Option<OpenExchange>,
}

impl ContextStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the project-facts section of the system layer.
    pub fn set_facts(&mut self, facts: impl Into<String>) {
        self.facts = facts.into();
    }

    /// Set the policy summary line of the system layer.
    pub fn set_policy_summary(&mut self, summary: impl Into<String>) {
        self.policy_summary = summary.into();
    }

    /// Set the bounded memory slice of the system layer.
    pub fn set_memories(&mut self, memories: Vec<String>) {
        self.memories = memories;
    }

    /// Set (or clear) the plan layer.
    pub fn set_plan_window(&mut self, window: Option<String>) {
        self.plan_window = window;
    }

    /// The structured summary.
    #[must_use]
    pub const fn summary(&self) -> &StructuredSummary {
        &self.summary
    }

    /// Mutable access for rollback pruning.
    pub fn summary_mut(&mut self) -> &mut StructuredSummary {
        &mut self.summary
    }

    /// Number of closed turns held.
    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Append a user message.
    pub fn push_user(&mut self, message: Message) -> Result<(), HarnessError> {
        self.require_closed("user message")?;
        self.turns.push(Turn::Plain(message));
        Ok(())
    }

    /// Append an assistant message. One that declares tool calls opens an
    /// exchange that must be completed by [`push_tool`](Self::push_tool)
    /// before any further assistant or user message.
    pub fn push_assistant(&mut self, message: Message) -> Result<(), HarnessError> {
        self.require_closed("assistant message")?;
        if message.has_tool_calls() {
            let expected = message
                .tool_calls
                .as_ref()
                .map(|calls| calls.iter().map(|c| c.id.clone()).collect())
                .unwrap_or_default();
            self.open = Some(OpenExchange {
                assistant: message,
                replies: Vec::new(),
                expected,
            });
        } else {
            self.turns.push(Turn::Plain(message));
        }
        Ok(())
    }

    /// Append the tool reply for the next outstanding call. Replies must
    /// arrive in call-declaration order.
    pub fn push_tool(&mut self, message: Message) -> Result<(), HarnessError> {
        let Some(open) = self.open.as_mut() else {
            return Err(HarnessError::internal(
                "tool message with no outstanding tool calls",
            ));
        };
        let Some(expected) = open.expected.front() else {
            return Err(HarnessError::internal("exchange already complete"));
        };
        let got = message.tool_call_id.as_deref().unwrap_or("");
        if got != expected {
            return Err(HarnessError::internal(format!(
                "tool reply out of order: expected call '{expected}', got '{got}'"
            )));
        }
        open.expected.pop_front();
        open.replies.push(message);
        if open.expected.is_empty() {
            let OpenExchange {
                assistant, replies, ..
            } = self.open.take().unwrap_or_else(|| unreachable!("checked above"));
            self.turns.push(Turn::Exchange { assistant, replies });
        }
        Ok(())
    }

    /// Fold one tool completion into the structured summary.
    pub fn record_result(&mut self, call: &ToolCall, result: &ToolResult) {
        self.summary.update(call, result);
    }

    fn require_closed(&self, what: &str) -> Result<(), HarnessError> {
        if let Some(open) = &self.open {
            return Err(HarnessError::internal(format!(
                "{what} appended while {} tool call(s) are outstanding",
                open.expected.len()
            )));
        }
        Ok(())
    }

    /// Build the flat message list for one LM request, within `budget`
    /// estimated tokens.
    ///
    /// Deterministic: the same store state and budget produce the same list.
    pub fn build_messages(&self, budget: usize) -> Result<Vec<Message>, HarnessError> {
        let working_width = (budget.div_ceil(WORKING_TOKENS_PER_TURN)).max(WORKING_MIN_TURNS);
        let old_len = self.turns.len().saturating_sub(working_width);

        let mut include_memories = true;
        let mut reps: Vec<Rep> = (0..old_len).map(Rep::Full).collect();
        // Working turns compress only under terminal pressure, oldest first.
        let mut working_reps: Vec<Rep> = (old_len..self.turns.len()).map(Rep::Full).collect();

        // Phase 1: L1 old pairs, oldest first.
        while self.cost(&reps, &working_reps, include_memories) > budget {
            let Some(slot) = reps.iter_mut().find(|r| matches!(r, Rep::Full(_))) else {
                break;
            };
            let Rep::Full(index) = *slot else { unreachable!() };
            *slot = Rep::Line(l1_of(&self.turns[index]));
        }

        // Phase 2: coalesce runs of L1 lines into L2 aggregates.
        if self.cost(&reps, &working_reps, include_memories) > budget {
            reps = coalesce(reps);
        }

        // Phase 3: drop L2 aggregates from the oldest forward.
        while self.cost(&reps, &working_reps, include_memories) > budget {
            let Some(position) = reps.iter().position(|r| matches!(r, Rep::Agg { .. })) else {
                break;
            };
            reps.remove(position);
        }

        // Phase 4: trim the memory section of the system layer.
        if self.cost(&reps, &working_reps, include_memories) > budget {
            include_memories = false;
            debug!("memory section trimmed under context pressure");
        }

        // Phase 5: terminal pressure — the working layer is no longer fresh.
        while self.cost(&reps, &working_reps, include_memories) > budget {
            if let Some(slot) = working_reps.iter_mut().find(|r| matches!(r, Rep::Full(_))) {
                let Rep::Full(index) = *slot else { unreachable!() };
                *slot = Rep::Line(l1_of(&self.turns[index]));
                continue;
            }
            if reps.iter().any(|r| matches!(r, Rep::Line(_))) {
                let position = reps
                    .iter()
                    .position(|r| matches!(r, Rep::Line(_)))
                    .unwrap_or(0);
                reps.remove(position);
                continue;
            }
            if !working_reps.is_empty() {
                working_reps.remove(0);
                continue;
            }
            let estimated = self.cost(&reps, &working_reps, include_memories);
            return Err(HarnessError::ContextOverflow { estimated, budget });
        }

        Ok(self.assemble(&reps, &working_reps, include_memories))
    }

    /// Estimated token cost of a candidate layout.
    fn cost(&self, reps: &[Rep], working_reps: &[Rep], include_memories: bool) -> usize {
        let mut total = estimate_tokens(&self.render_system(include_memories));
        if let Some(plan) = &self.plan_window {
            total += estimate_tokens(plan) + 4;
        }
        let compressed = self.render_compressed(reps, working_reps);
        if !compressed.is_empty() {
            total += estimate_tokens(&compressed) + 4;
        }
        for rep in reps.iter().chain(working_reps) {
            if let Rep::Full(index) = rep {
                total += turn_tokens(&self.turns[*index]);
            }
        }
        total + 4
    }

    fn assemble(&self, reps: &[Rep], working_reps: &[Rep], include_memories: bool) -> Vec<Message> {
        let mut messages = Vec::new();
        messages.push(Message::system(self.render_system(include_memories)));
        if let Some(plan) = &self.plan_window {
            messages.push(Message::system(plan.clone()));
        }
        let compressed = self.render_compressed(reps, working_reps);
        if !compressed.is_empty() {
            messages.push(Message::system(compressed));
        }
        for rep in reps.iter().chain(working_reps) {
            if let Rep::Full(index) = rep {
                match &self.turns[*index] {
                    Turn::Plain(message) => messages.push(message.clone()),
                    Turn::Exchange { assistant, replies } => {
                        messages.push(assistant.clone());
                        messages.extend(replies.iter().cloned());
                    }
                }
            }
        }
        messages
    }

    fn render_system(&self, include_memories: bool) -> String {
        let mut out = String::new();
        if self.facts.is_empty() {
            out.push_str("You are a coding agent operating on a local workspace.");
        } else {
            out.push_str(&self.facts);
        }
        if !self.policy_summary.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.policy_summary);
        }
        if include_memories && !self.memories.is_empty() {
            out.push_str("\n\nRelevant memories:\n");
            for memory in &self.memories {
                out.push_str("- ");
                out.push_str(memory);
                out.push('\n');
            }
        }
        let summary = self.summary.render();
        if !summary.is_empty() {
            out.push_str("\n\nWorkspace summary:\n");
            out.push_str(&summary);
        }
        out
    }

    /// The compressed-history section: every non-full rep, in order.
    fn render_compressed(&self, reps: &[Rep], working_reps: &[Rep]) -> String {
        let mut lines = Vec::new();
        for rep in reps.iter().chain(working_reps) {
            match rep {
                Rep::Full(_) => {}
                Rep::Line(line) => lines.push(line.text.clone()),
                Rep::Agg {
                    calls,
                    writes,
                    failures,
                } => lines.push(format!("{calls} tool calls ({writes} writes, {failures} failures)")),
            }
        }
        if lines.is_empty() {
            String::new()
        } else {
            format!("Earlier actions (compressed):\n{}", lines.join("\n"))
        }
    }
}

/// Estimated cost of one full-fidelity turn.
fn turn_tokens(turn: &Turn) -> usize {
    match turn {
        Turn::Plain(message) => message.token_estimate,
        Turn::Exchange { assistant, replies } => {
            assistant.token_estimate + replies.iter().map(|m| m.token_estimate).sum::<usize>()
        }
    }
}

/// The L1 compression of one turn. Idempotent by construction: a turn has
/// exactly one L1 form, and L1 lines are never re-compressed into L1.
fn l1_of(turn: &Turn) -> L1Line {
    match turn {
        Turn::Plain(message) => {
            let head: String = message
                .content
                .chars()
                .map(|c| if c == '\n' { ' ' } else { c })
                .take(80)
                .collect();
            L1Line {
                text: format!("{}: {head}", message.role.as_str()),
                calls: 0,
                writes: 0,
                failures: 0,
            }
        }
        Turn::Exchange { assistant, replies } => {
            let calls = assistant.tool_calls.as_deref().unwrap_or(&[]);
            let mut parts = Vec::with_capacity(calls.len());
            let mut writes = 0;
            let mut failures = 0;
            for (call, reply) in calls.iter().zip(replies) {
                let ok = !reply.content.starts_with("error:");
                if !ok {
                    failures += 1;
                }
                if ok && matches!(call.name.as_str(), "write_file" | "edit_file") {
                    writes += 1;
                }
                parts.push(format!(
                    "tool={} args_hash={} ok={ok}",
                    call.name,
                    call.args_hash()
                ));
            }
            L1Line {
                text: parts.join("; "),
                calls: calls.len() as u32,
                writes,
                failures,
            }
        }
    }
}

/// Coalesce runs of ≥ [`L2_RUN_LENGTH`] consecutive L1 lines into L2
/// aggregates, preserving order.
fn coalesce(reps: Vec<Rep>) -> Vec<Rep> {
    let mut out = Vec::with_capacity(reps.len());
    let mut run: Vec<L1Line> = Vec::new();

    let flush = |run: &mut Vec<L1Line>, out: &mut Vec<Rep>| {
        if run.len() >= L2_RUN_LENGTH {
            let calls = run.iter().map(|l| l.calls).sum();
            let writes = run.iter().map(|l| l.writes).sum();
            let failures = run.iter().map(|l| l.failures).sum();
            out.push(Rep::Agg {
                calls,
                writes,
                failures,
            });
        } else {
            out.extend(run.drain(..).map(Rep::Line));
        }
        run.clear();
    };

    for rep in reps {
        match rep {
            Rep::Line(line) => run.push(line),
            other => {
                flush(&mut run, &mut out);
                out.push(other);
            }
        }
    }
    flush(&mut run, &mut out);
    out
}
