//! Planner, rule-based critic, and replanner.
//!
//! The planner estimates goal complexity with a rule pass, then asks the LM
//! for a plan capped at the complexity-appropriate step count. The critic is
//! deliberately LM-free: it rejects structurally useless plans so the
//! orchestrator can fall back to direct execution instead of burning turns.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::Failure;
use crate::config::Tier;
use crate::error::HarnessError;
use crate::llm::{ChatBackend, ChatRequest};
use crate::message::Message;
use crate::parser::repair_json;
use crate::tools::ToolRegistry;

/// Goal complexity, driving plan size and budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    /// Small, single-concern goal.
    Low,
    /// Multi-file or test-touching goal.
    Medium,
    /// Refactors and cross-cutting work.
    High,
}

impl Complexity {
    /// Maximum plan steps.
    #[must_use]
    pub const fn steps_cap(self) -> usize {
        match self {
            Self::Low => 3,
            Self::Medium => 5,
            Self::High => 8,
        }
    }

    /// Agent-step budget per plan step.
    #[must_use]
    pub const fn step_budget(self) -> u32 {
        match self {
            Self::Low => 8,
            Self::Medium => 12,
            Self::High => 15,
        }
    }

    /// Replans allowed per goal.
    #[must_use]
    pub const fn replan_allowance(self) -> u32 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }
}

/// One plan step.
#[derive(Debug, Clone)]
pub struct Step {
    /// Short title.
    pub title: String,
    /// What the executor loop is told to do.
    pub instruction: String,
    /// Observable completion criteria.
    pub success_criteria: Vec<String>,
    /// Agent-step budget for this step.
    pub step_budget: u32,
}

/// A goal plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The goal text.
    pub goal: String,
    /// Estimated complexity.
    pub complexity: Complexity,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Assumptions the planner stated.
    pub assumptions: Vec<String>,
}

/// Generic criterion used when the LM omits one.
const GENERIC_CRITERION: &str =
    "tool invocation for this step completes without a terminal failure";

/// Verbs that signal structural work.
const HEAVY_VERBS: &[&str] = &["refactor", "rewrite", "migrate", "redesign", "restructure", "overhaul"];
/// Verbs that signal ordinary edits.
const LIGHT_VERBS: &[&str] = &["fix", "add", "implement", "create", "update", "remove", "rename"];
/// Keywords that pull testing into scope.
const TEST_KEYWORDS: &[&str] = &["test", "tests", "coverage", "ci", "regression"];

/// Verbs the critic accepts as actionable.
const ACTIONABLE_VERBS: &[&str] = &[
    "read", "write", "edit", "create", "add", "fix", "update", "remove", "delete", "run",
    "execute", "search", "find", "check", "verify", "refactor", "rename", "move", "implement",
    "install", "commit", "inspect", "list", "replace", "rewrite", "extract", "test", "modify",
];

/// Criteria markers no registered tool can satisfy.
const UNREACHABLE_MARKERS: &[&str] = &[
    "human approval",
    "manually verify",
    "ask the user",
    "user confirms",
    "in the browser",
    "deploy to production",
];

/// Rule-based complexity estimate: length, heavy verbs, filename-looking
/// nouns, test keywords.
#[must_use]
pub fn estimate_complexity(goal: &str) -> Complexity {
    let lowered = goal.to_lowercase();
    let mut score = 0usize;

    if goal.len() > 120 {
        score += 1;
    }
    if goal.len() > 240 {
        score += 1;
    }
    if HEAVY_VERBS.iter().any(|v| lowered.contains(v)) {
        score += 2;
    }
    if LIGHT_VERBS.iter().any(|v| lowered.contains(v)) {
        score += 1;
    }

    let filename_like = goal
        .split_whitespace()
        .filter(|token| {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '.' && c != '/');
            token.contains('/') || (token.contains('.') && !token.ends_with('.'))
        })
        .count();
    if filename_like >= 2 {
        score += 1;
    }
    if filename_like >= 4 {
        score += 1;
    }

    if TEST_KEYWORDS
        .iter()
        .any(|k| lowered.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *k))
    {
        score += 1;
    }

    match score {
        0 | 1 => Complexity::Low,
        2 | 3 => Complexity::Medium,
        _ => Complexity::High,
    }
}

/// Critic verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriticVerdict {
    /// The plan is executable.
    Accepted,
    /// The plan is structurally useless; fall back to direct execution.
    Rejected(String),
}

/// Rule-based plan review, no LM involved.
#[must_use]
pub fn critique(plan: &Plan, registry: &ToolRegistry) -> CriticVerdict {
    if plan.steps.is_empty() {
        return CriticVerdict::Rejected("plan has zero steps".into());
    }
    for (index, step) in plan.steps.iter().enumerate() {
        let text = format!("{} {}", step.title, step.instruction).to_lowercase();
        let actionable = ACTIONABLE_VERBS
            .iter()
            .any(|verb| text.split_whitespace().any(|w| w.starts_with(verb)));
        if !actionable {
            return CriticVerdict::Rejected(format!(
                "step {} has no actionable verb: '{}'",
                index + 1,
                step.title
            ));
        }
        let tool_names = registry.names();
        for criterion in &step.success_criteria {
            let lowered = criterion.to_lowercase();
            if UNREACHABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
                return CriticVerdict::Rejected(format!(
                    "step {} criterion is unreachable by any registered tool: '{criterion}'",
                    index + 1,
                ));
            }
            // A criterion that names a specific tool must name a real one.
            if let Some(named) = named_tool(&lowered) {
                if !tool_names.iter().any(|n| n == &named) {
                    return CriticVerdict::Rejected(format!(
                        "step {} criterion requires unregistered tool '{named}'",
                        index + 1,
                    ));
                }
            }
        }
    }
    CriticVerdict::Accepted
}

/// A `name(` tool reference inside a criterion, when present.
fn named_tool(criterion: &str) -> Option<String> {
    let open = criterion.find('(')?;
    let head = &criterion[..open];
    let name: String = head
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    (name.contains('_') && name.len() > 3).then_some(name)
}

/// The LM-backed planner.
#[derive(Clone)]
pub struct Planner {
    backend: Arc<dyn ChatBackend>,
    tier: Tier,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner").field("tier", &self.tier).finish_non_exhaustive()
    }
}

impl Planner {
    /// Build a planner over a chat backend.
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>, tier: Tier) -> Self {
        Self { backend, tier }
    }

    /// Produce a plan for `goal`.
    pub async fn plan(
        &self,
        goal: &str,
        facts: &str,
        cancel: &CancellationToken,
    ) -> Result<Plan, HarnessError> {
        let complexity = estimate_complexity(goal);
        debug!(?complexity, "complexity estimated");
        let prompt = plan_prompt(goal, facts, complexity.steps_cap());
        let response = self.request(prompt, cancel).await?;
        let steps = parse_steps(&response, complexity);
        info!(steps = steps.len(), ?complexity, "plan produced");
        Ok(Plan {
            goal: goal.to_string(),
            complexity,
            steps,
            assumptions: Vec::new(),
        })
    }

    /// Re-plan after a step failure.
    pub async fn replan(
        &self,
        plan: &Plan,
        completed: &[(String, String)],
        failing: &Step,
        failure: &Failure,
        cancel: &CancellationToken,
    ) -> Result<Plan, HarnessError> {
        let mut prompt = format!(
            "The goal is: {goal}\n\nCompleted steps so far:\n",
            goal = plan.goal
        );
        if completed.is_empty() {
            prompt.push_str("(none)\n");
        }
        for (title, outcome) in completed {
            prompt.push_str(&format!("- {title}: {outcome}\n"));
        }
        prompt.push_str(&format!(
            "\nThe step '{}' failed with {failure}.\n\
             Produce a revised plan for the remaining work as a JSON array of at most {} \
             steps, each {{\"title\": ..., \"instruction\": ..., \"success_criteria\": [...]}}. \
             Do not repeat completed work.",
            failing.title,
            plan.complexity.steps_cap(),
        ));
        let response = self.request(prompt, cancel).await?;
        let steps = parse_steps(&response, plan.complexity);
        info!(steps = steps.len(), "replanned");
        Ok(Plan {
            goal: plan.goal.clone(),
            complexity: plan.complexity,
            steps,
            assumptions: plan.assumptions.clone(),
        })
    }

    async fn request(
        &self,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<String, HarnessError> {
        let messages = vec![
            Message::system(
                "You are a planning assistant for a coding agent. Reply with the JSON \
                 plan only, no prose.",
            ),
            Message::user(prompt),
        ];
        let mut request = ChatRequest::new(messages, self.tier);
        request.stream = false;
        let response = self.backend.chat(&request, cancel).await?;
        Ok(response.assistant_text)
    }
}

fn plan_prompt(goal: &str, facts: &str, cap: usize) -> String {
    format!(
        "Project facts:\n{facts}\n\nGoal: {goal}\n\n\
         Break the goal into at most {cap} concrete steps. Reply with a JSON array, \
         each element {{\"title\": ..., \"instruction\": ..., \"success_criteria\": [...]}}."
    )
}

/// Parse the LM's plan reply: JSON array first, numbered lines as fallback.
fn parse_steps(reply: &str, complexity: Complexity) -> Vec<Step> {
    let budget = complexity.step_budget();
    let cap = complexity.steps_cap();

    if let Some(steps) = parse_json_steps(reply, budget) {
        return steps.into_iter().take(cap).collect();
    }
    warn!("plan reply was not a JSON array, falling back to line parse");
    parse_line_steps(reply, budget).into_iter().take(cap).collect()
}

fn parse_json_steps(reply: &str, budget: u32) -> Option<Vec<Step>> {
    let body = strip_fences(reply);
    let value = repair_json(body).ok()?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("steps") {
            Some(Value::Array(items)) => items.clone(),
            _ => return None,
        },
        _ => return None,
    };
    let steps: Vec<Step> = items
        .iter()
        .filter_map(|item| {
            let map = item.as_object()?;
            let title = map.get("title").and_then(Value::as_str)?.trim().to_string();
            let instruction = map
                .get("instruction")
                .and_then(Value::as_str)
                .unwrap_or(&title)
                .trim()
                .to_string();
            let mut criteria: Vec<String> = map
                .get("success_criteria")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if criteria.is_empty() {
                criteria.push(GENERIC_CRITERION.to_string());
            }
            Some(Step {
                title,
                instruction,
                success_criteria: criteria,
                step_budget: budget,
            })
        })
        .collect();
    (!steps.is_empty()).then_some(steps)
}

fn parse_line_steps(reply: &str, budget: u32) -> Vec<Step> {
    reply
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let rest = trimmed
                .strip_prefix(|c: char| c.is_ascii_digit())
                .map(|r| r.trim_start_matches(|c: char| c.is_ascii_digit()))
                .map(|r| r.trim_start_matches(['.', ')', ':', ' ']))
                .or_else(|| trimmed.strip_prefix("- "))?;
            if rest.len() < 4 {
                return None;
            }
            Some(Step {
                title: rest.chars().take(60).collect(),
                instruction: rest.to_string(),
                success_criteria: vec![GENERIC_CRITERION.to_string()],
                step_budget: budget,
            })
        })
        .collect()
}

fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|r| r.strip_suffix("```"))
        .map_or(trimmed, str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FailureClass;
    use crate::config::HarnessConfig;

    #[test]
    fn test_complexity_rules() {
        assert_eq!(estimate_complexity("show git status"), Complexity::Low);
        assert_eq!(
            estimate_complexity("fix the failing tests in src/parser.rs and src/lexer.rs"),
            Complexity::Medium
        );
        assert_eq!(
            estimate_complexity(
                "refactor the storage layer across db/engine.py db/wal.py db/index.py and \
                 db/compact.py, keep the tests green and add regression coverage for the \
                 compaction path"
            ),
            Complexity::High
        );
    }

    #[test]
    fn test_complexity_budgets_table() {
        assert_eq!(
            (Complexity::Low.steps_cap(), Complexity::Low.step_budget(), Complexity::Low.replan_allowance()),
            (3, 8, 0)
        );
        assert_eq!(
            (Complexity::Medium.steps_cap(), Complexity::Medium.step_budget(), Complexity::Medium.replan_allowance()),
            (5, 12, 1)
        );
        assert_eq!(
            (Complexity::High.steps_cap(), Complexity::High.step_budget(), Complexity::High.replan_allowance()),
            (8, 15, 2)
        );
    }

    #[test]
    fn test_parse_json_plan() {
        let reply = r#"```json
[
  {"title": "Read the failing test", "instruction": "Read tests/test_user.py", "success_criteria": ["file contents retrieved"]},
  {"title": "Fix validation", "instruction": "Edit src/user.py to validate email"}
]
```"#;
        let steps = parse_steps(reply, Complexity::Medium);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].title, "Read the failing test");
        assert_eq!(steps[0].step_budget, 12);
        // Missing criteria filled with the generic one.
        assert_eq!(steps[1].success_criteria, vec![GENERIC_CRITERION.to_string()]);
    }

    #[test]
    fn test_parse_numbered_line_fallback() {
        let reply = "Here is my plan:\n1. Read the failing test file\n2. Fix the validation bug\n3. Run the tests";
        let steps = parse_steps(reply, Complexity::Low);
        assert_eq!(steps.len(), 3);
        assert!(steps[0].instruction.contains("Read the failing test"));
    }

    #[test]
    fn test_steps_capped_by_complexity() {
        let items: Vec<String> = (0..10)
            .map(|i| format!("{{\"title\": \"Fix part {i}\", \"instruction\": \"edit file {i}\"}}"))
            .collect();
        let reply = format!("[{}]", items.join(","));
        let steps = parse_steps(&reply, Complexity::Low);
        assert_eq!(steps.len(), 3);
    }

    #[test]
    fn test_critic_rejects_empty_plan() {
        let registry = ToolRegistry::builtin(&HarnessConfig::default());
        let plan = Plan {
            goal: "g".into(),
            complexity: Complexity::Low,
            steps: vec![],
            assumptions: vec![],
        };
        assert!(matches!(critique(&plan, &registry), CriticVerdict::Rejected(_)));
    }

    #[test]
    fn test_critic_rejects_non_actionable_step() {
        let registry = ToolRegistry::builtin(&HarnessConfig::default());
        let plan = Plan {
            goal: "g".into(),
            complexity: Complexity::Low,
            steps: vec![Step {
                title: "Vibes".into(),
                instruction: "generally consider the situation".into(),
                success_criteria: vec![GENERIC_CRITERION.into()],
                step_budget: 8,
            }],
            assumptions: vec![],
        };
        assert!(matches!(critique(&plan, &registry), CriticVerdict::Rejected(_)));
    }

    #[test]
    fn test_critic_rejects_unreachable_criterion() {
        let registry = ToolRegistry::builtin(&HarnessConfig::default());
        let plan = Plan {
            goal: "g".into(),
            complexity: Complexity::Low,
            steps: vec![Step {
                title: "Fix the bug".into(),
                instruction: "edit src/main.rs".into(),
                success_criteria: vec!["user confirms the dialog looks right".into()],
                step_budget: 8,
            }],
            assumptions: vec![],
        };
        assert!(matches!(critique(&plan, &registry), CriticVerdict::Rejected(_)));
    }

    #[test]
    fn test_critic_accepts_reasonable_plan() {
        let registry = ToolRegistry::builtin(&HarnessConfig::default());
        let plan = Plan {
            goal: "fix tests".into(),
            complexity: Complexity::Medium,
            steps: vec![
                Step {
                    title: "Read the failing test".into(),
                    instruction: "read tests/test_user.py".into(),
                    success_criteria: vec!["file read".into()],
                    step_budget: 12,
                },
                Step {
                    title: "Run tests".into(),
                    instruction: "run the test suite".into(),
                    success_criteria: vec!["all tests pass".into()],
                    step_budget: 12,
                },
            ],
            assumptions: vec![],
        };
        assert_eq!(critique(&plan, &registry), CriticVerdict::Accepted);
    }

    #[tokio::test]
    async fn test_planner_uses_backend_reply() {
        use crate::llm::{LmError, LmResponse};
        use async_trait::async_trait;

        struct OneShot;
        #[async_trait]
        impl ChatBackend for OneShot {
            async fn chat(
                &self,
                _request: &ChatRequest,
                _cancel: &CancellationToken,
            ) -> Result<LmResponse, LmError> {
                Ok(LmResponse {
                    assistant_text: r#"[{"title": "Run tests", "instruction": "run the suite"}]"#
                        .to_string(),
                    ..LmResponse::default()
                })
            }
        }

        let planner = Planner::new(Arc::new(OneShot), Tier::Small);
        let plan = planner
            .plan("fix the failing tests", "rust project", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.complexity, Complexity::Medium);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].title, "Run tests");

        let failure = Failure::new(FailureClass::ToolExecution, "tests failed");
        let replanned = planner
            .replan(&plan, &[], &plan.steps[0], &failure, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(replanned.steps.len(), 1);
    }
}
