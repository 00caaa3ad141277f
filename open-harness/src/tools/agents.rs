//! External command-line coding agents, treated as tools.
//!
//! Each agent is an independently installed binary. Availability is probed
//! once at registry construction; only resolvable agents are registered.
//! An invocation is a one-shot subprocess with the prompt on stdin or as an
//! argument, a ten-minute hard timeout and the full stdout as the result.
//!
//! When a reply matches the rate-limit lexicon, the roster records a
//! cooldown deadline for that agent and retries the same call against the
//! next agent in the cyclic fallback order
//! `claude_code → codex → gemini_cli → claude_code`, skipping agents in
//! cooldown. With every agent cooling, the call collapses to a single
//! rate-limited failure.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::shell::collect_child;
use super::{Tool, ToolContext, ToolDescriptor, ToolError, descriptors};
use crate::config::{AgentCommand, AgentsConfig, PromptVia};
use crate::llm::{DEFAULT_COOLDOWN, parse_retry_after, rate_limit_lexicon_matches};

/// Hard timeout for one agent invocation.
const AGENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Fallback order; invocation starts at the named agent and cycles.
const FALLBACK_ORDER: [&str; 3] = ["claude_code", "codex", "gemini_cli"];

/// One probed agent.
#[derive(Debug, Clone)]
struct AgentEntry {
    name: &'static str,
    command: AgentCommand,
    available: bool,
}

/// The shared roster: probed agents plus their cooldown deadlines.
#[derive(Debug)]
pub struct AgentRoster {
    entries: Vec<AgentEntry>,
    cooldowns: Mutex<HashMap<&'static str, Instant>>,
}

impl AgentRoster {
    /// Probe the configured agents on `PATH`.
    #[must_use]
    pub fn probe(config: &AgentsConfig) -> Self {
        let entries = [
            ("claude_code", &config.claude_code),
            ("codex", &config.codex),
            ("gemini_cli", &config.gemini_cli),
        ]
        .into_iter()
        .map(|(name, command)| {
            let available =
                !command.command.is_empty() && which::which(&command.command).is_ok();
            if available {
                info!(agent = name, command = %command.command, "external agent available");
            } else {
                debug!(agent = name, command = %command.command, "external agent not found");
            }
            AgentEntry {
                name,
                command: command.clone(),
                available,
            }
        })
        .collect();
        Self {
            entries,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Names of the agents that probed available.
    #[must_use]
    pub fn available(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|e| e.available)
            .map(|e| e.name)
            .collect()
    }

    /// Invoke `start` (or its fallbacks) with `prompt`.
    pub async fn invoke(
        &self,
        start: &str,
        prompt: &str,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let start_index = FALLBACK_ORDER
            .iter()
            .position(|n| *n == start)
            .ok_or_else(|| ToolError::InvalidInput(format!("unknown agent '{start}'")))?;

        let mut rate_limit_notice = None;
        for offset in 0..FALLBACK_ORDER.len() {
            let name = FALLBACK_ORDER[(start_index + offset) % FALLBACK_ORDER.len()];
            let Some(entry) = self.entries.iter().find(|e| e.name == name && e.available)
            else {
                continue;
            };
            if let Some(remaining) = self.cooldown_remaining(name) {
                debug!(agent = name, secs = remaining.as_secs(), "agent in cooldown, skipping");
                continue;
            }

            match self.invoke_one(entry, prompt, ctx).await {
                Err(ToolError::RateLimited { cooldown, message }) => {
                    warn!(agent = name, secs = cooldown.as_secs(), "agent rate limited");
                    self.record_cooldown(name, cooldown);
                    rate_limit_notice = Some(message);
                    // Fall through to the next agent in the order.
                }
                other => return other,
            }
        }

        match rate_limit_notice {
            Some(message) => Err(ToolError::RateLimited {
                cooldown: self.shortest_cooldown().unwrap_or(DEFAULT_COOLDOWN),
                message,
            }),
            None => Err(ToolError::InvalidInput(
                "no external agent is installed".into(),
            )),
        }
    }

    /// One subprocess invocation of one agent.
    async fn invoke_one(
        &self,
        entry: &AgentEntry,
        prompt: &str,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        debug!(agent = entry.name, "invoking external agent");
        let mut command = Command::new(&entry.command.command);
        command
            .args(&entry.command.args)
            .current_dir(&ctx.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match entry.command.prompt_via {
            PromptVia::Arg => {
                command.arg(prompt);
                command.stdin(Stdio::null());
            }
            PromptVia::Stdin => {
                command.stdin(Stdio::piped());
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| ToolError::Subprocess(format!("{}: spawn failed: {e}", entry.name)))?;

        if entry.command.prompt_via == PromptVia::Stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(|e| ToolError::Subprocess(format!("{}: stdin: {e}", entry.name)))?;
                drop(stdin);
            }
        }

        let output = collect_child(&mut child, AGENT_TIMEOUT, &ctx.cancel).await?;

        if rate_limit_lexicon_matches(&output.combined) {
            let cooldown = parse_retry_after(&output.combined).unwrap_or(DEFAULT_COOLDOWN);
            return Err(ToolError::RateLimited {
                cooldown,
                message: output.combined.trim().to_string(),
            });
        }
        if !output.ok {
            return Err(ToolError::Subprocess(format!(
                "{} exited with {}: {}",
                entry.name,
                output.exit_code.map_or("signal".to_string(), |c| c.to_string()),
                output.combined.trim()
            )));
        }
        Ok(output.combined)
    }

    fn record_cooldown(&self, name: &'static str, cooldown: Duration) {
        if let Ok(mut map) = self.cooldowns.lock() {
            map.insert(name, Instant::now() + cooldown);
        }
    }

    /// Time left on an agent's cooldown, `None` when retryable.
    fn cooldown_remaining(&self, name: &str) -> Option<Duration> {
        let map = self.cooldowns.lock().ok()?;
        let deadline = map.get(name)?;
        deadline.checked_duration_since(Instant::now())
    }

    fn shortest_cooldown(&self) -> Option<Duration> {
        let map = self.cooldowns.lock().ok()?;
        map.values()
            .filter_map(|d| d.checked_duration_since(Instant::now()))
            .min()
    }

    #[cfg(test)]
    fn for_test(entries: Vec<(&'static str, AgentCommand, bool)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, command, available)| AgentEntry {
                    name,
                    command,
                    available,
                })
                .collect(),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }
}

/// Agent-backed tools for every probed-available agent.
pub(super) fn all(roster: &Arc<AgentRoster>) -> Vec<Arc<dyn Tool>> {
    roster
        .available()
        .into_iter()
        .map(|name| Arc::new(AgentTool {
            name,
            roster: Arc::clone(roster),
        }) as Arc<dyn Tool>)
        .collect()
}

struct AgentTool {
    name: &'static str,
    roster: Arc<AgentRoster>,
}

#[async_trait]
impl Tool for AgentTool {
    fn descriptor(&self) -> ToolDescriptor {
        descriptors()
            .into_iter()
            .find(|d| d.name == self.name)
            .expect("agent descriptor exists")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let prompt = args
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'prompt'".into()))?;
        self.roster.invoke(self.name, prompt, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    fn ctx(root: &Path) -> ToolContext {
        ToolContext {
            root: root.to_path_buf(),
            shell_timeout: Duration::from_secs(30),
            test_command: None,
            cancel: CancellationToken::new(),
        }
    }

    /// An agent backed by `sh -c` so the test controls its stdout.
    fn fake_agent(script: &str) -> AgentCommand {
        AgentCommand {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "agent".to_string()],
            prompt_via: PromptVia::Arg,
        }
    }

    #[tokio::test]
    async fn test_rate_limited_agent_falls_back_to_next() {
        // Scenario: the first agent reports a rate limit with an explicit
        // interval; the call retries the next agent and records a cooldown.
        let dir = tempfile::tempdir().unwrap();
        let roster = AgentRoster::for_test(vec![
            (
                "claude_code",
                fake_agent("echo '429 rate limit, try again in 10 minutes'"),
                true,
            ),
            ("codex", fake_agent("echo fixed-by-codex"), true),
            ("gemini_cli", fake_agent("echo unused"), true),
        ]);

        let out = roster
            .invoke("claude_code", "fix it", &ctx(dir.path()))
            .await
            .unwrap();
        assert!(out.contains("fixed-by-codex"));

        let remaining = roster.cooldown_remaining("claude_code").unwrap();
        assert!(remaining > Duration::from_secs(590) && remaining <= Duration::from_secs(600));
        assert!(roster.cooldown_remaining("codex").is_none());
    }

    #[tokio::test]
    async fn test_all_rate_limited_collapses_to_one_failure() {
        let dir = tempfile::tempdir().unwrap();
        let roster = AgentRoster::for_test(vec![
            ("claude_code", fake_agent("echo 'rate limit'"), true),
            ("codex", fake_agent("echo 'quota exceeded'"), true),
            ("gemini_cli", fake_agent("echo 'too many requests'"), true),
        ]);

        let err = roster
            .invoke("codex", "fix it", &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_cooldown_expiry_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let roster = AgentRoster::for_test(vec![
            ("claude_code", fake_agent("echo ok"), true),
            ("codex", fake_agent("echo ok"), true),
            ("gemini_cli", fake_agent("echo ok"), true),
        ]);
        roster.record_cooldown("codex", Duration::from_millis(50));
        assert!(roster.cooldown_remaining("codex").is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(roster.cooldown_remaining("codex").is_none());
        let out = roster.invoke("codex", "go", &ctx(dir.path())).await.unwrap();
        assert!(out.contains("ok"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_failure_not_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let roster = AgentRoster::for_test(vec![
            ("claude_code", fake_agent("echo broken >&2; exit 1"), true),
            ("codex", fake_agent("echo should-not-run"), true),
            ("gemini_cli", fake_agent("echo should-not-run"), true),
        ]);
        let err = roster
            .invoke("claude_code", "go", &ctx(dir.path()))
            .await
            .unwrap_err();
        match err {
            ToolError::Subprocess(message) => assert!(message.contains("broken")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prompt_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = fake_agent("cat -");
        agent.prompt_via = PromptVia::Stdin;
        let roster = AgentRoster::for_test(vec![
            ("claude_code", agent, true),
            ("codex", fake_agent("echo x"), false),
            ("gemini_cli", fake_agent("echo x"), false),
        ]);
        let out = roster
            .invoke("claude_code", "the prompt", &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out, "the prompt");
    }
}
