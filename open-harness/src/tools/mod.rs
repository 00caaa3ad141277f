//! Tool registry and executor.
//!
//! The tool set is a fixed contract (§ the built-in table below). Each tool
//! declares a descriptor: argument schema, output byte budget and a
//! side-effect class the policy engine keys its budgets on. The executor
//! validates arguments, consults policy, runs the tool and bounds its
//! output with head+tail truncation.

mod agents;
mod fs;
mod git;
mod shell;

pub use agents::AgentRoster;
pub use shell::{ShellOutput, run_shell};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HarnessConfig;
use crate::events::{Event, EventBus};
use crate::message::{ToolCall, ToolResult};
use crate::policy::PolicyEngine;

/// Side-effect class of a tool, the unit the policy engine budgets on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideEffect {
    /// Reads workspace state only.
    Read,
    /// Mutates files under the workspace.
    Write,
    /// Runs a shell command.
    Shell,
    /// Drives the version-control store.
    Git,
    /// Invokes an external agent over the network or as a subprocess.
    NetworkExternal,
}

/// Declared type of one tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A JSON string.
    String,
    /// A JSON integer.
    Integer,
    /// A JSON boolean.
    Boolean,
}

impl ArgKind {
    const fn json_name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// One declared argument.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    /// Argument name.
    pub name: &'static str,
    /// Declared type.
    pub kind: ArgKind,
    /// Whether the argument must be present.
    pub required: bool,
    /// One-line description shown to the model.
    pub brief: &'static str,
}

impl ArgSpec {
    const fn required(name: &'static str, kind: ArgKind, brief: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            brief,
        }
    }

    const fn optional(name: &'static str, kind: ArgKind, brief: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            brief,
        }
    }
}

/// Static description of one registered tool.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Registered name.
    pub name: &'static str,
    /// Description shown to the model.
    pub description: &'static str,
    /// Argument schema.
    pub args: Vec<ArgSpec>,
    /// Maximum output bytes before head+tail truncation.
    pub output_limit: usize,
    /// Side-effect class.
    pub side_effect: SideEffect,
}

impl ToolDescriptor {
    /// Render the descriptor in the wire `tools` format.
    #[must_use]
    pub fn to_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in &self.args {
            properties.insert(
                arg.name.to_string(),
                json!({ "type": arg.kind.json_name(), "description": arg.brief }),
            );
            if arg.required {
                required.push(Value::String(arg.name.to_string()));
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }

    /// Compact `name(arg, arg?)` signature for prompts.
    #[must_use]
    pub fn signature(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                if a.required {
                    a.name.to_string()
                } else {
                    format!("{}?", a.name)
                }
            })
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }
}

/// Argument validation failure. Classified as `missing_args` by the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    /// The tool is not registered.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    /// Required arguments are absent.
    #[error("missing required argument(s): {}", .missing.join(", "))]
    Missing {
        /// Names of the absent arguments.
        missing: Vec<String>,
    },
    /// An argument is present with the wrong JSON type.
    #[error("argument '{name}' must be a {expected}")]
    WrongType {
        /// Argument name.
        name: String,
        /// Expected JSON type.
        expected: &'static str,
    },
}

/// Validate `args` against a descriptor.
pub fn validate_args(descriptor: &ToolDescriptor, args: &Map<String, Value>) -> Result<(), ArgError> {
    let missing: Vec<String> = descriptor
        .args
        .iter()
        .filter(|spec| spec.required && !args.contains_key(spec.name))
        .map(|spec| spec.name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ArgError::Missing { missing });
    }
    for spec in &descriptor.args {
        if let Some(value) = args.get(spec.name) {
            if !value.is_null() && !spec.kind.accepts(value) {
                return Err(ArgError::WrongType {
                    name: spec.name.to_string(),
                    expected: spec.kind.json_name(),
                });
            }
        }
    }
    Ok(())
}

/// Errors produced by tool implementations.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Bad input that passed schema validation but failed semantically.
    #[error("{0}")]
    InvalidInput(String),
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The subprocess exceeded its deadline.
    #[error("timed out after {secs}s")]
    Timeout {
        /// The deadline that was hit.
        secs: u64,
    },
    /// Subprocess failure (spawn error or non-zero exit).
    #[error("{0}")]
    Subprocess(String),
    /// Every external agent is rate limited.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Earliest cooldown expiry.
        cooldown: Duration,
        /// Upstream notice.
        message: String,
    },
    /// The call was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Per-goal execution context handed to every tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Project root all relative paths resolve against.
    pub root: PathBuf,
    /// Default shell timeout.
    pub shell_timeout: Duration,
    /// Configured test command, when set.
    pub test_command: Option<String>,
    /// Goal cancel token.
    pub cancel: CancellationToken,
}

/// The tool interface.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's descriptor.
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute with validated arguments.
    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError>;
}

// Output byte budgets (§ output shaping).
const LIMIT_READ_FILE: usize = 8 * 1024;
const LIMIT_SHELL: usize = 3 * 1024;
const LIMIT_RUN_TESTS: usize = 4 * 1024;
const LIMIT_DEFAULT: usize = 2 * 1024;

/// Descriptors for the full built-in tool set, in registration order.
#[must_use]
pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "read_file",
            description: "Read a file and return its contents.",
            args: vec![ArgSpec::required("path", ArgKind::String, "File path, relative to the project root")],
            output_limit: LIMIT_READ_FILE,
            side_effect: SideEffect::Read,
        },
        ToolDescriptor {
            name: "write_file",
            description: "Write content to a file, creating parent directories as needed.",
            args: vec![
                ArgSpec::required("path", ArgKind::String, "File path to write"),
                ArgSpec::required("content", ArgKind::String, "Full file content"),
            ],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Write,
        },
        ToolDescriptor {
            name: "edit_file",
            description: "Replace the first occurrence of a text span in a file.",
            args: vec![
                ArgSpec::required("path", ArgKind::String, "File path to edit"),
                ArgSpec::required("find", ArgKind::String, "Exact text to find"),
                ArgSpec::required("replace", ArgKind::String, "Replacement text"),
            ],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Write,
        },
        ToolDescriptor {
            name: "list_dir",
            description: "List directory entries, optionally filtered by a glob.",
            args: vec![
                ArgSpec::required("path", ArgKind::String, "Directory path"),
                ArgSpec::optional("glob", ArgKind::String, "Glob filter, e.g. *.rs"),
            ],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Read,
        },
        ToolDescriptor {
            name: "search_files",
            description: "Search file contents under a path, literal or regex.",
            args: vec![
                ArgSpec::required("pattern", ArgKind::String, "Pattern to search for"),
                ArgSpec::required("path", ArgKind::String, "Directory to search under"),
                ArgSpec::optional("is_regex", ArgKind::Boolean, "Treat pattern as a regex (default false)"),
            ],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Read,
        },
        ToolDescriptor {
            name: "shell",
            description: "Run a shell command in the project root and return combined output.",
            args: vec![
                ArgSpec::required("command", ArgKind::String, "Command line to run via the shell"),
                ArgSpec::optional("timeout", ArgKind::Integer, "Timeout in seconds (default 30)"),
            ],
            output_limit: LIMIT_SHELL,
            side_effect: SideEffect::Shell,
        },
        ToolDescriptor {
            name: "git_status",
            description: "Show the working-tree status.",
            args: vec![],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Git,
        },
        ToolDescriptor {
            name: "git_diff",
            description: "Show the working-tree diff.",
            args: vec![ArgSpec::optional("staged", ArgKind::Boolean, "Diff the index instead of the worktree")],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Git,
        },
        ToolDescriptor {
            name: "git_commit",
            description: "Stage paths (or everything) and commit.",
            args: vec![
                ArgSpec::required("message", ArgKind::String, "Commit message"),
                ArgSpec::optional("paths", ArgKind::String, "Space-separated paths to stage (default: all)"),
            ],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Git,
        },
        ToolDescriptor {
            name: "git_branch",
            description: "List, create, switch or delete branches.",
            args: vec![
                ArgSpec::optional("name", ArgKind::String, "Branch name"),
                ArgSpec::optional("action", ArgKind::String, "list | create | switch | delete (default list)"),
            ],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Git,
        },
        ToolDescriptor {
            name: "git_log",
            description: "Show recent commits, one line each.",
            args: vec![ArgSpec::optional("count", ArgKind::Integer, "Number of commits (default 10)")],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::Git,
        },
        ToolDescriptor {
            name: "run_tests",
            description: "Run the project's test suite.",
            args: vec![ArgSpec::optional("target", ArgKind::String, "Test target or filter")],
            output_limit: LIMIT_RUN_TESTS,
            side_effect: SideEffect::Shell,
        },
        ToolDescriptor {
            name: "claude_code",
            description: "Delegate a focused coding task to the claude_code external agent.",
            args: vec![ArgSpec::required("prompt", ArgKind::String, "Task description for the agent")],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::NetworkExternal,
        },
        ToolDescriptor {
            name: "codex",
            description: "Delegate a focused coding task to the codex external agent.",
            args: vec![ArgSpec::required("prompt", ArgKind::String, "Task description for the agent")],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::NetworkExternal,
        },
        ToolDescriptor {
            name: "gemini_cli",
            description: "Delegate a focused coding task to the gemini_cli external agent.",
            args: vec![ArgSpec::required("prompt", ArgKind::String, "Task description for the agent")],
            output_limit: LIMIT_DEFAULT,
            side_effect: SideEffect::NetworkExternal,
        },
    ]
}

/// Head share of the truncation split.
const TRUNCATE_HEAD_SHARE: f64 = 0.6;

/// Bound `raw` to `limit` bytes with a head+tail (≈60/40) split and a single
/// marker line stating how many bytes were elided.
#[must_use]
pub fn shape_output(raw: &str, limit: usize) -> (String, Option<String>) {
    let escaped = escape_binary(raw);
    if escaped.len() <= limit {
        return (escaped, None);
    }
    let head_len = (limit as f64 * TRUNCATE_HEAD_SHARE) as usize;
    let tail_len = limit - head_len;
    let head_end = floor_char_boundary(&escaped, head_len);
    let tail_start = ceil_char_boundary(&escaped, escaped.len() - tail_len);
    let elided = tail_start - head_end;
    let note = format!("[... {elided} bytes elided ...]");
    let shaped = format!("{}\n{note}\n{}", &escaped[..head_end], &escaped[tail_start..]);
    (shaped, Some(note))
}

/// Escape control characters (except newline and tab) so binary output
/// cannot corrupt the transcript.
fn escape_binary(raw: &str) -> String {
    if raw.chars().all(|c| !c.is_control() || c == '\n' || c == '\t' || c == '\r') {
        return raw.to_string();
    }
    raw.chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' && c != '\r' {
                format!("\\x{:02x}", c as u32)
            } else {
                c.to_string()
            }
        })
        .collect()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// The registry: name → implementation, built once per harness.
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Register the built-in set. External agents are probed for
    /// availability and only registered when their command resolves.
    #[must_use]
    pub fn builtin(config: &HarnessConfig) -> Self {
        let mut tools: BTreeMap<&'static str, Arc<dyn Tool>> = BTreeMap::new();

        for tool in fs::all() {
            tools.insert(tool.descriptor().name, tool);
        }
        for tool in git::all() {
            tools.insert(tool.descriptor().name, tool);
        }
        for tool in shell::all() {
            tools.insert(tool.descriptor().name, tool);
        }

        let roster = Arc::new(AgentRoster::probe(&config.agents));
        for tool in agents::all(&roster) {
            tools.insert(tool.descriptor().name, tool);
        }

        debug!(tools = ?tools.keys().collect::<Vec<_>>(), "tool registry built");
        Self { tools }
    }

    /// Registered tool names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().map(ToString::to_string).collect()
    }

    /// Descriptor for one tool.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|t| t.descriptor())
    }

    /// All wire-format schemas, for the LM request.
    #[must_use]
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.values().map(|t| t.descriptor().to_schema()).collect()
    }

    /// Validate a call's arguments against its tool schema.
    pub fn validate_call(&self, call: &ToolCall) -> Result<(), ArgError> {
        let descriptor = self
            .descriptor(&call.name)
            .ok_or_else(|| ArgError::UnknownTool(call.name.clone()))?;
        validate_args(&descriptor, &call.arguments)
    }

    /// Execute one validated call: policy check, run, bound output.
    ///
    /// Policy denials and tool errors both come back as non-ok results; the
    /// payload is the data the model adapts to.
    pub async fn execute(
        &self,
        call: &ToolCall,
        policy: &PolicyEngine,
        ctx: &ToolContext,
        bus: &EventBus,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(call.name.as_str()) else {
            return ToolResult {
                call_id: call.id.clone(),
                ok: false,
                payload: format!("unknown tool '{}'", call.name),
                elapsed_ms: 0,
                truncation_note: None,
            };
        };
        let descriptor = tool.descriptor();

        if let Err(violation) = policy.check(&descriptor, &call.arguments) {
            bus.emit(Event::PolicyViolation {
                tool: call.name.clone(),
                detail: violation.detail.clone(),
            });
            return ToolResult {
                call_id: call.id.clone(),
                ok: false,
                payload: violation.payload(),
                elapsed_ms: 0,
                truncation_note: None,
            };
        }

        bus.emit(Event::ToolStarted {
            id: call.id.clone(),
            name: call.name.clone(),
        });

        let started = Instant::now();
        let outcome = tool.call(&call.arguments, ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (ok, raw_payload) = match outcome {
            Ok(output) => (true, output),
            Err(e) => {
                warn!(tool = call.name, error = %e, "tool failed");
                (false, e.to_string())
            }
        };
        let (payload, truncation_note) = shape_output(&raw_payload, descriptor.output_limit);

        bus.emit(Event::ToolCompleted {
            id: call.id.clone(),
            name: call.name.clone(),
            ok,
            elapsed_ms,
        });

        ToolResult {
            call_id: call.id.clone(),
            ok,
            payload,
            elapsed_ms,
            truncation_note,
        }
    }
}
