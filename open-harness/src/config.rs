//! Harness configuration: discovery, parsing, defaults.
//!
//! Configuration is YAML, discovered with precedence `--config` path >
//! `./open_harness.yaml` > `~/.open_harness/open_harness.yaml` > built-in
//! defaults. The legacy basename `config.yaml` is accepted at both file
//! locations. Every section has a serde default so a partial file works.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Directory name under the home directory holding harness state.
const HARNESS_DIR: &str = ".open_harness";
/// Preferred configuration basename.
const CONFIG_BASENAME: &str = "open_harness.yaml";
/// Legacy configuration basename, still accepted.
const LEGACY_BASENAME: &str = "config.yaml";

/// A model capability tier.
///
/// The harness addresses models by tier, never by name; the mapping to a
/// concrete model identifier is a [`TierTable`] lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Cheapest, weakest model.
    Small,
    /// Mid-capability model.
    Medium,
    /// Strongest configured model.
    Large,
}

impl Tier {
    /// The next tier up, or `None` at the top.
    #[must_use]
    pub const fn escalated(self) -> Option<Self> {
        match self {
            Self::Small => Some(Self::Medium),
            Self::Medium => Some(Self::Large),
            Self::Large => None,
        }
    }

    /// String form used in config and CLI flags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(HarnessError::config(format!("unknown tier '{other}'"))),
        }
    }
}

/// Tier → model-identifier table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    /// Model id for the small tier.
    pub small: String,
    /// Model id for the medium tier.
    pub medium: String,
    /// Model id for the large tier.
    pub large: String,
}

impl TierTable {
    /// Resolve a tier to its configured model identifier.
    #[must_use]
    pub fn resolve(&self, tier: Tier) -> &str {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            small: "qwen2.5-coder:7b".to_string(),
            medium: "qwen2.5-coder:14b".to_string(),
            large: "qwen2.5-coder:32b".to_string(),
        }
    }
}

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL up to and excluding `/chat/completions`.
    pub base_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Per-attempt request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl EndpointConfig {
    /// The validated base URL. A malformed URL or a non-http(s) scheme is a
    /// configuration error, caught at startup rather than on the first
    /// request.
    pub fn parsed_base_url(&self) -> Result<url::Url, HarnessError> {
        let parsed = url::Url::parse(&self.base_url).map_err(|e| {
            HarnessError::config(format!("invalid endpoint base_url '{}': {e}", self.base_url))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HarnessError::config(format!(
                "endpoint base_url '{}' must use http or https",
                self.base_url
            )));
        }
        Ok(parsed)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

/// Policy section: preset plus extra writable roots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Budget preset name.
    pub preset: PresetName,
    /// Additional glob patterns writes are allowed under.
    pub writable_paths: Vec<String>,
}

/// Named budget preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetName {
    /// Tight budgets for untrusted goals.
    Safe,
    /// Generous budgets, bounded commits.
    #[default]
    Balanced,
    /// No budgets.
    Full,
}

/// Tool execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Default shell timeout in seconds.
    pub shell_timeout_secs: u64,
    /// Command used by `run_tests`; auto-detected from marker files when unset.
    pub test_command: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 30,
            test_command: None,
        }
    }
}

/// How an external agent receives its prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVia {
    /// Written to the child's stdin.
    #[default]
    Stdin,
    /// Appended as the final positional argument.
    Arg,
}

/// Invocation recipe for one external command-line coder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCommand {
    /// Executable name, resolved via `PATH`.
    pub command: String,
    /// Fixed arguments preceding the prompt.
    pub args: Vec<String>,
    /// Prompt delivery mode.
    pub prompt_via: PromptVia,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            prompt_via: PromptVia::Stdin,
        }
    }
}

/// External agent roster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// The `claude_code` agent.
    pub claude_code: AgentCommand,
    /// The `codex` agent.
    pub codex: AgentCommand,
    /// The `gemini_cli` agent.
    pub gemini_cli: AgentCommand,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            claude_code: AgentCommand {
                command: "claude".to_string(),
                args: vec!["-p".to_string()],
                prompt_via: PromptVia::Arg,
            },
            codex: AgentCommand {
                command: "codex".to_string(),
                args: vec!["exec".to_string()],
                prompt_via: PromptVia::Stdin,
            },
            gemini_cli: AgentCommand {
                command: "gemini".to_string(),
                args: vec!["-p".to_string()],
                prompt_via: PromptVia::Arg,
            },
        }
    }
}

/// Context budgeting knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// The model's context window in tokens.
    pub model_max_tokens: usize,
    /// Fraction of the window handed to `build_messages`.
    pub budget_fraction: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            model_max_tokens: 32_768,
            budget_fraction: 0.75,
        }
    }
}

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// LM endpoint settings.
    pub endpoint: EndpointConfig,
    /// Tier → model table.
    pub model_tiers: TierTable,
    /// Default tier for new goals.
    pub tier: Option<Tier>,
    /// Policy preset and writable paths.
    pub policy: PolicyConfig,
    /// Tool execution settings.
    pub tools: ToolsConfig,
    /// External agent commands.
    pub agents: AgentsConfig,
    /// Context budgeting.
    pub context: ContextConfig,
    /// Compensation pipeline retry ceiling.
    pub max_retries: Option<usize>,
}

impl HarnessConfig {
    /// Load a config file, failing on unreadable or invalid YAML.
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::config(format!("cannot read {}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| HarnessError::config(format!("invalid config {}: {e}", path.display())))
    }

    /// Discover and load configuration.
    ///
    /// Precedence: `explicit` path (an error if missing) > `./open_harness.yaml`
    /// > `~/.open_harness/open_harness.yaml` > defaults, with `config.yaml`
    /// accepted beside each preferred basename.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, HarnessError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        for candidate in Self::candidate_paths() {
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "loading config");
                return Self::load(&candidate);
            }
        }
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_BASENAME), PathBuf::from(LEGACY_BASENAME)];
        if let Some(home) = dirs::home_dir() {
            let dir = home.join(HARNESS_DIR);
            paths.push(dir.join(CONFIG_BASENAME));
            paths.push(dir.join(LEGACY_BASENAME));
        }
        paths
    }

    /// Default tier for new goals.
    #[must_use]
    pub fn default_tier(&self) -> Tier {
        self.tier.unwrap_or(Tier::Small)
    }

    /// Compensation retry ceiling (default 3).
    #[must_use]
    pub fn retry_limit(&self) -> usize {
        self.max_retries.unwrap_or(3)
    }

    /// Token budget handed to the context store each turn.
    #[must_use]
    pub fn context_budget(&self) -> usize {
        (self.context.model_max_tokens as f64 * self.context.budget_fraction) as usize
    }
}

/// The harness state directory (`~/.open_harness`), created on demand.
pub fn harness_home() -> Result<PathBuf, HarnessError> {
    let home = dirs::home_dir()
        .ok_or_else(|| HarnessError::config("cannot determine home directory"))?;
    let dir = home.join(HARNESS_DIR);
    if !dir.is_dir() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| HarnessError::config(format!("cannot create {}: {e}", dir.display())))?;
    }
    Ok(dir)
}

/// Path of the task database.
pub fn tasks_db_path() -> Result<PathBuf, HarnessError> {
    Ok(harness_home()?.join("tasks.db"))
}

/// Directory for per-task log files, created on demand.
pub fn logs_dir() -> Result<PathBuf, HarnessError> {
    let dir = harness_home()?.join("logs");
    if !dir.is_dir() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| HarnessError::config(format!("cannot create {}: {e}", dir.display())))?;
    }
    Ok(dir)
}

/// Path of the project-memory database (owned by an external collaborator).
/// Probed read-only, so nothing is created here.
pub fn memory_db_path() -> Result<PathBuf, HarnessError> {
    let home = dirs::home_dir()
        .ok_or_else(|| HarnessError::config("cannot determine home directory"))?;
    Ok(home.join(HARNESS_DIR).join("memory.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_from_empty_yaml() {
        let config: HarnessConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.endpoint.request_timeout_secs, 120);
        assert_eq!(config.policy.preset, PresetName::Balanced);
        assert_eq!(config.retry_limit(), 3);
    }

    #[test]
    fn test_partial_file_overrides_one_section() {
        let yaml = r"
model_tiers:
  small: llama3.2:3b
tier: medium
";
        let config: HarnessConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model_tiers.resolve(Tier::Small), "llama3.2:3b");
        // Unset fields keep their defaults.
        assert_eq!(config.model_tiers.resolve(Tier::Large), "qwen2.5-coder:32b");
        assert_eq!(config.default_tier(), Tier::Medium);
    }

    #[test]
    fn test_tier_escalation_tops_out() {
        assert_eq!(Tier::Small.escalated(), Some(Tier::Medium));
        assert_eq!(Tier::Medium.escalated(), Some(Tier::Large));
        assert_eq!(Tier::Large.escalated(), None);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let err = HarnessConfig::load(Path::new("/nonexistent/open_harness.yaml")).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_context_budget_fraction() {
        let config = HarnessConfig::default();
        assert_eq!(config.context_budget(), 24_576);
    }

    #[test]
    fn test_default_endpoint_url_is_valid() {
        let endpoint = EndpointConfig::default();
        let parsed = endpoint.parsed_base_url().unwrap();
        assert_eq!(parsed.scheme(), "http");
        assert_eq!(parsed.port(), Some(11434));
    }

    #[test]
    fn test_malformed_endpoint_url_is_a_config_error() {
        let endpoint = EndpointConfig {
            base_url: "not a url".to_string(),
            ..EndpointConfig::default()
        };
        assert!(matches!(
            endpoint.parsed_base_url(),
            Err(HarnessError::Config(_))
        ));

        let endpoint = EndpointConfig {
            base_url: "ftp://models.example/v1".to_string(),
            ..EndpointConfig::default()
        };
        let err = endpoint.parsed_base_url().unwrap_err();
        assert!(err.to_string().contains("http"));
    }
}
