//! Git tools: status, diff, commit, branch, log.
//!
//! All of them shell out to the `git` binary with `-C <root>`, the same
//! plumbing the checkpoint manager uses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolContext, ToolDescriptor, ToolError, descriptors, run_shell};

/// Deadline for git plumbing commands.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// All git tools.
pub(super) fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(GitStatus),
        Arc::new(GitDiff),
        Arc::new(GitCommit),
        Arc::new(GitBranch),
        Arc::new(GitLog),
    ]
}

fn descriptor_for(name: &str) -> ToolDescriptor {
    descriptors()
        .into_iter()
        .find(|d| d.name == name)
        .expect("built-in descriptor exists")
}

/// Run one git command under the project root and return stdout+stderr.
async fn git(
    ctx: &ToolContext,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<String, ToolError> {
    let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    let command = format!("git {}", quoted.join(" "));
    let output = run_shell(&command, &ctx.root, GIT_TIMEOUT, cancel).await?;
    if output.ok {
        Ok(output.combined)
    } else {
        Err(ToolError::Subprocess(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or(""),
            output.combined.trim()
        )))
    }
}

/// Single-quote an argument for `sh -c`.
fn shell_quote(arg: &str) -> String {
    if arg
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | '@'))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

struct GitStatus;

#[async_trait]
impl Tool for GitStatus {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("git_status")
    }

    async fn call(&self, _args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let out = git(ctx, &["status", "--short", "--branch"], &ctx.cancel).await?;
        Ok(if out.trim().is_empty() { "clean".to_string() } else { out })
    }
}

struct GitDiff;

#[async_trait]
impl Tool for GitDiff {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("git_diff")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let staged = args.get("staged").and_then(Value::as_bool).unwrap_or(false);
        let out = if staged {
            git(ctx, &["diff", "--cached"], &ctx.cancel).await?
        } else {
            git(ctx, &["diff"], &ctx.cancel).await?
        };
        Ok(if out.trim().is_empty() { "no changes".to_string() } else { out })
    }
}

struct GitCommit;

#[async_trait]
impl Tool for GitCommit {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("git_commit")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'message'".into()))?;

        match args.get("paths").and_then(Value::as_str) {
            Some(paths) if !paths.trim().is_empty() => {
                let mut add = vec!["add", "--"];
                add.extend(paths.split_whitespace());
                git(ctx, &add, &ctx.cancel).await?;
            }
            _ => {
                git(ctx, &["add", "-A"], &ctx.cancel).await?;
            }
        }
        git(ctx, &["commit", "-m", message], &ctx.cancel).await?;
        let head = git(ctx, &["rev-parse", "--short", "HEAD"], &ctx.cancel).await?;
        Ok(format!("committed {}", head.trim()))
    }
}

struct GitBranch;

#[async_trait]
impl Tool for GitBranch {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("git_branch")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let name = args.get("name").and_then(Value::as_str);
        let action = args.get("action").and_then(Value::as_str).unwrap_or("list");

        match (action, name) {
            ("list", _) => git(ctx, &["branch", "--list"], &ctx.cancel).await,
            ("create", Some(name)) => {
                git(ctx, &["checkout", "-b", name], &ctx.cancel).await?;
                Ok(format!("created and switched to '{name}'"))
            }
            ("switch", Some(name)) => {
                git(ctx, &["checkout", name], &ctx.cancel).await?;
                Ok(format!("switched to '{name}'"))
            }
            ("delete", Some(name)) => {
                git(ctx, &["branch", "-D", name], &ctx.cancel).await?;
                Ok(format!("deleted '{name}'"))
            }
            (action, None) => Err(ToolError::InvalidInput(format!(
                "action '{action}' requires 'name'"
            ))),
            (action, _) => Err(ToolError::InvalidInput(format!(
                "unknown action '{action}' (expected list, create, switch or delete)"
            ))),
        }
    }
}

struct GitLog;

#[async_trait]
impl Tool for GitLog {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("git_log")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(10).min(100);
        let count_arg = count.to_string();
        git(ctx, &["log", "--oneline", "-n", &count_arg], &ctx.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command;

    fn ctx(root: &Path) -> ToolContext {
        ToolContext {
            root: root.to_path_buf(),
            shell_timeout: Duration::from_secs(30),
            test_command: None,
            cancel: CancellationToken::new(),
        }
    }

    fn init_repo(root: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "harness@test"],
            vec!["config", "user.name", "harness"],
        ] {
            assert!(Command::new("git")
                .arg("-C")
                .arg(root)
                .args(&args)
                .status()
                .unwrap()
                .success());
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simple-arg"), "simple-arg");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_status_commit_log_cycle() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let ctx = ctx(dir.path());

        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let status = GitStatus.call(&Map::new(), &ctx).await.unwrap();
        assert!(status.contains("a.txt"));

        let mut args = Map::new();
        args.insert("message".into(), Value::String("add a".into()));
        let commit = GitCommit.call(&args, &ctx).await.unwrap();
        assert!(commit.starts_with("committed "));

        let log = GitLog.call(&Map::new(), &ctx).await.unwrap();
        assert!(log.contains("add a"));

        let status = GitStatus.call(&Map::new(), &ctx).await.unwrap();
        assert_eq!(status, "clean");
    }

    #[tokio::test]
    async fn test_branch_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let ctx = ctx(dir.path());
        let mut commit_args = Map::new();
        commit_args.insert("message".into(), Value::String("seed".into()));
        GitCommit.call(&commit_args, &ctx).await.unwrap();

        let mut args = Map::new();
        args.insert("name".into(), Value::String("feature-x".into()));
        args.insert("action".into(), Value::String("create".into()));
        GitBranch.call(&args, &ctx).await.unwrap();

        let list = GitBranch.call(&Map::new(), &ctx).await.unwrap();
        assert!(list.contains("feature-x"));
    }
}
