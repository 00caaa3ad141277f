//! Shell execution: the `shell` tool, `run_tests`, and the shared
//! subprocess runner used by the git tools and external agents.
//!
//! Commands run via `sh -c` with a deadline. On timeout or cancellation the
//! child receives SIGTERM, then SIGKILL after a two-second grace period.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Tool, ToolContext, ToolDescriptor, ToolError, descriptors};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Outer cap on `run_tests`.
const RUN_TESTS_CAP: Duration = Duration::from_secs(10 * 60);

/// Output of one shell invocation.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// Whether the command exited zero.
    pub ok: bool,
    /// Combined stdout + stderr, lossily decoded.
    pub combined: String,
    /// Exit code when the process exited normally.
    pub exit_code: Option<i32>,
}

/// Shell tools.
pub(super) fn all() -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(Shell), Arc::new(RunTests)]
}

fn descriptor_for(name: &str) -> ToolDescriptor {
    descriptors()
        .into_iter()
        .find(|d| d.name == name)
        .expect("built-in descriptor exists")
}

/// Run `command` via the OS shell under `cwd`, bounded by `timeout`.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ShellOutput, ToolError> {
    debug!(command, cwd = %cwd.display(), "spawning shell");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::Subprocess(format!("spawn failed: {e}")))?;

    collect_child(&mut child, timeout, cancel).await
}

/// Wait for `child` while draining its pipes, enforcing the deadline and the
/// cancel token.
pub(super) async fn collect_child(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ShellOutput, ToolError> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    enum Outcome {
        Done(std::io::Result<std::process::ExitStatus>, Vec<u8>, Vec<u8>),
        TimedOut,
        Cancelled,
    }

    // The waiting future borrows the child; terminate only after the select
    // block has released that borrow.
    let outcome = {
        let drain = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(pipe) = stdout.as_mut() {
                let _ = pipe.read_to_end(&mut out).await;
            }
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_end(&mut err).await;
            }
            (out, err)
        };
        tokio::select! {
            (status, (out, err)) = async { tokio::join!(child.wait(), drain) } => {
                Outcome::Done(status, out, err)
            }
            () = tokio::time::sleep(timeout) => Outcome::TimedOut,
            () = cancel.cancelled() => Outcome::Cancelled,
        }
    };

    match outcome {
        Outcome::Done(status, out, err) => {
            let status = status.map_err(|e| ToolError::Subprocess(format!("wait failed: {e}")))?;
            let mut combined = String::from_utf8_lossy(&out).into_owned();
            if !err.is_empty() {
                if !combined.is_empty() && !combined.ends_with('\n') {
                    combined.push('\n');
                }
                combined.push_str(&String::from_utf8_lossy(&err));
            }
            Ok(ShellOutput {
                ok: status.success(),
                combined,
                exit_code: status.code(),
            })
        }
        Outcome::TimedOut => {
            warn!(secs = timeout.as_secs(), "shell timed out, terminating");
            terminate(child).await;
            Err(ToolError::Timeout { secs: timeout.as_secs() })
        }
        Outcome::Cancelled => {
            terminate(child).await;
            Err(ToolError::Cancelled)
        }
    }
}

/// SIGTERM, two-second grace, then SIGKILL.
#[allow(unsafe_code)]
pub(super) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to a child we own.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

struct Shell;

#[async_trait]
impl Tool for Shell {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("shell")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'command'".into()))?;
        let timeout = args
            .get("timeout")
            .and_then(Value::as_u64)
            .map_or(ctx.shell_timeout, Duration::from_secs);

        let output = run_shell(command, &ctx.root, timeout, &ctx.cancel).await?;
        if output.ok {
            Ok(output.combined)
        } else {
            Err(ToolError::Subprocess(format!(
                "exit code {}: {}",
                output.exit_code.map_or("signal".to_string(), |c| c.to_string()),
                output.combined
            )))
        }
    }
}

struct RunTests;

#[async_trait]
impl Tool for RunTests {
    fn descriptor(&self) -> ToolDescriptor {
        descriptor_for("run_tests")
    }

    async fn call(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<String, ToolError> {
        let command = test_command(ctx)?;
        let full = match args.get("target").and_then(Value::as_str) {
            Some(target) if !target.trim().is_empty() => format!("{command} {target}"),
            _ => command,
        };
        let output = run_shell(&full, &ctx.root, RUN_TESTS_CAP, &ctx.cancel).await?;
        if output.ok {
            Ok(output.combined)
        } else {
            Err(ToolError::Subprocess(format!(
                "tests failed (exit {}):\n{}",
                output.exit_code.map_or("signal".to_string(), |c| c.to_string()),
                output.combined
            )))
        }
    }
}

/// The configured test command, or a marker-file guess.
fn test_command(ctx: &ToolContext) -> Result<String, ToolError> {
    if let Some(command) = &ctx.test_command {
        return Ok(command.clone());
    }
    for (marker, command) in [
        ("Cargo.toml", "cargo test"),
        ("package.json", "npm test"),
        ("pyproject.toml", "pytest"),
        ("pytest.ini", "pytest"),
    ] {
        if ctx.root.join(marker).is_file() {
            return Ok(command.to_string());
        }
    }
    Err(ToolError::InvalidInput(
        "no test command configured and no project marker file found".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: &Path) -> ToolContext {
        ToolContext {
            root: root.to_path_buf(),
            shell_timeout: Duration::from_secs(30),
            test_command: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_shell_captures_combined_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell(
            "echo out; echo err >&2",
            dir.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.ok);
        assert!(out.combined.contains("out"));
        assert!(out.combined.contains("err"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_ok() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell(
            "echo boom; exit 3",
            dir.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!out.ok);
        assert_eq!(out.exit_code, Some(3));
        assert!(out.combined.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = run_shell(
            "sleep 30",
            dir.path(),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = run_shell("sleep 30", dir.path(), Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn test_test_command_detection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(test_command(&ctx(dir.path())).unwrap(), "cargo test");

        let empty = tempfile::tempdir().unwrap();
        assert!(test_command(&ctx(empty.path())).is_err());

        let mut configured = ctx(empty.path());
        configured.test_command = Some("make check".into());
        assert_eq!(test_command(&configured).unwrap(), "make check");
    }
}
