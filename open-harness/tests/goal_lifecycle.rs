//! End-to-end goal lifecycle tests against a scripted chat backend and a
//! real temporary git workspace.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use open_harness::llm::{ChatBackend, ChatRequest, LmError, LmResponse, RawToolCall};
use open_harness::{Event, EventBus, GoalStatus, HarnessConfig, Orchestrator};

/// Backend that pops scripted responses; empty script yields empty replies.
struct ScriptedBackend {
    script: Mutex<Vec<LmResponse>>,
}

impl ScriptedBackend {
    fn new(script: Vec<LmResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }
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
            Ok(LmResponse::default())
        } else {
            Ok(script.remove(0))
        }
    }
}

fn text(reply: &str) -> LmResponse {
    LmResponse {
        assistant_text: reply.to_string(),
        ..LmResponse::default()
    }
}

fn tool_call(name: &str, arguments: &str) -> LmResponse {
    LmResponse {
        tool_calls: vec![RawToolCall {
            id: format!("c_{name}"),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
        ..LmResponse::default()
    }
}

fn git(root: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn seeded_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for args in [
        vec!["init", "-q", "-b", "main"],
        vec!["config", "user.email", "t@t"],
        vec!["config", "user.name", "t"],
    ] {
        assert!(Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(&args)
            .status()
            .unwrap()
            .success());
    }
    std::fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
    git(dir.path(), &["add", "-A"]);
    assert!(Command::new("git")
        .arg("-C")
        .arg(dir.path())
        .args(["commit", "-q", "-m", "seed"])
        .status()
        .unwrap()
        .success());
    dir
}

fn orchestrator(backend: Arc<ScriptedBackend>, root: &Path, bus: EventBus) -> Orchestrator {
    let config = Arc::new(HarnessConfig::default());
    let registry = Arc::new(open_harness::tools::ToolRegistry::builtin(&config));
    Orchestrator::new(
        config,
        backend,
        registry,
        bus,
        root.to_path_buf(),
        Arc::new(tokio::sync::Mutex::new(())),
    )
}

#[tokio::test]
async fn goal_succeeds_and_squashes_into_original_branch() {
    let repo = seeded_repo();
    let bus = EventBus::new();
    let mut events = bus.subscribe();

    let plan = r#"[
        {"title": "Write the module", "instruction": "create src/answer.txt with the answer",
         "success_criteria": ["file exists"]},
        {"title": "Check the result", "instruction": "verify the file content"}
    ]"#;
    let backend = ScriptedBackend::new(vec![
        text(plan),
        tool_call("write_file", r#"{"path": "src/answer.txt", "content": "42\n"}"#),
        text("wrote the file"),
        tool_call("read_file", r#"{"path": "src/answer.txt"}"#),
        text("verified: the file holds 42"),
    ]);

    let outcome = orchestrator(backend, repo.path(), bus)
        .run_goal("add an answer file", CancellationToken::new())
        .await;

    assert_eq!(outcome.status, GoalStatus::Succeeded, "{}", outcome.summary);
    assert!(outcome.summary.contains("verified"));
    assert_eq!(outcome.stats.tool_calls, 2);
    assert!(outcome
        .stats
        .files_modified
        .iter()
        .any(|f| f.contains("answer.txt")));

    // The work landed on the original branch via squash-merge.
    assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).trim(), "main");
    assert!(repo.path().join("src/answer.txt").exists());
    let branches = git(repo.path(), &["branch", "--list"]);
    assert!(!branches.contains("harness/goal-"), "work branch not deleted: {branches}");
    let status = git(repo.path(), &["status", "--porcelain"]);
    assert!(status.trim().is_empty(), "dirty after goal: {status}");

    // Lifecycle events arrived in order.
    let mut saw_started = false;
    let mut saw_step = false;
    let mut saw_completed = false;
    while let Some(event) = events.try_recv() {
        match event {
            Event::GoalStarted { .. } => saw_started = true,
            Event::PlanStepStarted { .. } => {
                assert!(saw_started);
                saw_step = true;
            }
            Event::GoalCompleted { .. } => {
                assert!(saw_step);
                saw_completed = true;
            }
            _ => {}
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn hard_failure_leaves_the_branch_exactly_as_it_started() {
    let repo = seeded_repo();
    let before = git(repo.path(), &["rev-parse", "HEAD"]);

    // A plausible plan, then nothing but empty replies: compensation
    // escalates once, exhausts, the step fails, direct execution also
    // exhausts, the goal fails hard.
    let backend = ScriptedBackend::new(vec![
        text(r#"[{"title": "Edit the file", "instruction": "edit README.md"}]"#),
        tool_call("write_file", r#"{"path": "scratch.txt", "content": "junk"}"#),
    ]);

    let outcome = orchestrator(backend, repo.path(), EventBus::new())
        .run_goal("do something", CancellationToken::new())
        .await;

    assert_eq!(outcome.status, GoalStatus::Failed, "{}", outcome.summary);
    assert!(outcome.summary.contains("Failure:"));

    // Checkpoint purity: back on the original branch, same commit, clean
    // tree, no junk file, no leftover harness branches.
    assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).trim(), "main");
    assert_eq!(git(repo.path(), &["rev-parse", "HEAD"]), before);
    assert!(!repo.path().join("scratch.txt").exists());
    let status = git(repo.path(), &["status", "--porcelain"]);
    assert!(status.trim().is_empty(), "dirty after failed goal: {status}");
    let branches = git(repo.path(), &["branch", "--list"]);
    assert!(!branches.contains("harness/goal-"));
}

#[tokio::test]
async fn rejected_plan_falls_back_to_direct_execution() {
    let repo = seeded_repo();

    // The planner returns prose that parses to nothing; the critic rejects
    // the empty plan and the goal still completes directly.
    let backend = ScriptedBackend::new(vec![
        text("I would suggest being careful here."),
        text("nothing to do, the workspace already looks correct"),
    ]);

    let outcome = orchestrator(backend, repo.path(), EventBus::new())
        .run_goal("tidy up", CancellationToken::new())
        .await;

    assert_eq!(outcome.status, GoalStatus::Succeeded, "{}", outcome.summary);
    assert!(outcome.summary.contains("already looks correct"));
}

#[tokio::test]
async fn cancellation_surfaces_as_cancelled() {
    let repo = seeded_repo();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let backend = ScriptedBackend::new(vec![text(
        r#"[{"title": "Edit the file", "instruction": "edit README.md"}]"#,
    )]);

    let outcome = orchestrator(backend, repo.path(), EventBus::new())
        .run_goal("do something", cancel)
        .await;
    assert_eq!(outcome.status, GoalStatus::Cancelled);
}
