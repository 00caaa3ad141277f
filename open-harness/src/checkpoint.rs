//! Checkpoint manager: stash, branch, snapshot, rollback, squash.
//!
//! Wraps the versioned workspace for the lifetime of one goal. The user's
//! branch is never modified except by the final squash-merge on success.
//! A workspace that cannot be made into a repository downgrades the manager
//! to disabled: every operation becomes a no-op and execution continues.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::message::epoch_secs;

/// Deadline for any single git operation.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Snapshot cadence in write/edit tool invocations.
const WRITES_PER_SNAPSHOT: u32 = 10;
/// Stash label marking harness-owned stashes.
const STASH_LABEL: &str = "open-harness: pre-goal stash";

/// Errors from the checkpoint layer.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A git operation failed.
    #[error("git {op} failed: {message}")]
    Git {
        /// The git subcommand.
        op: String,
        /// Captured stderr/stdout.
        message: String,
    },
}

/// One committed snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Commit id.
    pub commit: String,
    /// What the snapshot was taken after.
    pub description: String,
}

/// Per-goal checkpoint state over the workspace repository.
#[derive(Debug)]
pub struct CheckpointManager {
    root: PathBuf,
    bus: EventBus,
    enabled: bool,
    original_branch: Option<String>,
    work_branch: Option<String>,
    stashed: bool,
    snapshots: Vec<Snapshot>,
    write_count: u32,
    rollbacks: u32,
}

impl CheckpointManager {
    /// Enter the checkpoint lifecycle for a goal.
    ///
    /// Initializes the repository when the workspace has none; stashes
    /// uncommitted changes under a harness label; creates and switches to
    /// `harness/goal-<epoch>`. Initialization failure downgrades to a
    /// disabled manager rather than failing the goal.
    pub async fn enter(root: &Path, bus: EventBus) -> Self {
        let mut manager = Self {
            root: root.to_path_buf(),
            bus,
            enabled: true,
            original_branch: None,
            work_branch: None,
            stashed: false,
            snapshots: Vec::new(),
            write_count: 0,
            rollbacks: 0,
        };

        if let Err(e) = manager.prepare().await {
            warn!(error = %e, "checkpointing disabled for this goal");
            manager.enabled = false;
        }
        manager
    }

    async fn prepare(&mut self) -> Result<(), CheckpointError> {
        if self.git(&["rev-parse", "--git-dir"]).await.is_err() {
            info!(root = %self.root.display(), "initializing workspace repository");
            self.git(&["init", "-q"]).await?;
            self.ensure_identity().await;
            self.git(&["add", "-A"]).await?;
            self.git(&["commit", "-q", "--allow-empty", "-m", "initial commit"])
                .await?;
        } else {
            self.ensure_identity().await;
            // An existing repo may carry uncommitted work; park it.
            let status = self.git(&["status", "--porcelain"]).await?;
            if !status.trim().is_empty() {
                self.git(&["stash", "push", "-u", "-m", STASH_LABEL]).await?;
                self.stashed = true;
                debug!("stashed uncommitted changes");
            }
        }

        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let branch = branch.trim().to_string();
        self.original_branch = Some(if branch == "HEAD" {
            // Detached head: remember the commit itself.
            self.git(&["rev-parse", "HEAD"]).await?.trim().to_string()
        } else {
            branch
        });

        let work = format!("harness/goal-{}", epoch_secs());
        self.git(&["checkout", "-q", "-b", &work]).await?;
        self.work_branch = Some(work);

        let baseline = self.head().await?;
        self.snapshots.push(Snapshot {
            commit: baseline,
            description: "goal start".to_string(),
        });
        Ok(())
    }

    /// Commit identity may be absent in fresh containers; set a local one.
    async fn ensure_identity(&self) {
        if self.git(&["config", "user.email"]).await.is_err() {
            let _ = self.git(&["config", "user.email", "harness@localhost"]).await;
            let _ = self.git(&["config", "user.name", "open-harness"]).await;
        }
    }

    /// Whether checkpointing is active for this goal.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshots taken so far, the baseline included.
    #[must_use]
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Rollbacks performed so far.
    #[must_use]
    pub const fn rollbacks(&self) -> u32 {
        self.rollbacks
    }

    /// Record one write/edit invocation; snapshots every tenth.
    pub async fn note_write(&mut self) {
        self.write_count += 1;
        if self.write_count % WRITES_PER_SNAPSHOT == 0 {
            let description = format!("after {} writes", self.write_count);
            if let Err(e) = self.snapshot(&description).await {
                warn!(error = %e, "periodic snapshot failed");
            }
        }
    }

    /// Commit the workspace as a snapshot. Skips fast when nothing changed
    /// (a no-op step does not advance the snapshot pointer).
    pub async fn snapshot(&mut self, description: &str) -> Result<Option<String>, CheckpointError> {
        if !self.enabled {
            return Ok(None);
        }
        self.git(&["add", "-A"]).await?;
        if self.git_status(&["diff", "--cached", "--quiet", "HEAD"]).await {
            debug!(description, "no changes, snapshot skipped");
            return Ok(None);
        }
        let message = format!("harness: {description}");
        self.git(&["commit", "-q", "-m", &message]).await?;
        let commit = self.head().await?;
        info!(%commit, description, "snapshot taken");
        self.bus.emit(Event::CheckpointTaken {
            snapshot: commit.clone(),
            description: description.to_string(),
        });
        self.snapshots.push(Snapshot {
            commit: commit.clone(),
            description: description.to_string(),
        });
        Ok(Some(commit))
    }

    /// Hard-reset the work branch to the most recent snapshot.
    pub async fn rollback_last(&mut self) -> Result<Option<String>, CheckpointError> {
        let target = self.snapshots.last().map(|s| s.commit.clone());
        self.rollback_to_commit(target).await
    }

    /// Hard-reset the work branch all the way to the goal-start baseline.
    pub async fn rollback_all(&mut self) -> Result<Option<String>, CheckpointError> {
        let target = self.snapshots.first().map(|s| s.commit.clone());
        let result = self.rollback_to_commit(target).await;
        self.snapshots.truncate(1);
        result
    }

    async fn rollback_to_commit(
        &mut self,
        target: Option<String>,
    ) -> Result<Option<String>, CheckpointError> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(commit) = target else {
            return Ok(None);
        };
        self.git(&["reset", "--hard", "-q", &commit]).await?;
        // Anything untracked at this point is harness-created: the user's
        // uncommitted work was stashed with -u at enter.
        self.git(&["clean", "-fdq"]).await?;
        self.rollbacks += 1;
        info!(%commit, "rolled back");
        self.bus.emit(Event::CheckpointRolledBack {
            snapshot: commit.clone(),
        });
        Ok(Some(commit))
    }

    /// Finish the goal successfully: squash-merge the work branch into the
    /// original branch, delete the work branch, pop the stash.
    pub async fn commit(&mut self, goal: &str) -> Result<(), CheckpointError> {
        if !self.enabled {
            return Ok(());
        }
        // Capture any trailing uncommitted work first.
        self.snapshot("goal end").await?;

        let (Some(original), Some(work)) = (self.original_branch.clone(), self.work_branch.clone())
        else {
            return Ok(());
        };
        self.git(&["checkout", "-q", &original]).await?;
        self.git(&["merge", "--squash", "-q", &work]).await?;
        if !self.git_status(&["diff", "--cached", "--quiet", "HEAD"]).await {
            let message = format!("open-harness: {goal}");
            self.git(&["commit", "-q", "-m", &message]).await?;
        }
        self.git(&["branch", "-D", &work]).await?;
        self.restore_stash().await;
        info!(branch = %original, "goal squash-merged");
        Ok(())
    }

    /// Abandon the goal: return to the original branch, discard the work
    /// branch, pop the stash. The user's branch ends diff-identical to its
    /// state at goal start.
    pub async fn abandon(&mut self) -> Result<(), CheckpointError> {
        if !self.enabled {
            return Ok(());
        }
        // Clear any half-finished work so checkout cannot fail.
        self.git(&["reset", "--hard", "-q"]).await?;
        self.git(&["clean", "-fdq"]).await?;
        let (Some(original), Some(work)) = (self.original_branch.clone(), self.work_branch.clone())
        else {
            return Ok(());
        };
        self.git(&["checkout", "-q", &original]).await?;
        self.git(&["branch", "-D", &work]).await?;
        self.restore_stash().await;
        info!(branch = %original, "goal abandoned, work branch discarded");
        Ok(())
    }

    async fn restore_stash(&mut self) {
        if self.stashed {
            if let Err(e) = self.git(&["stash", "pop"]).await {
                warn!(error = %e, "stash pop failed; changes remain stashed");
            }
            self.stashed = false;
        }
    }

    async fn head(&self) -> Result<String, CheckpointError> {
        Ok(self.git(&["rev-parse", "--short", "HEAD"]).await?.trim().to_string())
    }

    /// Run one git command; non-zero exit is an error carrying the output.
    async fn git(&self, args: &[&str]) -> Result<String, CheckpointError> {
        let op = args.first().copied().unwrap_or("").to_string();
        let run = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .output();
        let output = tokio::time::timeout(GIT_TIMEOUT, run)
            .await
            .map_err(|_| CheckpointError::Git {
                op: op.clone(),
                message: "timed out".to_string(),
            })?
            .map_err(|e| CheckpointError::Git {
                op: op.clone(),
                message: e.to_string(),
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let mut message = String::from_utf8_lossy(&output.stderr).into_owned();
            if message.trim().is_empty() {
                message = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            Err(CheckpointError::Git {
                op,
                message: message.trim().to_string(),
            })
        }
    }

    /// Run a git command where the exit code is the answer.
    async fn git_status(&self, args: &[&str]) -> bool {
        self.git(args).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(root: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
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
            assert!(StdCommand::new("git")
                .arg("-C")
                .arg(dir.path())
                .args(&args)
                .status()
                .unwrap()
                .success());
        }
        std::fs::write(dir.path().join("seed.txt"), "seed").unwrap();
        assert!(StdCommand::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["add", "-A"])
            .status()
            .unwrap()
            .success());
        assert!(StdCommand::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["commit", "-q", "-m", "seed"])
            .status()
            .unwrap()
            .success());
        dir
    }

    #[tokio::test]
    async fn test_enter_creates_work_branch() {
        let dir = seeded_repo();
        let manager = CheckpointManager::enter(dir.path(), EventBus::new()).await;
        assert!(manager.is_enabled());
        let head = run_git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
        assert!(head.trim().starts_with("harness/goal-"), "got {head}");
        assert_eq!(manager.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_enter_initializes_bare_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        let manager = CheckpointManager::enter(dir.path(), EventBus::new()).await;
        assert!(manager.is_enabled());
        assert!(dir.path().join(".git").is_dir());
    }

    #[tokio::test]
    async fn test_snapshot_skips_when_clean() {
        let dir = seeded_repo();
        let mut manager = CheckpointManager::enter(dir.path(), EventBus::new()).await;
        assert!(manager.snapshot("noop step").await.unwrap().is_none());
        assert_eq!(manager.snapshots().len(), 1);

        std::fs::write(dir.path().join("new.txt"), "content").unwrap();
        assert!(manager.snapshot("wrote new.txt").await.unwrap().is_some());
        assert_eq!(manager.snapshots().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot_state() {
        let dir = seeded_repo();
        let mut manager = CheckpointManager::enter(dir.path(), EventBus::new()).await;

        std::fs::write(dir.path().join("a.txt"), "A").unwrap();
        manager.snapshot("file A").await.unwrap();
        std::fs::write(dir.path().join("b.txt"), "B").unwrap();
        manager.snapshot("file B").await.unwrap();

        std::fs::write(dir.path().join("junk.txt"), "junk").unwrap();
        run_git(dir.path(), &["add", "-A"]);
        manager.rollback_last().await.unwrap();

        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());
        assert!(!dir.path().join("junk.txt").exists());
        assert_eq!(manager.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_commit_squashes_into_original_branch() {
        let dir = seeded_repo();
        let mut manager = CheckpointManager::enter(dir.path(), EventBus::new()).await;

        std::fs::write(dir.path().join("feature.txt"), "done").unwrap();
        manager.snapshot("feature file").await.unwrap();
        manager.commit("add feature").await.unwrap();

        let head = run_git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
        assert_eq!(head.trim(), "main");
        assert!(dir.path().join("feature.txt").exists());
        // One squashed commit on top of the seed.
        let log = run_git(dir.path(), &["log", "--oneline"]);
        assert_eq!(log.lines().count(), 2);
        // Work branch is gone.
        let branches = run_git(dir.path(), &["branch", "--list"]);
        assert!(!branches.contains("harness/goal-"));
    }

    #[tokio::test]
    async fn test_abandon_leaves_original_branch_untouched() {
        let dir = seeded_repo();
        let before = run_git(dir.path(), &["rev-parse", "HEAD"]);
        let mut manager = CheckpointManager::enter(dir.path(), EventBus::new()).await;

        std::fs::write(dir.path().join("scratch.txt"), "scratch").unwrap();
        manager.snapshot("scratch work").await.unwrap();
        manager.abandon().await.unwrap();

        let head = run_git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
        assert_eq!(head.trim(), "main");
        let after = run_git(dir.path(), &["rev-parse", "HEAD"]);
        assert_eq!(before, after);
        assert!(!dir.path().join("scratch.txt").exists());
        let status = run_git(dir.path(), &["status", "--porcelain"]);
        assert!(status.trim().is_empty());
    }

    #[tokio::test]
    async fn test_stash_round_trip() {
        let dir = seeded_repo();
        std::fs::write(dir.path().join("seed.txt"), "uncommitted edit").unwrap();
        let mut manager = CheckpointManager::enter(dir.path(), EventBus::new()).await;
        // The dirty edit was stashed before branching.
        let content = std::fs::read_to_string(dir.path().join("seed.txt")).unwrap();
        assert_eq!(content, "seed");

        manager.abandon().await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("seed.txt")).unwrap();
        assert_eq!(content, "uncommitted edit");
    }
}
