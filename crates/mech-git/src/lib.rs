// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-git
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Git helpers for coding jobs. Every invocation is argument-array based
//! (no shell interpolation), runs under a per-operation timeout, and only
//! touches remotes that pass the GitHub allowlist.

/// Remote URL validation.
pub mod remote;

use mech_core::FaultKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Per-operation timeouts.
const CLONE_TIMEOUT: Duration = Duration::from_secs(600);
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest commit subject we will generate.
const MAX_SUBJECT: usize = 72;

/// Git sub-pipeline failures.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// The remote URL failed the allowlist.
    #[error("unsafe clone url: {0}")]
    UnsafeRemote(String),
    /// A git command exceeded its timeout.
    #[error("git {op} timed out after {secs}s")]
    Timeout {
        /// Operation name.
        op: &'static str,
        /// Timeout that elapsed.
        secs: u64,
    },
    /// A git command exited non-zero.
    #[error("git {op} failed (code {code:?}): {stderr}")]
    Command {
        /// Operation name.
        op: &'static str,
        /// Exit code, when the process was not killed.
        code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },
    /// Push rejected and the rebase recovery could not complete.
    #[error("non-fast-forward push could not be recovered")]
    NonFastForward,
    /// Spawning git failed.
    #[error("git io: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Map to the worker-wide fault taxonomy.
    #[must_use]
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::UnsafeRemote(_) => FaultKind::UnsafeCloneUrl,
            Self::NonFastForward => FaultKind::NonFastForward,
            _ => FaultKind::Unknown,
        }
    }
}

/// Derive the working branch for a job definition: `job/<id>[-<slug>]`.
#[must_use]
pub fn job_branch_name(job_definition_id: &str, slug: Option<&str>) -> String {
    match slug.map(slugify).filter(|s| !s.is_empty()) {
        Some(slug) => format!("job/{job_definition_id}-{slug}"),
        None => format!("job/{job_definition_id}"),
    }
}

fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars().take(48) {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Derive a commit subject from an execution summary: the first non-empty
/// bullet (or line), clipped to 72 characters, with a synthetic fallback.
#[must_use]
pub fn commit_subject(summary: &str) -> String {
    let line = summary
        .lines()
        .map(|l| {
            l.trim()
                .trim_start_matches(['-', '*', '•'])
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
                .trim()
        })
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.is_empty() {
        return "automated job update".to_string();
    }
    let mut subject: String = line.chars().take(MAX_SUBJECT).collect();
    if line.chars().count() > MAX_SUBJECT {
        subject.truncate(subject.len().saturating_sub(1));
        subject.push('…');
    }
    subject
}

/// A repository working directory plus the git plumbing around it.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

/// Output of a successful push, for delivery payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Branch that was pushed.
    pub branch: String,
    /// `true` when the first push was rejected and a rebase recovered it.
    pub rebased: bool,
}

impl GitRepo {
    /// Wrap an existing working directory.
    #[must_use]
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The working directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clone the repository if the directory has no checkout, otherwise
    /// fetch. The URL must pass the allowlist first.
    pub async fn clone_or_fetch(
        url: &str,
        dir: impl Into<PathBuf>,
        ssh_alias: Option<&str>,
    ) -> Result<Self, GitError> {
        let url = remote::validate_remote_url(url, ssh_alias)?;
        let dir = dir.into();
        if dir.join(".git").exists() {
            let repo = Self { dir };
            repo.fetch().await?;
            return Ok(repo);
        }
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(target: "mech.git", %url, dir = %dir.display(), "cloning");
        run_git_in(
            dir.parent().unwrap_or(Path::new(".")),
            "clone",
            &[
                "clone",
                &url,
                dir.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("workspace"),
            ],
            CLONE_TIMEOUT,
        )
        .await?;
        Ok(Self { dir })
    }

    /// `git fetch origin`.
    pub async fn fetch(&self) -> Result<(), GitError> {
        self.run("fetch", &["fetch", "origin", "--prune"], FETCH_TIMEOUT)
            .await
            .map(drop)
    }

    /// Current HEAD commit hash.
    pub async fn head_commit(&self) -> Result<String, GitError> {
        let out = self
            .run("rev-parse", &["rev-parse", "HEAD"], STATUS_TIMEOUT)
            .await?;
        Ok(out.trim().to_string())
    }

    /// Porcelain v1 status output.
    pub async fn status(&self) -> Result<String, GitError> {
        self.run("status", &["status", "--porcelain=v1"], STATUS_TIMEOUT)
            .await
    }

    async fn ref_exists(&self, reference: &str) -> bool {
        self.run(
            "rev-parse",
            &["rev-parse", "--verify", "--quiet", reference],
            STATUS_TIMEOUT,
        )
        .await
        .is_ok()
    }

    /// Ensure `branch` exists and is checked out, branching from the
    /// resolved base: the remote ref when pushed, the local ref otherwise,
    /// falling back to the current HEAD commit.
    pub async fn ensure_branch(&self, branch: &str, base: Option<&str>) -> Result<(), GitError> {
        if self.ref_exists(&format!("refs/heads/{branch}")).await {
            self.run("checkout", &["checkout", branch], DEFAULT_TIMEOUT)
                .await?;
            return Ok(());
        }

        let mut start_point = "HEAD".to_string();
        if let Some(base) = base {
            if self.ref_exists(&format!("refs/remotes/origin/{base}")).await {
                start_point = format!("origin/{base}");
            } else if self.ref_exists(&format!("refs/heads/{base}")).await {
                start_point = base.to_string();
            } else {
                debug!(target: "mech.git", %base, "base branch unpushed; branching from HEAD");
            }
        }

        self.run(
            "checkout",
            &["checkout", "-b", branch, &start_point],
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Stage everything and commit with a subject derived by the caller.
    ///
    /// Returns the new commit hash, or `None` when the tree was clean.
    pub async fn commit_all(&self, subject: &str) -> Result<Option<String>, GitError> {
        if self.status().await?.trim().is_empty() {
            return Ok(None);
        }
        self.run("add", &["add", "-A"], DEFAULT_TIMEOUT).await?;
        self.run(
            "commit",
            &[
                "-c",
                "user.name=mech-worker",
                "-c",
                "user.email=worker@mech.local",
                "commit",
                "-q",
                "-m",
                subject,
            ],
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(Some(self.head_commit().await?))
    }

    /// Push `branch` with `-u`. A non-fast-forward rejection triggers one
    /// fetch + rebase + re-push; a conflicted rebase is aborted and
    /// surfaced as [`GitError::NonFastForward`].
    pub async fn push_upstream(&self, branch: &str) -> Result<PushOutcome, GitError> {
        match self
            .run("push", &["push", "-u", "origin", branch], PUSH_TIMEOUT)
            .await
        {
            Ok(_) => {
                return Ok(PushOutcome {
                    branch: branch.to_string(),
                    rebased: false,
                });
            }
            Err(err) if is_non_fast_forward(&err) => {
                warn!(target: "mech.git", %branch, "push rejected; attempting rebase recovery");
            }
            Err(err) => return Err(err),
        }

        self.fetch().await?;
        if let Err(rebase_err) = self
            .run(
                "rebase",
                &["rebase", &format!("origin/{branch}")],
                DEFAULT_TIMEOUT,
            )
            .await
        {
            debug!(target: "mech.git", error = %rebase_err, "rebase conflicted; aborting");
            let _ = self
                .run("rebase", &["rebase", "--abort"], DEFAULT_TIMEOUT)
                .await;
            return Err(GitError::NonFastForward);
        }

        self.run("push", &["push", "-u", "origin", branch], PUSH_TIMEOUT)
            .await
            .map_err(|_| GitError::NonFastForward)?;
        Ok(PushOutcome {
            branch: branch.to_string(),
            rebased: true,
        })
    }

    async fn run(
        &self,
        op: &'static str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, GitError> {
        run_git_in(&self.dir, op, args, timeout).await
    }
}

fn is_non_fast_forward(err: &GitError) -> bool {
    match err {
        GitError::Command { stderr, .. } => {
            let lowered = stderr.to_lowercase();
            lowered.contains("non-fast-forward")
                || lowered.contains("fetch first")
                || lowered.contains("[rejected]")
        }
        _ => false,
    }
}

async fn run_git_in(
    dir: &Path,
    op: &'static str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, GitError> {
    debug!(target: "mech.git", %op, ?args, "running git");
    let child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| GitError::Timeout {
            op,
            secs: timeout.as_secs(),
        })??;

    if !output.status.success() {
        return Err(GitError::Command {
            op,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_with_and_without_slug() {
        assert_eq!(job_branch_name("jd-42", None), "job/jd-42");
        assert_eq!(
            job_branch_name("jd-42", Some("Fix the Parser!")),
            "job/jd-42-fix-the-parser"
        );
        assert_eq!(job_branch_name("jd-42", Some("!!!")), "job/jd-42");
    }

    #[test]
    fn commit_subject_takes_first_bullet() {
        let summary = "\n- Added retry logic to the gateway\n- Second point\n";
        assert_eq!(commit_subject(summary), "Added retry logic to the gateway");
    }

    #[test]
    fn commit_subject_clips_to_72_chars() {
        let long = "x".repeat(200);
        let subject = commit_subject(&long);
        assert!(subject.chars().count() <= MAX_SUBJECT);
        assert!(subject.ends_with('…'));
    }

    #[test]
    fn commit_subject_falls_back_when_empty() {
        assert_eq!(commit_subject("   \n \n"), "automated job update");
    }

    #[test]
    fn non_fast_forward_detection() {
        let err = GitError::Command {
            op: "push",
            code: Some(1),
            stderr: "! [rejected] job/x -> job/x (non-fast-forward)".to_string(),
        };
        assert!(is_non_fast_forward(&err));
        let other = GitError::Command {
            op: "push",
            code: Some(128),
            stderr: "fatal: repository not found".to_string(),
        };
        assert!(!is_non_fast_forward(&other));
    }

    #[test]
    fn fault_kinds_map_to_taxonomy() {
        assert_eq!(
            GitError::UnsafeRemote("x".into()).fault_kind(),
            FaultKind::UnsafeCloneUrl
        );
        assert_eq!(GitError::NonFastForward.fault_kind(), FaultKind::NonFastForward);
    }

    // Integration-style tests against a real local repository.

    async fn init_repo() -> (tempfile::TempDir, GitRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::at(dir.path());
        run_git_in(dir.path(), "init", &["init", "-q", "-b", "main"], DEFAULT_TIMEOUT)
            .await
            .unwrap();
        std::fs::write(dir.path().join("README.md"), "seed\n").unwrap();
        repo.commit_all("seed").await.unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn commit_all_skips_clean_tree() {
        let (_guard, repo) = init_repo().await;
        assert!(repo.commit_all("noop").await.unwrap().is_none());
        std::fs::write(repo.dir().join("new.txt"), "data").unwrap();
        let commit = repo.commit_all("add new file").await.unwrap();
        assert!(commit.is_some());
    }

    #[tokio::test]
    async fn ensure_branch_creates_and_reuses() {
        let (_guard, repo) = init_repo().await;
        repo.ensure_branch("job/jd-1", Some("main")).await.unwrap();
        let head = repo
            .run("branch", &["rev-parse", "--abbrev-ref", "HEAD"], STATUS_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(head.trim(), "job/jd-1");
        // Second call is a plain checkout, not a failure.
        repo.ensure_branch("job/jd-1", Some("main")).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_branch_from_missing_base_uses_head() {
        let (_guard, repo) = init_repo().await;
        repo.ensure_branch("job/jd-2", Some("never-pushed")).await.unwrap();
        let head = repo
            .run("branch", &["rev-parse", "--abbrev-ref", "HEAD"], STATUS_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(head.trim(), "job/jd-2");
    }

    /// Two clones of one bare remote diverge on the same branch; the
    /// second push is rejected non-fast-forward and must recover by
    /// fetch + rebase + re-push.
    #[tokio::test]
    async fn rejected_push_recovers_via_rebase() {
        let root = tempfile::tempdir().unwrap();
        let origin = root.path().join("origin.git");
        run_git_in(root.path(), "init", &["init", "-q", "--bare", "origin.git"], DEFAULT_TIMEOUT)
            .await
            .unwrap();
        let origin_url = origin.to_str().unwrap().to_string();

        let clone_at = |name: &str| {
            let dir = root.path().join(name);
            let origin_url = origin_url.clone();
            async move {
                run_git_in(
                    dir.parent().unwrap(),
                    "clone",
                    &["clone", "-q", &origin_url, dir.file_name().unwrap().to_str().unwrap()],
                    DEFAULT_TIMEOUT,
                )
                .await
                .unwrap();
                GitRepo::at(dir)
            }
        };

        // Seed the remote from the first clone.
        let first = clone_at("first").await;
        run_git_in(first.dir(), "checkout", &["checkout", "-q", "-b", "job/shared"], DEFAULT_TIMEOUT)
            .await
            .unwrap();
        std::fs::write(first.dir().join("a.txt"), "one\n").unwrap();
        first.commit_all("seed a").await.unwrap();
        first.push_upstream("job/shared").await.unwrap();

        // Second clone starts from the same tip.
        let second = clone_at("second").await;
        run_git_in(second.dir(), "checkout", &["checkout", "-q", "job/shared"], DEFAULT_TIMEOUT)
            .await
            .unwrap();

        // First clone advances the remote.
        std::fs::write(first.dir().join("b.txt"), "two\n").unwrap();
        first.commit_all("advance remote").await.unwrap();
        first.push_upstream("job/shared").await.unwrap();

        // Second clone commits a non-conflicting change; its push is
        // rejected and the rebase recovery lands it.
        std::fs::write(second.dir().join("c.txt"), "three\n").unwrap();
        second.commit_all("local change").await.unwrap();
        let outcome = second.push_upstream("job/shared").await.unwrap();
        assert!(outcome.rebased, "recovery path must have run");

        // The remote now holds both commits.
        let log = run_git_in(
            first.dir(),
            "fetch",
            &["fetch", "-q", "origin"],
            DEFAULT_TIMEOUT,
        )
        .await
        .and(
            run_git_in(
                first.dir(),
                "log",
                &["log", "--oneline", "origin/job/shared"],
                DEFAULT_TIMEOUT,
            )
            .await,
        )
        .unwrap();
        assert!(log.contains("advance remote"));
        assert!(log.contains("local change"));
    }

    /// A conflicting rebase aborts and surfaces the non-fast-forward.
    #[tokio::test]
    async fn conflicting_rebase_aborts_cleanly() {
        let root = tempfile::tempdir().unwrap();
        run_git_in(root.path(), "init", &["init", "-q", "--bare", "origin.git"], DEFAULT_TIMEOUT)
            .await
            .unwrap();
        let origin_url = root.path().join("origin.git").to_str().unwrap().to_string();

        let clone_at = |name: &str| {
            let dir = root.path().join(name);
            let origin_url = origin_url.clone();
            async move {
                run_git_in(
                    dir.parent().unwrap(),
                    "clone",
                    &["clone", "-q", &origin_url, dir.file_name().unwrap().to_str().unwrap()],
                    DEFAULT_TIMEOUT,
                )
                .await
                .unwrap();
                GitRepo::at(dir)
            }
        };

        let first = clone_at("first").await;
        run_git_in(first.dir(), "checkout", &["checkout", "-q", "-b", "job/clash"], DEFAULT_TIMEOUT)
            .await
            .unwrap();
        std::fs::write(first.dir().join("same.txt"), "base\n").unwrap();
        first.commit_all("seed").await.unwrap();
        first.push_upstream("job/clash").await.unwrap();

        let second = clone_at("second").await;
        run_git_in(second.dir(), "checkout", &["checkout", "-q", "job/clash"], DEFAULT_TIMEOUT)
            .await
            .unwrap();

        // Both sides edit the same line.
        std::fs::write(first.dir().join("same.txt"), "remote wins\n").unwrap();
        first.commit_all("remote edit").await.unwrap();
        first.push_upstream("job/clash").await.unwrap();

        std::fs::write(second.dir().join("same.txt"), "local wins\n").unwrap();
        second.commit_all("local edit").await.unwrap();
        let err = second.push_upstream("job/clash").await.unwrap_err();
        assert!(matches!(err, GitError::NonFastForward));

        // The tree is back to a usable state (rebase aborted).
        let status = second.status().await.unwrap();
        assert!(status.trim().is_empty(), "clean tree after abort: {status}");
    }
}
