// SPDX-License-Identifier: MIT OR Apache-2.0
//! Git sub-pipeline for coding jobs.
//!
//! Runs only when job metadata carries repository coordinates. The clone
//! target and branch come from the metadata; the workspace repository is
//! used by at most one in-flight job at a time (the pipeline holds the
//! repo lock across prepare → finalize).

use mech_config::GitConfig;
use mech_context::JobContext;
use mech_core::{Fault, Stage};
use mech_git::{GitError, GitRepo, PushOutcome, commit_subject, job_branch_name};
use std::path::PathBuf;
use tracing::info;

/// A prepared coding workspace.
#[derive(Debug)]
pub struct CodingJob {
    /// Checked-out repository.
    pub repo: GitRepo,
    /// Branch the job works on.
    pub branch: String,
    /// Validated remote URL.
    pub remote_url: String,
}

/// Result of the post-execution commit/push pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingOutcome {
    /// Commit created by the auto-stage pass, when the tree was dirty.
    pub commit: Option<String>,
    /// Push result, when a commit was pushed.
    pub push: Option<PushOutcome>,
    /// Pull-request URL for the pushed branch.
    pub pr_url: Option<String>,
}

fn git_fault(context: &JobContext, err: GitError) -> Fault {
    Fault::new(err.fault_kind(), Stage::Git, err.to_string()).with_request(context.request.id)
}

/// Clone/fetch the repository and check out the job branch.
///
/// Returns `None` for non-coding jobs.
pub async fn prepare(
    context: &JobContext,
    config: &GitConfig,
) -> Result<Option<CodingJob>, Fault> {
    let Some(code) = &context.metadata.code_metadata else {
        return Ok(None);
    };

    let dir = match &config.repo_dir {
        Some(dir) => dir.clone(),
        None => {
            let base = config
                .workspace_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("workspace"));
            base.join(repo_dir_name(&code.repository_url))
        }
    };

    let repo = GitRepo::clone_or_fetch(
        &code.repository_url,
        &dir,
        config.ssh_host_alias.as_deref(),
    )
    .await
    .map_err(|e| git_fault(context, e))?;

    let branch = match &code.branch_name {
        Some(branch) => branch.clone(),
        None => job_branch_name(
            &context.metadata.job_definition_id,
            Some(&context.metadata.job_name),
        ),
    };
    repo.ensure_branch(&branch, code.base_branch.as_deref())
        .await
        .map_err(|e| git_fault(context, e))?;

    info!(target: "mech.pipeline", %branch, dir = %dir.display(), "coding workspace ready");
    Ok(Some(CodingJob {
        repo,
        branch,
        remote_url: code.repository_url.clone(),
    }))
}

/// Auto-stage, commit, and push after execution.
pub async fn finalize(
    context: &JobContext,
    job: &CodingJob,
    summary: &str,
) -> Result<CodingOutcome, Fault> {
    let subject = commit_subject(summary);
    let commit = job
        .repo
        .commit_all(&subject)
        .await
        .map_err(|e| git_fault(context, e))?;

    if commit.is_none() {
        return Ok(CodingOutcome {
            commit: None,
            push: None,
            pr_url: None,
        });
    }

    let push = job
        .repo
        .push_upstream(&job.branch)
        .await
        .map_err(|e| git_fault(context, e))?;
    let pr_url = pull_request_url(&job.remote_url, &job.branch);

    Ok(CodingOutcome {
        commit,
        push: Some(push),
        pr_url,
    })
}

/// Directory name for a repository clone.
fn repo_dir_name(remote_url: &str) -> String {
    remote_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit(['/', ':'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("repository")
        .to_string()
}

/// GitHub new-pull-request URL for a pushed branch.
#[must_use]
pub fn pull_request_url(remote_url: &str, branch: &str) -> Option<String> {
    let path = remote_url
        .strip_prefix("https://github.com/")
        .or_else(|| remote_url.strip_prefix("git@github.com:"))
        .or_else(|| remote_url.strip_prefix("ssh://git@github.com/"))?;
    let path = path.trim_end_matches(".git");
    Some(format!("https://github.com/{path}/pull/new/{branch}"))
}
