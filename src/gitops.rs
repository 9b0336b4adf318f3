//! Git-based recovery inside the sandbox working tree. Commits are
//! recorded as recovery points; switching to one clears the active
//! fragment pointer since the two mechanisms are mutually exclusive
//! for a given restore.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::project::store::ProjectStore;
use crate::project::{Fragment, GitFragmentRecord, GitRef};
use crate::sandbox::provider::Sandbox;
use crate::sandbox::types::ExecRequest;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[derive(Debug, Clone)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: "sandpiper".to_string(),
            email: "bot@sandpiper.dev".to_string(),
        }
    }
}

/// Prefer replaying git history over re-writing fragment files, except
/// for auto-fixed fragments: those were rewritten after their commit
/// was recorded, so no commit matches their content.
pub fn prefers_git_recovery(fragment: Option<&Fragment>, last_commit: Option<&GitRef>) -> bool {
    if last_commit.is_none() {
        return false;
    }
    !fragment.map(|f| f.auto_fixed).unwrap_or(false)
}

pub struct GitController {
    workdir: String,
    /// Internal tooling directory, never staged.
    exclude_dir: String,
}

impl GitController {
    pub fn new(workdir: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            exclude_dir: ".sandpiper".to_string(),
        }
    }

    pub fn with_exclude_dir(mut self, dir: impl Into<String>) -> Self {
        self.exclude_dir = dir.into();
        self
    }

    async fn git(&self, sandbox: &dyn Sandbox, args: &str, what: &str) -> Result<String> {
        let result = sandbox
            .exec(ExecRequest::shell(format!("git {args}"), GIT_TIMEOUT).in_dir(&self.workdir))
            .await
            .with_context(|| format!("{what} in {}", sandbox.id()))?
            .require_success(what)?;
        Ok(result.stdout)
    }

    /// Check out an exact commit and move the project record onto it.
    pub async fn switch_to_commit(
        &self,
        sandbox: &dyn Sandbox,
        store: &dyn ProjectStore,
        project_id: &str,
        commit_hash: &str,
    ) -> Result<()> {
        self.git(
            sandbox,
            &format!("checkout {}", shell_quote(commit_hash)),
            "git checkout",
        )
        .await?;
        let branch = self
            .git(sandbox, "rev-parse --abbrev-ref HEAD", "git rev-parse")
            .await?
            .trim()
            .to_string();

        let commit = commit_hash.to_string();
        store
            .mutate_project(
                project_id,
                Box::new(move |project| {
                    project.last_commit = Some(GitRef {
                        commit_hash: commit,
                        branch,
                    });
                    project.active_fragment_id = None;
                }),
            )
            .await?
            .with_context(|| format!("project {project_id} not found"))?;
        tracing::info!(project_id = %project_id, commit = %commit_hash, "Switched working tree to commit");
        Ok(())
    }

    /// Stage and commit everything outside the tooling directory.
    /// Returns `None` when the working tree is clean.
    pub async fn create_commit(
        &self,
        sandbox: &dyn Sandbox,
        store: &dyn ProjectStore,
        project_id: &str,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<Option<GitFragmentRecord>> {
        self.ensure_repo(sandbox).await?;
        self.git(
            sandbox,
            &format!("add -A -- . ':!{}'", self.exclude_dir),
            "git add",
        )
        .await?;

        let status = self
            .git(sandbox, "status --porcelain", "git status")
            .await?;
        if status.trim().is_empty() {
            tracing::debug!(project_id = %project_id, "Nothing to commit");
            return Ok(None);
        }

        self.git(
            sandbox,
            &format!(
                "-c user.name={} -c user.email={} commit -m {}",
                shell_quote(&author.name),
                shell_quote(&author.email),
                shell_quote(message)
            ),
            "git commit",
        )
        .await?;

        let commit_hash = self
            .git(sandbox, "rev-parse HEAD", "git rev-parse")
            .await?
            .trim()
            .to_string();
        let branch = self
            .git(sandbox, "rev-parse --abbrev-ref HEAD", "git rev-parse")
            .await?
            .trim()
            .to_string();

        let record = GitFragmentRecord {
            commit_hash: commit_hash.clone(),
            branch: branch.clone(),
            message: message.to_string(),
            author_name: Some(author.name.clone()),
            author_email: Some(author.email.clone()),
            created_at: Utc::now(),
        };
        store.record_git_fragment(project_id, record.clone()).await?;
        store
            .mutate_project(
                project_id,
                Box::new(move |project| {
                    project.last_commit = Some(GitRef {
                        commit_hash,
                        branch,
                    });
                }),
            )
            .await?;
        tracing::info!(project_id = %project_id, commit = %record.commit_hash, "Recorded commit");
        Ok(Some(record))
    }

    async fn ensure_repo(&self, sandbox: &dyn Sandbox) -> Result<()> {
        sandbox
            .exec(
                ExecRequest::shell("[ -d .git ] || git init -b main", GIT_TIMEOUT)
                    .in_dir(&self.workdir),
            )
            .await
            .with_context(|| format!("git init in {}", sandbox.id()))?
            .require_success("git init")?;
        Ok(())
    }
}
