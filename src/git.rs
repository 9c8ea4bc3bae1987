//! The git CLI as version-control collaborator.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument};

use crate::executor::{CommandExecutor, INTROSPECTION_TIMEOUT};
use crate::traits::{CollaboratorResult, Vcs};

/// Age after which remotes are fetched again.
const FETCH_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// A repository checkout driven through `git`.
pub struct GitRepo {
    executor: CommandExecutor,
    remote: String,
    trunk_branch: String,
    staging_branch: String,
}

impl GitRepo {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            remote: "origin".to_string(),
            trunk_branch: "master".to_string(),
            staging_branch: "staging".to_string(),
        }
    }

    pub fn with_branches(mut self, trunk: &str, staging: &str) -> Self {
        self.trunk_branch = trunk.to_string();
        self.staging_branch = staging.to_string();
        self
    }

    pub fn with_remote(mut self, remote: &str) -> Self {
        self.remote = remote.to_string();
        self
    }

    async fn git(&self, args: &[&str]) -> CollaboratorResult<String> {
        self.executor.run_checked("git", args, None).await
    }

    /// Whether the last fetch is older than [`FETCH_MAX_AGE`].
    fn fetch_is_stale(&self) -> bool {
        let fetch_head = self.executor.workdir().join(".git").join("FETCH_HEAD");
        std::fs::metadata(fetch_head)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(true, |age| age > FETCH_MAX_AGE)
    }
}

#[async_trait]
impl Vcs for GitRepo {
    #[instrument(skip(self))]
    async fn fetch_if_stale(&self) -> CollaboratorResult<()> {
        if !self.fetch_is_stale() {
            debug!("Last fetch is recent");
            return Ok(());
        }
        info!(remote = %self.remote, "Fetching");
        self.git(&["fetch", "-q", "--prune", &self.remote]).await?;
        Ok(())
    }

    /// Discards local edits and detaches HEAD at `git_ref`, so the working
    /// branch can be deleted afterwards.
    async fn reset_hard(&self, git_ref: &str) -> CollaboratorResult<()> {
        self.git(&["reset", "-q", "--hard"]).await?;
        self.git(&["clean", "-q", "-fdx"]).await?;
        self.git(&["checkout", "-q", "--detach", git_ref]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn checkout_at_merge_base(&self, branch: &str) -> CollaboratorResult<()> {
        let trunk = self.remote_ref(&self.trunk_branch);
        let staging = self.remote_ref(&self.staging_branch);
        let base = self.git(&["merge-base", &trunk, &staging]).await?;
        let base = base.trim();
        debug!(%base, "Merge base found");
        self.git(&["checkout", "-q", "-B", branch, base]).await?;
        Ok(())
    }

    async fn diff(&self) -> CollaboratorResult<String> {
        self.git(&["diff"]).await
    }

    async fn commit(&self, message: &str) -> CollaboratorResult<()> {
        self.git(&["commit", "-q", "-a", "-m", message]).await?;
        Ok(())
    }

    async fn push(&self, branch: &str) -> CollaboratorResult<()> {
        self.git(&["push", "--force", "--set-upstream", &self.remote, branch])
            .await?;
        Ok(())
    }

    async fn head_commit(&self) -> CollaboratorResult<String> {
        let stdout = self
            .executor
            .run_checked("git", &["rev-parse", "HEAD"], Some(INTROSPECTION_TIMEOUT))
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn branch_exists(&self, branch: &str) -> CollaboratorResult<bool> {
        let local_ref = format!("refs/heads/{}", branch);
        let output = self
            .executor
            .run(
                "git",
                &["rev-parse", "--verify", "--quiet", &local_ref],
                Some(INTROSPECTION_TIMEOUT),
            )
            .await?;
        Ok(output.success)
    }

    async fn delete_branch(&self, branch: &str) -> CollaboratorResult<()> {
        self.git(&["branch", "-q", "-D", branch]).await?;
        Ok(())
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("{}/{}", self.remote, branch)
    }
}
