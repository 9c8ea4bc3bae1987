//! Interfaces of the external systems the update pipeline coordinates.
//!
//! Every collaborator is a single-owner service. The [`Vcs`] in particular
//! owns the working tree: each call that checks out a ref changes what the
//! next stage reads from disk, so callers never interleave operations on it.

use async_trait::async_trait;
use std::cmp::Ordering;
use thiserror::Error;

use crate::model::{
    AttrPath, BuildReport, ChangeRequest, PackageMeta, VulnerabilityRecord,
};
use crate::outpaths::OutpathSet;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to parse content: {0}")]
    InvalidContent(String),
}

/// Failure of an external collaborator call.
#[derive(Error, Debug)]
pub enum CollaboratorError {
    /// External command ran but reported failure
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// External command exceeded its timeout
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// Output could not be interpreted
    #[error("Unexpected output: {0}")]
    UnexpectedOutput(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Http(err.to_string())
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// The package-definition evaluator and builder.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Orders two versions with the definition language's own semantics.
    async fn compare_versions(&self, a: &str, b: &str) -> CollaboratorResult<Ordering>;

    /// Finds the attribute path of `name` at `version`.
    async fn resolve_attr_path(&self, name: &str, version: &str)
        -> CollaboratorResult<AttrPath>;

    /// Evaluates package metadata against the current working tree.
    async fn package_meta(&self, attr: &AttrPath) -> CollaboratorResult<PackageMeta>;

    /// Evaluates an arbitrary expression, returning its JSON rendering.
    ///
    /// Metadata and outputs queries of an implementation are expected to be
    /// expressed through this call.
    async fn eval(&self, expr: &str) -> CollaboratorResult<String>;

    /// Builds an attribute expression (e.g. `foo` or `foo.src`).
    ///
    /// A failed build is `Ok` with `success == false`; `Err` is reserved for
    /// the builder itself being unusable.
    async fn build(&self, attr_expr: &str) -> CollaboratorResult<BuildReport>;

    /// Store paths of all outputs of an attribute.
    async fn outputs(&self, attr: &AttrPath) -> CollaboratorResult<Vec<String>>;

    /// Evaluates the outpaths of the whole tree. The heaviest call there is.
    async fn eval_outpaths(&self) -> CollaboratorResult<OutpathSet>;

    /// Uploads build outputs to the configured binary cache.
    async fn push_to_cache(&self, paths: &[String]) -> CollaboratorResult<()>;
}

/// The version-control system owning the working tree.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Fetches remotes when the last fetch is old enough.
    async fn fetch_if_stale(&self) -> CollaboratorResult<()>;

    /// Resets the working tree (and index) to a ref such as `origin/master`.
    async fn reset_hard(&self, git_ref: &str) -> CollaboratorResult<()>;

    /// Creates `branch` at the merge base of the trunk and staging branches.
    async fn checkout_at_merge_base(&self, branch: &str) -> CollaboratorResult<()>;

    async fn diff(&self) -> CollaboratorResult<String>;

    async fn commit(&self, message: &str) -> CollaboratorResult<()>;

    /// Pushes `branch`; may be rejected by the remote.
    async fn push(&self, branch: &str) -> CollaboratorResult<()>;

    async fn head_commit(&self) -> CollaboratorResult<String>;

    /// Whether a local branch named `branch` exists.
    async fn branch_exists(&self, branch: &str) -> CollaboratorResult<bool>;

    async fn delete_branch(&self, branch: &str) -> CollaboratorResult<()>;

    /// Ref name of a long-lived branch as seen by [`Vcs::reset_hard`].
    fn remote_ref(&self, branch: &str) -> String {
        format!("origin/{}", branch)
    }
}

/// The code-hosting service receiving change requests.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// URL of an open change already proposing this bump, if any.
    async fn open_change_for(
        &self,
        package: &str,
        new_version: &str,
    ) -> CollaboratorResult<Option<String>>;

    /// Opens a change request, returning its URL.
    async fn submit_change(&self, change: &ChangeRequest) -> CollaboratorResult<String>;

    async fn release_url(&self, source_url: &str, new_version: &str)
        -> CollaboratorResult<Option<String>>;

    async fn compare_url(
        &self,
        source_url: &str,
        old_version: &str,
        new_version: &str,
    ) -> CollaboratorResult<Option<String>>;
}

/// The vulnerability database.
#[async_trait]
pub trait VulnerabilityDb: Send + Sync {
    /// Records affecting `product` at `version`.
    async fn query(
        &self,
        product: &str,
        version: &str,
    ) -> CollaboratorResult<Vec<VulnerabilityRecord>>;
}

/// External queue-depth signal of the shared build farm.
#[async_trait]
pub trait LoadSignal: Send + Sync {
    async fn queue_depth(&self) -> CollaboratorResult<u64>;
}
