//! Core traits and error types of the update pipeline.
//!
//! - Rewrite steps via [`Rewriter`]
//! - The terminal failure taxonomy of a candidate via [`UpdateError`]

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::model::{AttrPath, Candidate, PackageMeta, RewriteOutcome};
use crate::traits::{CollaboratorError, Evaluator};

// ============================================================================
// Rewrite Trait
// ============================================================================

/// Everything a rewrite step may look at.
pub struct RewriteContext<'a> {
    pub candidate: &'a Candidate,
    pub attr_path: &'a AttrPath,
    /// Definition file being edited
    pub file: &'a Path,
    /// Package metadata evaluated before any rewrite ran
    pub original_meta: &'a PackageMeta,
    pub evaluator: &'a dyn Evaluator,
}

/// One in-place edit of the definition file.
///
/// Steps run in a fixed order; each sees the file as left by the previous.
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// Applies the edit.
    ///
    /// Returns `Ok(None)` when the step does not apply to this package and
    /// left the file untouched, `Ok(Some(_))` when it modified the file.
    ///
    /// # Errors
    ///
    /// A `RewriteError` aborts the whole candidate.
    async fn rewrite(&self, ctx: &RewriteContext<'_>)
        -> Result<Option<RewriteOutcome>, RewriteError>;

    /// Returns the name of this rewrite step.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure to learn a fixed-output hash from the builder.
#[derive(Error, Debug)]
pub enum HashRecoveryError {
    /// The build succeeded against the sentinel hash
    #[error("Build of {0} unexpectedly succeeded with the sentinel hash")]
    BuildSucceeded(String),

    /// The diagnostics did not contain the expected hash line
    #[error("Unrecognized hash mismatch diagnostics: {0}")]
    UnrecognizedDiagnostics(String),
}

/// Errors raised by rewrite steps.
#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("Hash recovery failed: {0}")]
    HashRecovery(#[from] HashRecoveryError),

    #[error("Evaluator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal failure of one candidate. Never aborts the batch.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Package blacklisted: {0}")]
    Blacklisted(String),

    #[error("New version {new} is not newer than {old}")]
    VersionNotNewer { old: String, new: String },

    #[error("An open change already exists: {0}")]
    DuplicateSubmission(String),

    #[error("Attribute path resolution failed: {0}")]
    AttrResolution(String),

    #[error("Version {new} is incompatible with the pin of {attr}")]
    PinIncompatible { attr: String, new: String },

    #[error("Source URL blacklisted: {0}")]
    UrlBlacklisted(String),

    #[error("Already updated on branch {0}")]
    AlreadyUpdated(String),

    #[error("Definition content blacklisted: {0}")]
    ContentBlacklisted(String),

    #[error("Rewrite {step} failed: {source}")]
    RewriteFailed {
        step: &'static str,
        #[source]
        source: RewriteError,
    },

    #[error("No rewrites performed")]
    NoChange,

    #[error("Source URL did not change")]
    UrlUnchanged,

    #[error("Source hash did not change")]
    HashUnchanged,

    #[error("{rebuilds} rebuilds exceed the limit of {limit} for {ecosystem} packages")]
    RebuildCountVetoed {
        ecosystem: String,
        rebuilds: usize,
        limit: usize,
    },

    #[error("No rebuilds triggered")]
    ZeroRebuilds,

    #[error("Build failed:\n{0}")]
    BuildFailed(String),

    #[error("Push failed after {attempts} attempts: {last_error}")]
    PushFailed { attempts: u32, last_error: String },

    /// An external collaborator failed outside the stages above
    #[error("{stage}: {source}")]
    Collaborator {
        stage: &'static str,
        #[source]
        source: CollaboratorError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Stable category name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Blacklisted(_) => "blacklist_rejection",
            UpdateError::VersionNotNewer { .. } => "version_not_newer",
            UpdateError::DuplicateSubmission(_) => "duplicate_submission",
            UpdateError::AttrResolution(_) => "attribute_resolution_failure",
            UpdateError::PinIncompatible { .. } => "pin_incompatible",
            UpdateError::UrlBlacklisted(_) => "url_blacklisted",
            UpdateError::AlreadyUpdated(_) => "already_updated_on_branch",
            UpdateError::ContentBlacklisted(_) => "content_blacklisted",
            UpdateError::RewriteFailed { .. } => "rewrite_failed",
            UpdateError::NoChange => "no_change_detected",
            UpdateError::UrlUnchanged => "url_unchanged",
            UpdateError::HashUnchanged => "hash_unchanged",
            UpdateError::RebuildCountVetoed { .. } => "rebuild_count_vetoed",
            UpdateError::ZeroRebuilds => "zero_rebuilds",
            UpdateError::BuildFailed(_) => "build_failed",
            UpdateError::PushFailed { .. } => "push_failed_after_retries",
            UpdateError::Collaborator { .. } => "collaborator_failure",
            UpdateError::Io(_) => "io_error",
        }
    }

    /// Wraps a collaborator failure with the stage it happened in.
    pub fn at(stage: &'static str) -> impl FnOnce(CollaboratorError) -> Self {
        move |source| UpdateError::Collaborator { stage, source }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinct_for_taxonomy() {
        let errors = [
            UpdateError::NoChange,
            UpdateError::UrlUnchanged,
            UpdateError::HashUnchanged,
            UpdateError::ZeroRebuilds,
            UpdateError::AlreadyUpdated("staging".to_string()),
        ];
        let kinds: std::collections::BTreeSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_collaborator_error_carries_stage() {
        let err = UpdateError::at("checkout")(CollaboratorError::UnexpectedOutput(
            "bad ref".to_string(),
        ));
        assert_eq!(err.kind(), "collaborator_failure");
        assert_eq!(err.to_string(), "checkout: Unexpected output: bad ref");
    }
}
