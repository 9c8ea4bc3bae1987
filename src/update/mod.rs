//! Update module - the per-candidate gate/rewrite/publish pipeline.
//!
//! - **Traits**: [`Rewriter`] for in-place definition edits
//! - **Errors**: the candidate failure taxonomy [`UpdateError`]
//! - **Gates**: [`Blacklist`] and path pins via [`pin`]
//! - **Pipeline**: async orchestrator via [`pipeline::UpdatePipeline`]

pub mod blacklist;
pub mod description;
pub mod pin;
pub mod pipeline;
pub mod rewrites;
pub mod traits;

// Re-export commonly used types
pub use traits::{HashRecoveryError, RewriteContext, RewriteError, Rewriter, UpdateError};

pub use blacklist::{Blacklist, MatchKind, Rule};
pub use description::ChangeSummary;
pub use pipeline::{BestEffort, UpdateOutcome, UpdatePipeline, UpdateStats};
pub use rewrites::{default_rewriters, CargoHashRewrite, SourceHashRewrite, VersionRewrite};
