//! Update pipeline orchestrator.
//!
//! This module provides the [`UpdatePipeline`] coordinator that runs the
//! ordered gate/rewrite/publish sequence for one candidate:
//! - Gates reject unsafe or pointless updates before anything is edited
//! - Rewrite steps edit the definition file in place
//! - Rebuild impact and a full build decide whether the update is published
//! - The working tree is reset to trunk afterwards, whatever the outcome
//!
//! Stages share the working tree through the [`Vcs`]; they run strictly one
//! after another and every checkout is fully read before the next one.

use std::cmp::Ordering;
use std::fmt::Display;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cve::{self, CveReport};
use crate::model::{AttrPath, Candidate, ChangeRequest, PackageMeta, RewriteOutcome};
use crate::outpaths::RebuildEstimator;
use crate::traits::{CodeHost, Evaluator, Vcs, VulnerabilityDb};
use crate::update::blacklist::Blacklist;
use crate::update::description::ChangeSummary;
use crate::update::pin::compatible_with_pin;
use crate::update::rewrites::default_rewriters;
use crate::update::traits::{RewriteContext, Rewriter, UpdateError};

/// Lines of build log attached to a build failure.
const BUILD_LOG_TAIL_LINES: usize = 30;

/// Push attempts before giving up.
const PUSH_ATTEMPTS: u32 = 3;

// ============================================================================
// Pipeline Types
// ============================================================================

/// Outcome of a best-effort step: the pipeline continues either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort<T> {
    Done(T),
    Degraded(String),
}

impl<T> BestEffort<T> {
    pub fn from_result<E: Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => BestEffort::Done(value),
            Err(e) => BestEffort::Degraded(e.to_string()),
        }
    }
}

/// A published (or locally committed) update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub attr_path: AttrPath,
    pub rebuild_count: usize,
    pub target_branch: String,
    /// URL of the submitted change; `None` when submission is disabled
    pub change_url: Option<String>,
    pub description: String,
    pub stats: UpdateStats,
}

/// Timing of the expensive stages.
#[derive(Debug, Default, Clone)]
pub struct UpdateStats {
    /// Total time spent on the candidate (milliseconds)
    pub total_duration_ms: u64,

    /// Time spent estimating rebuild impact (milliseconds)
    pub estimate_duration_ms: u64,

    /// Time spent in the full build (milliseconds)
    pub build_duration_ms: u64,

    /// Rewrite steps that modified the definition file
    pub rewrites_applied: usize,
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// Per-candidate update orchestrator.
///
/// # Example
///
/// ```ignore
/// let pipeline = UpdatePipeline::new(evaluator, vcs, host, vulns)
///     .with_blacklist(Blacklist::from_config(&config.blacklist));
/// let mut estimator = RebuildEstimator::new(true, Duration::from_secs(3600));
///
/// let outcome = pipeline.execute(&candidate, &mut estimator).await?;
/// println!("{} rebuilds", outcome.rebuild_count);
/// ```
pub struct UpdatePipeline<E, V, H, D>
where
    E: Evaluator,
    V: Vcs,
    H: CodeHost,
    D: VulnerabilityDb,
{
    evaluator: E,
    vcs: V,
    host: H,
    vulns: D,

    /// Rewrite steps, run in order
    rewriters: Vec<Box<dyn Rewriter>>,

    blacklist: Blacklist,
}

impl<E, V, H, D> UpdatePipeline<E, V, H, D>
where
    E: Evaluator,
    V: Vcs,
    H: CodeHost,
    D: VulnerabilityDb,
{
    /// Creates a pipeline with the built-in rewrite steps and blacklist.
    pub fn new(evaluator: E, vcs: V, host: H, vulns: D) -> Self {
        Self {
            evaluator,
            vcs,
            host,
            vulns,
            rewriters: default_rewriters(),
            blacklist: Blacklist::default(),
        }
    }

    pub fn with_rewriters(mut self, rewriters: Vec<Box<dyn Rewriter>>) -> Self {
        self.rewriters = rewriters;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Blacklist) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Runs every stage for one candidate.
    ///
    /// The working tree is reset to trunk afterwards if any stage touched
    /// it. Gates that fail before repository synchronization leave the
    /// filesystem untouched.
    ///
    /// # Errors
    ///
    /// Returns the [`UpdateError`] of the first failing stage.
    #[instrument(skip_all, fields(candidate = %candidate))]
    pub async fn execute(
        &self,
        candidate: &Candidate,
        estimator: &mut RebuildEstimator,
    ) -> Result<UpdateOutcome, UpdateError> {
        let start = Instant::now();
        let mut touched_tree = false;

        let result = self.run_stages(candidate, estimator, &mut touched_tree).await;

        if touched_tree {
            let trunk = self.vcs.remote_ref(&candidate.options.trunk_branch);
            if let BestEffort::Degraded(reason) =
                BestEffort::from_result(self.vcs.reset_hard(&trunk).await)
            {
                warn!(%reason, "Failed to reset working tree to trunk");
            }
        }

        result.map(|mut outcome| {
            outcome.stats.total_duration_ms = start.elapsed().as_millis() as u64;
            info!(
                duration_ms = outcome.stats.total_duration_ms,
                rebuilds = outcome.rebuild_count,
                target = %outcome.target_branch,
                "Update completed"
            );
            outcome
        })
    }

    async fn run_stages(
        &self,
        candidate: &Candidate,
        estimator: &mut RebuildEstimator,
        touched_tree: &mut bool,
    ) -> Result<UpdateOutcome, UpdateError> {
        let opts = &candidate.options;
        let mut stats = UpdateStats::default();

        // ====================================================================
        // Gates that need no working tree
        // ====================================================================

        if let Some(reason) = self.blacklist.check_name(&candidate.package_name) {
            return Err(UpdateError::Blacklisted(format!(
                "{}: {}",
                candidate.package_name, reason
            )));
        }

        let ordering = self
            .evaluator
            .compare_versions(&candidate.new_version, &candidate.old_version)
            .await
            .map_err(UpdateError::at("version comparison"))?;
        if ordering != Ordering::Greater {
            return Err(UpdateError::VersionNotNewer {
                old: candidate.old_version.clone(),
                new: candidate.new_version.clone(),
            });
        }

        // ====================================================================
        // Repository synchronization
        // ====================================================================

        *touched_tree = true;
        match BestEffort::from_result(self.vcs.fetch_if_stale().await) {
            BestEffort::Done(()) => debug!("Remotes up to date"),
            BestEffort::Degraded(reason) => {
                warn!(%reason, "Fetch failed, continuing with local refs")
            }
        }
        // Current ref: trunk.
        self.vcs
            .reset_hard(&self.vcs.remote_ref(&opts.trunk_branch))
            .await
            .map_err(UpdateError::at("trunk checkout"))?;

        if opts.submit_changes {
            let existing = self
                .host
                .open_change_for(&candidate.package_name, &candidate.new_version)
                .await
                .map_err(UpdateError::at("duplicate check"))?;
            if let Some(url) = existing {
                return Err(UpdateError::DuplicateSubmission(url));
            }
        }

        // ====================================================================
        // Attribute path and metadata gates
        // ====================================================================

        let attr_path = self
            .evaluator
            .resolve_attr_path(&candidate.package_name, &candidate.old_version)
            .await
            .map_err(|e| UpdateError::AttrResolution(e.to_string()))?;
        let trunk_meta = self
            .evaluator
            .package_meta(&attr_path)
            .await
            .map_err(|e| UpdateError::AttrResolution(e.to_string()))?;
        if trunk_meta.version != candidate.old_version {
            return Err(UpdateError::AttrResolution(format!(
                "{} has version {}, expected {}",
                attr_path, trunk_meta.version, candidate.old_version
            )));
        }
        info!(attr = %attr_path, file = %trunk_meta.file, "Attribute path resolved");

        if !compatible_with_pin(
            attr_path.as_str(),
            &candidate.old_version,
            &candidate.new_version,
        ) {
            return Err(UpdateError::PinIncompatible {
                attr: attr_path.to_string(),
                new: candidate.new_version.clone(),
            });
        }

        for url in [candidate.source_url.as_deref(), trunk_meta.src_url.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(reason) = self.blacklist.check_url(url) {
                return Err(UpdateError::UrlBlacklisted(format!("{}: {}", url, reason)));
            }
        }

        self.check_not_updated_on_branches(candidate, &trunk_meta).await?;

        // ====================================================================
        // Working branch and baseline
        // ====================================================================

        // Current ref: merge base of trunk and staging, on the working branch.
        self.vcs
            .checkout_at_merge_base(&candidate.branch_name())
            .await
            .map_err(UpdateError::at("merge-base checkout"))?;

        estimator
            .refresh_baseline_if_stale(&self.evaluator)
            .await
            .map_err(UpdateError::at("merge-base evaluation"))?;

        let original_meta = self
            .evaluator
            .package_meta(&attr_path)
            .await
            .map_err(UpdateError::at("metadata evaluation"))?;
        let file = std::path::PathBuf::from(&original_meta.file);
        let original_contents = tokio::fs::read_to_string(&file).await?;

        if let Some(reason) = self.blacklist.check_content(&original_contents) {
            return Err(UpdateError::ContentBlacklisted(reason.to_string()));
        }

        // ====================================================================
        // Rewrites
        // ====================================================================

        let rewrites = {
            let ctx = RewriteContext {
                candidate,
                attr_path: &attr_path,
                file: &file,
                original_meta: &original_meta,
                evaluator: &self.evaluator,
            };
            self.run_rewriters(&ctx).await?
        };
        stats.rewrites_applied = rewrites.len();

        let edited_contents = tokio::fs::read_to_string(&file).await?;
        if edited_contents == original_contents {
            return Err(UpdateError::NoChange);
        }

        let edited_meta = self
            .evaluator
            .package_meta(&attr_path)
            .await
            .map_err(UpdateError::at("metadata re-evaluation"))?;
        if edited_meta.src_url == original_meta.src_url {
            return Err(UpdateError::UrlUnchanged);
        }
        if edited_meta.src_hash == original_meta.src_hash {
            return Err(UpdateError::HashUnchanged);
        }

        // ====================================================================
        // Rebuild impact
        // ====================================================================

        let estimate_start = Instant::now();
        let estimate = estimator
            .estimate(&self.evaluator, &attr_path)
            .await
            .map_err(UpdateError::at("rebuild estimation"))?;
        stats.estimate_duration_ms = estimate_start.elapsed().as_millis() as u64;

        for limit in &opts.ecosystem_limits {
            if attr_path.as_str().starts_with(&limit.attr_prefix)
                && estimate.count > limit.max_rebuilds
            {
                return Err(UpdateError::RebuildCountVetoed {
                    ecosystem: limit.attr_prefix.clone(),
                    rebuilds: estimate.count,
                    limit: limit.max_rebuilds,
                });
            }
        }
        if estimate.count == 0 {
            return Err(UpdateError::ZeroRebuilds);
        }

        // ====================================================================
        // Build
        // ====================================================================

        info!(attr = %attr_path, "Starting build");
        let build_start = Instant::now();
        let report = self
            .evaluator
            .build(attr_path.as_str())
            .await
            .map_err(UpdateError::at("build"))?;
        stats.build_duration_ms = build_start.elapsed().as_millis() as u64;
        if !report.success {
            return Err(UpdateError::BuildFailed(report.tail(BUILD_LOG_TAIL_LINES)));
        }
        info!(duration_ms = stats.build_duration_ms, "Build completed");

        let outputs = self
            .evaluator
            .outputs(&attr_path)
            .await
            .map_err(UpdateError::at("output listing"))?;
        if opts.push_to_cache {
            if let BestEffort::Degraded(reason) =
                BestEffort::from_result(self.evaluator.push_to_cache(&outputs).await)
            {
                warn!(%reason, "Binary cache push failed");
            }
        }

        // ====================================================================
        // Publish
        // ====================================================================

        let target_branch = if estimate.count < opts.staging_rebuild_threshold {
            opts.trunk_branch.clone()
        } else {
            opts.staging_branch.clone()
        };

        let source_url = candidate
            .source_url
            .as_deref()
            .or(edited_meta.src_url.as_deref());
        let (release_url, compare_url) = match source_url {
            Some(url) => self.source_links(candidate, url).await,
            None => (None, None),
        };

        if let BestEffort::Done(diff) = BestEffort::from_result(self.vcs.diff().await) {
            debug!(%diff, "Definition changes");
        }

        let cve_report = self.cve_report(candidate, &edited_meta).await;
        let head_commit = self
            .vcs
            .head_commit()
            .await
            .map_err(UpdateError::at("head commit"))?;

        let summary = ChangeSummary {
            candidate,
            attr_path: &attr_path,
            meta: &edited_meta,
            release_url,
            compare_url,
            rewrite_messages: rewrites.into_iter().filter_map(|r| r.message).collect(),
            rebuild_count: estimate.count,
            head_commit,
            outputs,
            cve_report,
            target_branch: target_branch.clone(),
        };
        let description = summary.description();

        self.vcs
            .commit(&summary.commit_message())
            .await
            .map_err(UpdateError::at("commit"))?;

        let change_url = if opts.submit_changes {
            let branch = candidate.branch_name();
            self.push_with_retries(&branch).await?;

            let change = ChangeRequest {
                head_branch: branch,
                base_branch: target_branch.clone(),
                title: summary.title(),
                body: description.clone(),
            };
            let url = self
                .host
                .submit_change(&change)
                .await
                .map_err(UpdateError::at("change submission"))?;
            info!(%url, "Change submitted");
            Some(url)
        } else {
            info!(%description, "Submission disabled, commit left local");
            None
        };

        Ok(UpdateOutcome {
            attr_path,
            rebuild_count: estimate.count,
            target_branch,
            change_url,
            description,
            stats,
        })
    }

    /// Rejects the candidate if a long-lived branch no longer carries the
    /// old version.
    ///
    /// Leaves the working tree at the last checked branch.
    async fn check_not_updated_on_branches(
        &self,
        candidate: &Candidate,
        meta: &PackageMeta,
    ) -> Result<(), UpdateError> {
        let old_version_pattern = format!("{}\"", candidate.old_version);

        for branch in &candidate.options.update_check_branches {
            // Current ref: `branch`. Read the file before the next checkout.
            self.vcs
                .reset_hard(&self.vcs.remote_ref(branch))
                .await
                .map_err(UpdateError::at("branch checkout"))?;

            let contents = match tokio::fs::read_to_string(&meta.file).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(%branch, "Definition file absent on branch");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !contents.contains(&old_version_pattern) {
                return Err(UpdateError::AlreadyUpdated(branch.clone()));
            }
        }
        Ok(())
    }

    async fn run_rewriters(
        &self,
        ctx: &RewriteContext<'_>,
    ) -> Result<Vec<RewriteOutcome>, UpdateError> {
        let mut outcomes = Vec::new();
        for step in &self.rewriters {
            match step.rewrite(ctx).await {
                Ok(Some(outcome)) => {
                    info!(step = step.name(), "Rewrite applied");
                    outcomes.push(outcome);
                }
                Ok(None) => debug!(step = step.name(), "Rewrite not applicable"),
                Err(source) => {
                    return Err(UpdateError::RewriteFailed {
                        step: step.name(),
                        source,
                    })
                }
            }
        }
        Ok(outcomes)
    }

    async fn push_with_retries(&self, branch: &str) -> Result<(), UpdateError> {
        let mut last_error = String::new();
        for attempt in 1..=PUSH_ATTEMPTS {
            match self.vcs.push(branch).await {
                Ok(()) => {
                    debug!(attempt, "Push succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Push failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(UpdateError::PushFailed {
            attempts: PUSH_ATTEMPTS,
            last_error,
        })
    }

    async fn source_links(
        &self,
        candidate: &Candidate,
        source_url: &str,
    ) -> (Option<String>, Option<String>) {
        let release = self
            .host
            .release_url(source_url, &candidate.new_version)
            .await;
        let compare = self
            .host
            .compare_url(source_url, &candidate.old_version, &candidate.new_version)
            .await;

        let flatten = |result: BestEffort<Option<String>>| match result {
            BestEffort::Done(url) => url,
            BestEffort::Degraded(reason) => {
                debug!(%reason, "Source link unavailable");
                None
            }
        };
        (
            flatten(BestEffort::from_result(release)),
            flatten(BestEffort::from_result(compare)),
        )
    }

    async fn cve_report(&self, candidate: &Candidate, meta: &PackageMeta) -> CveReport {
        let result = cve::correlate(
            &self.vulns,
            &candidate.package_name,
            &candidate.old_version,
            &candidate.new_version,
            &meta.patches,
        )
        .await;
        match BestEffort::from_result(result) {
            BestEffort::Done(report) => report,
            BestEffort::Degraded(reason) => {
                warn!(%reason, "CVE correlation failed, reporting it as unavailable");
                CveReport::unavailable(reason)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateOptions;
    use crate::fakes::{FakeCodeHost, FakeEvaluator, FakeVcs, FakeVulnDb};
    use crate::model::BuildReport;
    use crate::outpaths::{Outpath, OutpathSet};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    const DEFINITION: &str = "{ fetchurl }:\nrec {\n  pname = \"foo\";\n  version = \"1.2\";\n  src = fetchurl {\n    url = \"https://example.org/foo-${version}.tar.gz\";\n    hash = \"sha256-oldsrc\";\n  };\n}\n";

    type TestPipeline = UpdatePipeline<FakeEvaluator, FakeVcs, FakeCodeHost, FakeVulnDb>;

    struct Fixture {
        _dir: tempfile::TempDir,
        file: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("default.nix");
        std::fs::write(&file, DEFINITION).unwrap();
        Fixture { _dir: dir, file }
    }

    fn outpaths(entries: &[(&str, &str)]) -> OutpathSet {
        entries
            .iter()
            .map(|(p, s)| Outpath::new(*p, "out", *s))
            .collect()
    }

    fn evaluator(file: &Path) -> FakeEvaluator {
        FakeEvaluator::new()
            .with_definition(file, "https://example.org/foo-${version}.tar.gz")
            .with_build("foo.src", BuildReport {
                success: false,
                log: "error: hash mismatch\n  got:    sha256-newsrc\n".into(),
            })
            .with_outpaths(vec![
                outpaths(&[("foo", "/a"), ("bar", "/b")]),
                outpaths(&[("foo", "/a2"), ("bar", "/b")]),
            ])
    }

    fn vcs(file: &Path) -> FakeVcs {
        FakeVcs::new(file).with_branch_file("origin/master", DEFINITION)
    }

    fn pipeline(file: &Path) -> TestPipeline {
        UpdatePipeline::new(evaluator(file), vcs(file), FakeCodeHost::new(), FakeVulnDb::new())
    }

    fn candidate() -> Candidate {
        Candidate::new("foo", "1.2", "1.3", UpdateOptions::default())
            .with_source_url("https://example.org/foo-1.3.tar.gz")
    }

    fn estimator() -> RebuildEstimator {
        RebuildEstimator::new(true, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_successful_update_targets_trunk() {
        let fx = fixture();
        let pipeline = pipeline(&fx.file);

        let outcome = pipeline.execute(&candidate(), &mut estimator()).await.unwrap();

        assert_eq!(outcome.rebuild_count, 1);
        assert_eq!(outcome.target_branch, "master");
        assert!(outcome.change_url.is_some());
        assert!(!outcome.description.contains("Security vulnerability report"));

        let submitted = pipeline.host().submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].base_branch, "master");
        assert_eq!(submitted[0].title, "foo: 1.2 -> 1.3");
        assert_eq!(pipeline.vcs().count("push"), 1);
        assert_eq!(pipeline.vcs().last_call().as_deref(), Some("reset_hard origin/master"));
    }

    #[tokio::test]
    async fn test_version_not_newer_touches_nothing() {
        let fx = fixture();
        let pipeline = pipeline(&fx.file);
        let candidate = Candidate::new("foo", "1.3", "1.3", UpdateOptions::default());

        let err = pipeline.execute(&candidate, &mut estimator()).await.unwrap_err();

        assert!(matches!(err, UpdateError::VersionNotNewer { .. }));
        assert!(pipeline.vcs().calls().is_empty());
        assert_eq!(std::fs::read_to_string(&fx.file).unwrap(), DEFINITION);
    }

    #[tokio::test]
    async fn test_blacklisted_name_rejected_first() {
        let fx = fixture();
        let pipeline = pipeline(&fx.file);
        let candidate = Candidate::new("r-ggplot2", "1.2", "1.3", UpdateOptions::default());

        let err = pipeline.execute(&candidate, &mut estimator()).await.unwrap_err();
        assert_eq!(err.kind(), "blacklist_rejection");
        assert_eq!(pipeline.evaluator().calls("compare_versions"), 0);
    }

    #[tokio::test]
    async fn test_no_rewrites_skips_build() {
        let fx = fixture();
        let pipeline = pipeline(&fx.file).with_rewriters(Vec::new());

        let err = pipeline.execute(&candidate(), &mut estimator()).await.unwrap_err();

        assert!(matches!(err, UpdateError::NoChange));
        assert_eq!(pipeline.evaluator().calls("build"), 0);
        assert_eq!(pipeline.vcs().last_call().as_deref(), Some("reset_hard origin/master"));
    }

    #[tokio::test]
    async fn test_duplicate_submission() {
        let fx = fixture();
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file),
            vcs(&fx.file),
            FakeCodeHost::new().with_open_change("https://github.com/NixOS/nixpkgs/pull/1"),
            FakeVulnDb::new(),
        );

        let err = pipeline.execute(&candidate(), &mut estimator()).await.unwrap_err();
        assert!(matches!(err, UpdateError::DuplicateSubmission(_)));
    }

    #[tokio::test]
    async fn test_already_updated_on_staging() {
        let fx = fixture();
        let updated = DEFINITION.replace("\"1.2\"", "\"1.3\"");
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file),
            vcs(&fx.file).with_branch_file("origin/staging", &updated),
            FakeCodeHost::new(),
            FakeVulnDb::new(),
        );

        let err = pipeline.execute(&candidate(), &mut estimator()).await.unwrap_err();
        match err {
            UpdateError::AlreadyUpdated(branch) => assert_eq!(branch, "staging"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_build_failure_reports_log_tail() {
        let fx = fixture();
        let log = (1..=50).map(|i| format!("build line {i}")).collect::<Vec<_>>().join("\n");
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file).with_build("foo", BuildReport { success: false, log }),
            vcs(&fx.file),
            FakeCodeHost::new(),
            FakeVulnDb::new(),
        );

        let err = pipeline.execute(&candidate(), &mut estimator()).await.unwrap_err();
        match err {
            UpdateError::BuildFailed(tail) => {
                assert_eq!(tail.lines().count(), 30);
                assert!(tail.ends_with("build line 50"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pipeline.vcs().count("commit"), 0);
    }

    #[tokio::test]
    async fn test_push_retried_then_succeeds() {
        let fx = fixture();
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file),
            vcs(&fx.file).with_failing_pushes(2),
            FakeCodeHost::new(),
            FakeVulnDb::new(),
        );

        pipeline.execute(&candidate(), &mut estimator()).await.unwrap();
        assert_eq!(pipeline.vcs().count("push"), 3);
    }

    #[tokio::test]
    async fn test_push_fails_after_three_attempts() {
        let fx = fixture();
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file),
            vcs(&fx.file).with_failing_pushes(5),
            FakeCodeHost::new(),
            FakeVulnDb::new(),
        );

        let err = pipeline.execute(&candidate(), &mut estimator()).await.unwrap_err();
        assert!(matches!(err, UpdateError::PushFailed { attempts: 3, .. }));
        assert_eq!(pipeline.vcs().count("push"), 3);
        assert!(pipeline.host().submitted().is_empty());
    }

    #[tokio::test]
    async fn test_zero_rebuilds_rejected() {
        let fx = fixture();
        let same = outpaths(&[("foo", "/a")]);
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file).with_outpaths(vec![same.clone(), same]),
            vcs(&fx.file),
            FakeCodeHost::new(),
            FakeVulnDb::new(),
        );

        let err = pipeline.execute(&candidate(), &mut estimator()).await.unwrap_err();
        assert!(matches!(err, UpdateError::ZeroRebuilds));
        assert!(!pipeline.evaluator().built().contains(&"foo".to_string()));
    }

    #[tokio::test]
    async fn test_python_rebuild_veto() {
        let fx = fixture();
        let before: OutpathSet = (0..30)
            .map(|i| Outpath::new(format!("python3Packages.p{i}"), "out", "/old"))
            .collect();
        let after: OutpathSet = (0..30)
            .map(|i| Outpath::new(format!("python3Packages.p{i}"), "out", "/new"))
            .collect();
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file)
                .with_attr_path("foo", "python3Packages.foo")
                .with_build("python3Packages.foo.src", BuildReport {
                    success: false,
                    log: "got: sha256-newsrc\n".into(),
                })
                .with_outpaths(vec![before, after]),
            vcs(&fx.file),
            FakeCodeHost::new(),
            FakeVulnDb::new(),
        );

        let err = pipeline.execute(&candidate(), &mut estimator()).await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::RebuildCountVetoed { rebuilds: 30, limit: 25, .. }
        ));
    }

    #[tokio::test]
    async fn test_large_impact_targets_staging() {
        let fx = fixture();
        let before: OutpathSet = (0..120)
            .map(|i| Outpath::new(format!("p{i}"), "out", "/old"))
            .collect();
        let after: OutpathSet = (0..120)
            .map(|i| Outpath::new(format!("p{i}"), "out", "/new"))
            .collect();
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file).with_outpaths(vec![before, after]),
            vcs(&fx.file),
            FakeCodeHost::new(),
            FakeVulnDb::new(),
        );

        let outcome = pipeline.execute(&candidate(), &mut estimator()).await.unwrap();
        assert_eq!(outcome.rebuild_count, 120);
        assert_eq!(outcome.target_branch, "staging");
        assert_eq!(pipeline.host().submitted()[0].base_branch, "staging");
    }

    #[tokio::test]
    async fn test_submission_disabled_keeps_commit_local() {
        let fx = fixture();
        let pipeline = pipeline(&fx.file);
        let mut candidate = candidate();
        candidate.options.submit_changes = false;

        let outcome = pipeline.execute(&candidate, &mut estimator()).await.unwrap();

        assert!(outcome.change_url.is_none());
        assert_eq!(pipeline.vcs().count("commit"), 1);
        assert_eq!(pipeline.vcs().count("push"), 0);
        assert!(pipeline.host().submitted().is_empty());
    }

    #[tokio::test]
    async fn test_cve_report_included_when_present() {
        let fx = fixture();
        let record = crate::model::VulnerabilityRecord {
            id: "CVE-2024-0001".to_string(),
            affected_version_range: "<1.3".to_string(),
            description: None,
        };
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file),
            vcs(&fx.file),
            FakeCodeHost::new(),
            FakeVulnDb::new().with_record("foo", "1.2", record),
        );

        let outcome = pipeline.execute(&candidate(), &mut estimator()).await.unwrap();
        assert!(outcome.description.contains("CVEs resolved by this update"));
        assert!(outcome.description.contains("CVE-2024-0001"));
    }

    #[tokio::test]
    async fn test_cve_outage_is_visible_in_description() {
        let fx = fixture();
        let pipeline = UpdatePipeline::new(
            evaluator(&fx.file),
            vcs(&fx.file),
            FakeCodeHost::new(),
            FakeVulnDb::new().with_outage("db unreachable"),
        );

        let outcome = pipeline.execute(&candidate(), &mut estimator()).await.unwrap();

        assert!(outcome
            .description
            .contains("CVE report unavailable: HTTP error: db unreachable"));
        let submitted = pipeline.host().submitted();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].body.contains("CVE report unavailable"));
    }

    #[tokio::test]
    async fn test_baseline_shared_across_runs() {
        let fx = fixture();
        let pipeline = pipeline(&fx.file);
        let mut estimator = estimator();

        pipeline.execute(&candidate(), &mut estimator).await.unwrap();
        // Second run: baseline is fresh, only the edited tree is evaluated.
        let _ = pipeline.execute(&candidate(), &mut estimator).await;

        assert_eq!(pipeline.evaluator().calls("eval_outpaths"), 3);
    }
}
