//! End-to-end runs of the update pipeline and batch driver over fakes.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use pkgs_update::fakes::{FakeCodeHost, FakeEvaluator, FakeVcs, FakeVulnDb, SequenceSignal};
use pkgs_update::outpaths::Outpath;
use pkgs_update::update::{default_rewriters, RewriteContext, RewriteError, Rewriter};
use pkgs_update::{
    BatchDriver, BuildReport, Candidate, CollaboratorError, OutpathSet, RebuildEstimator,
    RewriteOutcome, RunLog, UpdateOptions, UpdatePipeline, VulnerabilityRecord,
};

const DEFINITION: &str = r#"{ lib, stdenv, fetchurl }:

stdenv.mkDerivation rec {
  pname = "foo";
  version = "1.2";

  src = fetchurl {
    url = "https://example.org/foo-${version}.tar.gz";
    hash = "sha256-2Yq0NdIGvt/kLPt4G2ZpL0c3Qp8oP5mVXGjHLdyAoNg=";
  };
}
"#;

const URL_TEMPLATE: &str = "https://example.org/foo-${version}.tar.gz";

type Pipeline = UpdatePipeline<FakeEvaluator, FakeVcs, FakeCodeHost, FakeVulnDb>;

fn write_definition(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let file = dir.path().join("default.nix");
    std::fs::write(&file, DEFINITION).unwrap();
    file
}

fn outpaths(entries: &[(&str, &str)]) -> OutpathSet {
    entries.iter().map(|(p, s)| Outpath::new(*p, "out", *s)).collect()
}

fn evaluator(file: &Path) -> FakeEvaluator {
    FakeEvaluator::new()
        .with_definition(file, URL_TEMPLATE)
        .with_build(
            "foo.src",
            BuildReport {
                success: false,
                log: "error: hash mismatch in fixed-output derivation\n  specified: sha256-AAAA\n     got:    sha256-newsrc=\n".into(),
            },
        )
        .with_outpaths(vec![
            outpaths(&[("foo", "/nix/store/a-foo-1.2"), ("baz", "/nix/store/b-baz")]),
            outpaths(&[("foo", "/nix/store/c-foo-1.3"), ("baz", "/nix/store/b-baz")]),
        ])
}

fn pipeline(file: &Path, vulns: FakeVulnDb) -> Pipeline {
    UpdatePipeline::new(
        evaluator(file),
        FakeVcs::new(file).with_branch_file("origin/master", DEFINITION),
        FakeCodeHost::new(),
        vulns,
    )
}

fn candidate(new_version: &str) -> Candidate {
    Candidate::new("foo", "1.2", new_version, UpdateOptions::default())
}

#[tokio::test]
async fn test_single_update_publishes_to_trunk() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_definition(&dir);
    let pipeline = pipeline(&file, FakeVulnDb::new());
    let mut estimator = RebuildEstimator::new(true, Duration::from_secs(3600));

    let outcome = pipeline.execute(&candidate("1.3"), &mut estimator).await.unwrap();

    assert_eq!(outcome.attr_path.as_str(), "foo");
    assert_eq!(outcome.rebuild_count, 1);
    assert_eq!(outcome.target_branch, "master");
    assert!(!outcome.description.contains("Security vulnerability report"));

    let submitted = pipeline.host().submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].head_branch, "auto-update/foo");
    assert_eq!(submitted[0].base_branch, "master");
    assert_eq!(outcome.change_url.as_deref(), Some("https://example.test/pulls/1"));

    // Sentinel build first, then the real one.
    assert_eq!(pipeline.evaluator().built(), vec!["foo.src", "foo"]);
    // Tree left at trunk.
    assert_eq!(std::fs::read_to_string(&file).unwrap(), DEFINITION);
}

#[tokio::test]
async fn test_single_update_reports_resolved_cve() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_definition(&dir);
    let record = VulnerabilityRecord {
        id: "CVE-2024-1234".to_string(),
        affected_version_range: "<1.3".to_string(),
        description: Some("heap overflow in parser".to_string()),
    };
    let pipeline = pipeline(&file, FakeVulnDb::new().with_record("foo", "1.2", record));
    let mut estimator = RebuildEstimator::new(true, Duration::from_secs(3600));

    let outcome = pipeline.execute(&candidate("1.3"), &mut estimator).await.unwrap();

    assert!(outcome.description.contains("Security vulnerability report"));
    assert!(outcome.description.contains("CVE-2024-1234"));
}

/// Fails every bump whose new version ends in `.0`, like a missing tarball.
struct MissingTrailingZeroRelease;

#[async_trait]
impl Rewriter for MissingTrailingZeroRelease {
    async fn rewrite(
        &self,
        ctx: &RewriteContext<'_>,
    ) -> Result<Option<RewriteOutcome>, RewriteError> {
        if ctx.candidate.new_version.ends_with(".0") {
            return Err(CollaboratorError::UnexpectedOutput(format!(
                "no release tarball for {}",
                ctx.candidate.new_version
            ))
            .into());
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "missing_release"
    }
}

#[tokio::test]
async fn test_batch_retries_trailing_zero_and_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_definition(&dir);
    let mut rewriters: Vec<Box<dyn Rewriter>> = vec![Box::new(MissingTrailingZeroRelease)];
    rewriters.extend(default_rewriters());
    let pipeline = pipeline(&file, FakeVulnDb::new()).with_rewriters(rewriters);

    let mut driver = BatchDriver::new(
        &pipeline,
        RebuildEstimator::new(true, Duration::from_secs(3600)),
        RunLog::Memory(Vec::new()),
    )
    .with_throttle(pkgs_update::Throttle::new(SequenceSignal::new(vec![])));

    let summary = driver
        .run_input(
            "# package old new\nfoo 1.2 1.3.0\n",
            &UpdateOptions::default(),
        )
        .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.succeeded, 1);

    let lines = driver.log().lines();
    assert!(lines.iter().any(|l| l.starts_with("foo 1.2 -> 1.3.0 FAIL [rewrite_failed]")));
    assert!(lines
        .iter()
        .any(|l| l == "foo 1.2 -> 1.3 SUCCESS https://example.test/pulls/1"));

    // Cleanup after the failed attempt; the baseline was evaluated once.
    assert_eq!(pipeline.vcs().count("delete_branch"), 1);
    assert_eq!(pipeline.evaluator().calls("eval_outpaths"), 2);
    assert_eq!(pipeline.host().submitted()[0].title, "foo: 1.2 -> 1.3");
}
