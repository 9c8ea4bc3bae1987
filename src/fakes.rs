//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `FakeEvaluator`, `FakeVcs`, `FakeCodeHost`, `FakeVulnDb` and
//! `SequenceSignal`, which satisfy the trait contracts without running any
//! external tool and record the calls made to them.
//!
//! `FakeVcs` and `FakeEvaluator` share one definition file on disk:
//! checkouts write branch contents into it and metadata is read back from it.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::github;
use crate::model::{AttrPath, BuildReport, ChangeRequest, PackageMeta, VulnerabilityRecord};
use crate::outpaths::OutpathSet;
use crate::traits::*;
use crate::update::rewrites::quoted_binding;
use crate::version::compare_versions;

fn record(calls: &Mutex<Vec<String>>, call: impl Into<String>) {
    calls.lock().unwrap().push(call.into());
}

// ---------------------------------------------------------------------------
// FakeEvaluator
// ---------------------------------------------------------------------------

/// Evaluator deriving package metadata from the definition file's text.
///
/// `version = "..."` and `hash = "..."` bindings are read from the file;
/// the source URL is a template with `${version}` substituted.
#[derive(Debug, Default)]
pub struct FakeEvaluator {
    file: Option<PathBuf>,
    url_template: Option<String>,
    attr_paths: HashMap<String, String>,
    builds: HashMap<String, BuildReport>,
    outpaths: Mutex<VecDeque<OutpathSet>>,
    calls: Mutex<Vec<String>>,
    built: Mutex<Vec<String>>,
    cached: Mutex<Vec<String>>,
}

impl FakeEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(mut self, file: &Path, url_template: &str) -> Self {
        self.file = Some(file.to_path_buf());
        self.url_template = Some(url_template.to_string());
        self
    }

    /// Resolves `name` to `attr_path` instead of to itself.
    pub fn with_attr_path(mut self, name: &str, attr_path: &str) -> Self {
        self.attr_paths.insert(name.to_string(), attr_path.to_string());
        self
    }

    /// Build result of an attribute expression; unknown ones succeed.
    pub fn with_build(mut self, attr_expr: &str, report: BuildReport) -> Self {
        self.builds.insert(attr_expr.to_string(), report);
        self
    }

    /// Results of successive `eval_outpaths` calls; empty once exhausted.
    pub fn with_outpaths(self, sets: Vec<OutpathSet>) -> Self {
        *self.outpaths.lock().unwrap() = sets.into();
        self
    }

    /// Number of calls to `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == method).count()
    }

    /// Attribute expressions built so far, in order.
    pub fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }

    pub fn cached(&self) -> Vec<String> {
        self.cached.lock().unwrap().clone()
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn compare_versions(&self, a: &str, b: &str) -> CollaboratorResult<Ordering> {
        record(&self.calls, "compare_versions");
        Ok(compare_versions(a, b))
    }

    async fn resolve_attr_path(
        &self,
        name: &str,
        _version: &str,
    ) -> CollaboratorResult<AttrPath> {
        record(&self.calls, "resolve_attr_path");
        let path = self.attr_paths.get(name).map(String::as_str).unwrap_or(name);
        Ok(AttrPath(path.to_string()))
    }

    async fn package_meta(&self, _attr: &AttrPath) -> CollaboratorResult<PackageMeta> {
        record(&self.calls, "package_meta");
        let Some(file) = &self.file else {
            return Ok(PackageMeta::default());
        };

        let contents = tokio::fs::read_to_string(file).await?;
        let version = quoted_binding(&contents, "version")
            .unwrap_or_default()
            .to_string();
        let src_url = self
            .url_template
            .as_ref()
            .map(|t| t.replace("${version}", &version));

        Ok(PackageMeta {
            src_hash: quoted_binding(&contents, "hash").map(str::to_string),
            version,
            file: file.display().to_string(),
            src_url,
            ..Default::default()
        })
    }

    async fn eval(&self, expr: &str) -> CollaboratorResult<String> {
        record(&self.calls, "eval");
        Ok(serde_json::to_string(expr)?)
    }

    async fn build(&self, attr_expr: &str) -> CollaboratorResult<BuildReport> {
        record(&self.calls, "build");
        self.built.lock().unwrap().push(attr_expr.to_string());
        Ok(self.builds.get(attr_expr).cloned().unwrap_or(BuildReport {
            success: true,
            log: String::new(),
        }))
    }

    async fn outputs(&self, attr: &AttrPath) -> CollaboratorResult<Vec<String>> {
        record(&self.calls, "outputs");
        Ok(vec![format!("/nix/store/fake-{}", attr)])
    }

    async fn eval_outpaths(&self) -> CollaboratorResult<OutpathSet> {
        record(&self.calls, "eval_outpaths");
        Ok(self.outpaths.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn push_to_cache(&self, paths: &[String]) -> CollaboratorResult<()> {
        record(&self.calls, "push_to_cache");
        self.cached.lock().unwrap().extend(paths.iter().cloned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeVcs
// ---------------------------------------------------------------------------

/// Version control over a single definition file.
#[derive(Debug)]
pub struct FakeVcs {
    file: PathBuf,
    /// Contents written to the file when a ref is checked out
    refs: HashMap<String, String>,
    merge_base: Option<String>,
    fail_fetch: bool,
    fail_delete: bool,
    /// Local branches, created by merge-base checkouts
    branches: Mutex<Vec<String>>,
    failing_pushes: Mutex<u32>,
    calls: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            refs: HashMap::new(),
            merge_base: None,
            fail_fetch: false,
            fail_delete: false,
            branches: Mutex::new(Vec::new()),
            failing_pushes: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_branch_file(mut self, git_ref: &str, contents: &str) -> Self {
        self.refs.insert(git_ref.to_string(), contents.to_string());
        self
    }

    pub fn with_merge_base_file(mut self, contents: &str) -> Self {
        self.merge_base = Some(contents.to_string());
        self
    }

    pub fn with_failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    pub fn with_failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    /// A local branch left over from an earlier run.
    pub fn with_existing_branch(self, branch: &str) -> Self {
        self.branches.lock().unwrap().push(branch.to_string());
        self
    }

    /// The first `n` pushes are rejected.
    pub fn with_failing_pushes(self, n: u32) -> Self {
        *self.failing_pushes.lock().unwrap() = n;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose operation is `op`.
    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn last_call(&self) -> Option<String> {
        self.calls.lock().unwrap().last().cloned()
    }

    fn failed(command: &str) -> CollaboratorError {
        CollaboratorError::CommandFailed {
            command: command.to_string(),
            stderr: "simulated failure".to_string(),
        }
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn fetch_if_stale(&self) -> CollaboratorResult<()> {
        record(&self.calls, "fetch_if_stale");
        if self.fail_fetch {
            return Err(Self::failed("git fetch"));
        }
        Ok(())
    }

    async fn reset_hard(&self, git_ref: &str) -> CollaboratorResult<()> {
        record(&self.calls, format!("reset_hard {}", git_ref));
        if let Some(contents) = self.refs.get(git_ref) {
            tokio::fs::write(&self.file, contents).await?;
        }
        Ok(())
    }

    async fn checkout_at_merge_base(&self, branch: &str) -> CollaboratorResult<()> {
        record(&self.calls, format!("checkout_at_merge_base {}", branch));
        {
            let mut branches = self.branches.lock().unwrap();
            if !branches.iter().any(|b| b == branch) {
                branches.push(branch.to_string());
            }
        }
        if let Some(contents) = &self.merge_base {
            tokio::fs::write(&self.file, contents).await?;
        }
        Ok(())
    }

    async fn diff(&self) -> CollaboratorResult<String> {
        record(&self.calls, "diff");
        Ok(String::new())
    }

    async fn commit(&self, message: &str) -> CollaboratorResult<()> {
        record(&self.calls, format!("commit {}", message.lines().next().unwrap_or_default()));
        Ok(())
    }

    async fn push(&self, branch: &str) -> CollaboratorResult<()> {
        record(&self.calls, format!("push {}", branch));
        let mut failing = self.failing_pushes.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(Self::failed("git push"));
        }
        Ok(())
    }

    async fn head_commit(&self) -> CollaboratorResult<String> {
        record(&self.calls, "head_commit");
        Ok("0123456789abcdef".to_string())
    }

    async fn branch_exists(&self, branch: &str) -> CollaboratorResult<bool> {
        record(&self.calls, format!("branch_exists {}", branch));
        Ok(self.branches.lock().unwrap().iter().any(|b| b == branch))
    }

    async fn delete_branch(&self, branch: &str) -> CollaboratorResult<()> {
        record(&self.calls, format!("delete_branch {}", branch));
        if self.fail_delete {
            return Err(Self::failed("git branch -D"));
        }
        self.branches.lock().unwrap().retain(|b| b != branch);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeCodeHost
// ---------------------------------------------------------------------------

/// Code host recording submitted changes.
#[derive(Debug, Default)]
pub struct FakeCodeHost {
    open_change: Option<String>,
    submitted: Mutex<Vec<ChangeRequest>>,
}

impl FakeCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_change(mut self, url: &str) -> Self {
        self.open_change = Some(url.to_string());
        self
    }

    pub fn submitted(&self) -> Vec<ChangeRequest> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn open_change_for(
        &self,
        _package: &str,
        _new_version: &str,
    ) -> CollaboratorResult<Option<String>> {
        Ok(self.open_change.clone())
    }

    async fn submit_change(&self, change: &ChangeRequest) -> CollaboratorResult<String> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(change.clone());
        Ok(format!("https://example.test/pulls/{}", submitted.len()))
    }

    async fn release_url(
        &self,
        source_url: &str,
        new_version: &str,
    ) -> CollaboratorResult<Option<String>> {
        Ok(github::release_url(source_url, new_version))
    }

    async fn compare_url(
        &self,
        source_url: &str,
        old_version: &str,
        new_version: &str,
    ) -> CollaboratorResult<Option<String>> {
        Ok(github::compare_url(source_url, old_version, new_version))
    }
}

// ---------------------------------------------------------------------------
// FakeVulnDb
// ---------------------------------------------------------------------------

/// Vulnerability records keyed by exact product and version.
#[derive(Debug, Default)]
pub struct FakeVulnDb {
    records: HashMap<(String, String), Vec<VulnerabilityRecord>>,
    outage: Option<String>,
}

impl FakeVulnDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, product: &str, version: &str, record: VulnerabilityRecord) -> Self {
        self.records
            .entry((product.to_string(), version.to_string()))
            .or_default()
            .push(record);
        self
    }

    /// Every query fails with `reason`.
    pub fn with_outage(mut self, reason: &str) -> Self {
        self.outage = Some(reason.to_string());
        self
    }
}

#[async_trait]
impl VulnerabilityDb for FakeVulnDb {
    async fn query(
        &self,
        product: &str,
        version: &str,
    ) -> CollaboratorResult<Vec<VulnerabilityRecord>> {
        if let Some(reason) = &self.outage {
            return Err(CollaboratorError::Http(reason.clone()));
        }
        Ok(self
            .records
            .get(&(product.to_string(), version.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// SequenceSignal
// ---------------------------------------------------------------------------

/// Load signal replaying a fixed sequence; reports an idle farm afterwards.
#[derive(Debug)]
pub struct SequenceSignal {
    readings: Mutex<VecDeque<CollaboratorResult<u64>>>,
    polls: Mutex<usize>,
}

impl SequenceSignal {
    pub fn new(readings: Vec<CollaboratorResult<u64>>) -> Self {
        Self {
            readings: Mutex::new(readings.into()),
            polls: Mutex::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        *self.polls.lock().unwrap()
    }
}

#[async_trait]
impl LoadSignal for SequenceSignal {
    async fn queue_depth(&self) -> CollaboratorResult<u64> {
        *self.polls.lock().unwrap() += 1;
        self.readings.lock().unwrap().pop_front().unwrap_or(Ok(0))
    }
}
