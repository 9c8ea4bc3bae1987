//! Build-output identities and rebuild-impact estimation.
//!
//! The estimator owns the only state shared across candidates: the outpaths
//! evaluated at the merge base. It is handed to each pipeline run as
//! `&mut RebuildEstimator`, so there is exactly one owner and no locking.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::model::AttrPath;
use crate::traits::{CollaboratorResult, Evaluator};

/// Identity of one build output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Outpath {
    /// Package identifier (attribute path)
    pub package: String,
    /// Output name, e.g. `out` or `dev`
    pub output: String,
    /// Store path of the output
    pub path: String,
}

impl Outpath {
    pub fn new(
        package: impl Into<String>,
        output: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            output: output.into(),
            path: path.into(),
        }
    }
}

/// Set of build outputs of one evaluated tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutpathSet(BTreeSet<Outpath>);

impl OutpathSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, outpath: Outpath) -> bool {
        self.0.insert(outpath)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outpath> {
        self.0.iter()
    }

    /// Parses evaluator listing lines.
    ///
    /// Each line is `<attr> <outputs>` where `<outputs>` is either a single
    /// store path (the `out` output) or `name=path;name=path`. Lines that do
    /// not have both fields are ignored.
    pub fn parse(listing: &str) -> Self {
        let mut set = Self::new();
        for line in listing.lines() {
            let mut fields = line.split_whitespace();
            let (Some(attr), Some(outputs)) = (fields.next(), fields.next()) else {
                continue;
            };

            for entry in outputs.split(';').filter(|e| !e.is_empty()) {
                match entry.split_once('=') {
                    Some((output, path)) => set.insert(Outpath::new(attr, output, path)),
                    None => set.insert(Outpath::new(attr, "out", entry)),
                };
            }
        }
        set
    }

    /// Outputs present in exactly one of the two sets.
    pub fn symmetric_difference(&self, other: &Self) -> Self {
        Self(self.0.symmetric_difference(&other.0).cloned().collect())
    }

    /// Distinct package identifiers touched by this set.
    pub fn packages(&self) -> BTreeSet<&str> {
        self.0.iter().map(|o| o.package.as_str()).collect()
    }

    /// Number of distinct packages whose outputs differ between the sets.
    pub fn rebuild_count(&self, other: &Self) -> usize {
        self.symmetric_difference(other).packages().len()
    }

    /// Stand-in pair used when impact estimation is disabled.
    ///
    /// Derived from the attribute path alone; the two sets always differ in
    /// exactly one package.
    pub fn placeholder_pair(attr: &AttrPath) -> (Self, Self) {
        let mut before = Self::new();
        before.insert(Outpath::new(attr.as_str(), "out", "placeholder-before"));
        let mut after = Self::new();
        after.insert(Outpath::new(attr.as_str(), "out", "placeholder-after"));
        (before, after)
    }
}

impl FromIterator<Outpath> for OutpathSet {
    fn from_iter<I: IntoIterator<Item = Outpath>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Cached outpaths of the merge-base commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeBaseOutpathsInfo {
    pub last_computed_at: DateTime<Utc>,
    pub outpaths: OutpathSet,
}

impl MergeBaseOutpathsInfo {
    /// An empty snapshot old enough to be refreshed on first use.
    pub fn stale() -> Self {
        Self {
            last_computed_at: DateTime::<Utc>::UNIX_EPOCH,
            outpaths: OutpathSet::new(),
        }
    }
}

/// Whether the merge-base snapshot must be recomputed.
pub fn needs_refresh(
    now: DateTime<Utc>,
    last_computed_at: DateTime<Utc>,
    max_age: Duration,
    estimate_impact: bool,
) -> bool {
    if !estimate_impact {
        return false;
    }
    match (now - last_computed_at).to_std() {
        Ok(age) => age > max_age,
        // Clock went backwards; keep what we have.
        Err(_) => false,
    }
}

/// Rebuild impact of one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildEstimate {
    pub count: usize,
    /// Outputs that differ between merge base and edited tree
    pub changed: OutpathSet,
}

/// Computes rebuild counts, caching the merge-base evaluation.
#[derive(Debug)]
pub struct RebuildEstimator {
    baseline: MergeBaseOutpathsInfo,
    max_age: Duration,
    enabled: bool,
}

impl RebuildEstimator {
    pub fn new(enabled: bool, max_age: Duration) -> Self {
        Self {
            baseline: MergeBaseOutpathsInfo::stale(),
            max_age,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn baseline(&self) -> &MergeBaseOutpathsInfo {
        &self.baseline
    }

    /// Re-evaluates the merge base when the snapshot is stale.
    ///
    /// Must be called with the working tree at the merge base. Returns
    /// whether a refresh happened.
    pub async fn refresh_baseline_if_stale<E: Evaluator + ?Sized>(
        &mut self,
        evaluator: &E,
    ) -> CollaboratorResult<bool> {
        self.refresh_baseline_at(evaluator, Utc::now()).await
    }

    pub async fn refresh_baseline_at<E: Evaluator + ?Sized>(
        &mut self,
        evaluator: &E,
        now: DateTime<Utc>,
    ) -> CollaboratorResult<bool> {
        if !needs_refresh(now, self.baseline.last_computed_at, self.max_age, self.enabled) {
            debug!(
                computed_at = %self.baseline.last_computed_at,
                "Merge-base outpaths still fresh"
            );
            return Ok(false);
        }

        info!("Evaluating merge-base outpaths");
        let start = Instant::now();
        let outpaths = evaluator.eval_outpaths().await?;
        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            outputs = outpaths.len(),
            "Merge-base outpaths evaluated"
        );

        self.baseline = MergeBaseOutpathsInfo {
            last_computed_at: now,
            outpaths,
        };
        Ok(true)
    }

    /// Estimates the rebuild count of the edited working tree.
    ///
    /// The edited tree is always evaluated fresh.
    pub async fn estimate<E: Evaluator + ?Sized>(
        &self,
        evaluator: &E,
        attr: &AttrPath,
    ) -> CollaboratorResult<RebuildEstimate> {
        let changed = if self.enabled {
            let start = Instant::now();
            let edited = evaluator.eval_outpaths().await?;
            debug!(
                duration_ms = start.elapsed().as_millis() as u64,
                "Edited outpaths evaluated"
            );
            self.baseline.outpaths.symmetric_difference(&edited)
        } else {
            let (before, after) = OutpathSet::placeholder_pair(attr);
            before.symmetric_difference(&after)
        };

        let count = changed.packages().len();
        info!(attr = %attr, rebuilds = count, "Rebuild impact estimated");
        Ok(RebuildEstimate { count, changed })
    }
}
