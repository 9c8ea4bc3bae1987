//! Batch driver: runs the pipeline over a list of candidates.
//!
//! Candidates are processed strictly one at a time. A failed candidate never
//! stops the batch; a failed bump to `X.0` is retried once as `X` right away.

use chrono::Utc;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::UpdateOptions;
use crate::model::Candidate;
use crate::outpaths::RebuildEstimator;
use crate::throttle::Throttle;
use crate::traits::{CodeHost, Evaluator, LoadSignal, Vcs, VulnerabilityDb};
use crate::update::pipeline::{BestEffort, UpdatePipeline};

/// Where candidate outcomes are reported.
#[derive(Debug)]
pub enum RunLog {
    /// Immediate standard output (single-package mode)
    Stdout,
    /// One append-only file per UTC day under `dir` (batch mode)
    DailyFile { dir: PathBuf },
    /// Kept in memory
    Memory(Vec<String>),
}

impl RunLog {
    /// Daily log files under the user cache directory.
    pub fn daily_in_cache_dir() -> Self {
        let dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pkgs-update")
            .join("logs");
        RunLog::DailyFile { dir }
    }

    /// Path of today's log file, for [`RunLog::DailyFile`].
    pub fn current_file(&self) -> Option<PathBuf> {
        match self {
            RunLog::DailyFile { dir } => {
                Some(dir.join(format!("{}.log", Utc::now().format("%Y-%m-%d"))))
            }
            _ => None,
        }
    }

    /// Appends one line. Failing to write the log file is not fatal.
    pub fn record(&mut self, line: &str) {
        let path = self.current_file();
        match (self, path) {
            (RunLog::Stdout, _) => println!("{}", line),
            (RunLog::Memory(lines), _) => lines.push(line.to_string()),
            (RunLog::DailyFile { dir }, path) => {
                let stamped = format!("{} {}", Utc::now().format("%H:%M:%S"), line);
                let written = std::fs::create_dir_all(&*dir).and_then(|_| {
                    let path = path.unwrap_or_else(|| dir.join("run.log"));
                    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                    writeln!(file, "{}", stamped)
                });
                if let Err(e) = written {
                    warn!(error = %e, "Failed to write run log");
                }
            }
        }
    }

    pub fn lines(&self) -> &[String] {
        match self {
            RunLog::Memory(lines) => lines,
            _ => &[],
        }
    }
}

/// Counts of a finished batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Derived `.0`-stripped candidates enqueued
    pub retried: usize,
    pub unparsable: usize,
}

/// Runs candidates through an [`UpdatePipeline`], sharing one estimator.
pub struct BatchDriver<'p, E, V, H, D, S>
where
    E: Evaluator,
    V: Vcs,
    H: CodeHost,
    D: VulnerabilityDb,
    S: LoadSignal,
{
    pipeline: &'p UpdatePipeline<E, V, H, D>,
    estimator: RebuildEstimator,
    throttle: Option<Throttle<S>>,
    log: RunLog,
}

impl<'p, E, V, H, D, S> BatchDriver<'p, E, V, H, D, S>
where
    E: Evaluator,
    V: Vcs,
    H: CodeHost,
    D: VulnerabilityDb,
    S: LoadSignal,
{
    pub fn new(
        pipeline: &'p UpdatePipeline<E, V, H, D>,
        estimator: RebuildEstimator,
        log: RunLog,
    ) -> Self {
        Self {
            pipeline,
            estimator,
            throttle: None,
            log,
        }
    }

    /// Waits on `throttle` before every candidate.
    pub fn with_throttle(mut self, throttle: Throttle<S>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn estimator(&self) -> &RebuildEstimator {
        &self.estimator
    }

    /// Parses `input` line by line and runs every candidate.
    ///
    /// Unparsable lines are logged and skipped.
    pub async fn run_input(&mut self, input: &str, options: &UpdateOptions) -> BatchSummary {
        let mut candidates = Vec::new();
        let mut unparsable = 0;
        for line in input.lines() {
            match Candidate::parse_line(line, options) {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(e) => {
                    unparsable += 1;
                    self.log.record(&format!("{} UNPARSABLE {}", line.trim(), e));
                }
            }
        }

        let mut summary = self.run(candidates).await;
        summary.unparsable = unparsable;
        summary
    }

    /// Runs the queue to exhaustion.
    pub async fn run(&mut self, candidates: Vec<Candidate>) -> BatchSummary {
        let mut queue: VecDeque<Candidate> = candidates.into();
        let mut summary = BatchSummary::default();

        info!(candidates = queue.len(), "Starting batch");
        while let Some(candidate) = queue.pop_front() {
            if let Some(throttle) = &self.throttle {
                throttle.wait_for_capacity().await;
            }

            self.log.record(&candidate.to_string());
            match self.pipeline.execute(&candidate, &mut self.estimator).await {
                Ok(outcome) => {
                    summary.succeeded += 1;
                    let line = match &outcome.change_url {
                        Some(url) => format!("{} SUCCESS {}", candidate, url),
                        None => format!(
                            "{} SUCCESS committed locally ({} rebuilds)",
                            candidate, outcome.rebuild_count
                        ),
                    };
                    self.log.record(&line);
                }
                Err(e) => {
                    summary.failed += 1;
                    self.log
                        .record(&format!("{} FAIL [{}] {}", candidate, e.kind(), e));
                    self.cleanup(&candidate).await;

                    if let Some(derived) = candidate.without_trailing_zero() {
                        self.log.record(&format!(
                            "{} RETRY as {}",
                            candidate, derived.new_version
                        ));
                        summary.retried += 1;
                        queue.push_front(derived);
                    }
                }
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            retried = summary.retried,
            "Batch finished"
        );
        summary
    }

    /// Deletes the working branch if the failed run got far enough to create it.
    async fn cleanup(&self, candidate: &Candidate) {
        let branch = candidate.branch_name();
        let vcs = self.pipeline.vcs();
        match vcs.branch_exists(&branch).await {
            Ok(false) => {
                debug!(%branch, "No working branch to clean up");
                return;
            }
            Ok(true) => {}
            Err(e) => warn!(%branch, error = %e, "Could not check for working branch"),
        }

        let result = vcs.delete_branch(&branch).await;
        if let BestEffort::Degraded(reason) = BestEffort::from_result(result) {
            warn!(%branch, %reason, "Working branch cleanup failed");
        }
    }
}
