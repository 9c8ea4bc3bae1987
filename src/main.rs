//! pkgs-update - automated package version bumps
//!
//! ## Commands
//!
//! - `update`: run the update pipeline for one package
//! - `update-batch`: run it for every line of a candidate file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use pkgs_update::cve::JsonVulnerabilityDb;
use pkgs_update::git::GitRepo;
use pkgs_update::github::GitHubClient;
use pkgs_update::nix::NixEvaluator;
use pkgs_update::update::Blacklist;
use pkgs_update::{
    init_tracing, BatchDriver, Candidate, CommandExecutor, Config, HttpLoadSignal,
    RebuildEstimator, RunLog, Throttle, UpdatePipeline,
};

#[derive(Parser)]
#[command(name = "pkgs-update")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Automated package version bumps", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Commit locally instead of pushing and opening a pull request
    #[arg(long, global = true)]
    no_submit: bool,

    /// Push build outputs to the configured binary cache
    #[arg(long, global = true)]
    push_to_cache: bool,

    /// Skip rebuild impact estimation
    #[arg(long, global = true)]
    no_impact: bool,

    /// Package repository checkout
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// GitHub API token used to open pull requests
    #[arg(long, global = true, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update a single package
    Update {
        package: String,
        old_version: String,
        new_version: String,
        /// Source URL of the new version
        source_url: Option<String>,
    },

    /// Update every candidate listed in a file
    UpdateBatch {
        /// One `<package> <old> <new> [url]` per line
        file: PathBuf,
    },
}

type Pipeline = UpdatePipeline<NixEvaluator, GitRepo, GitHubClient, JsonVulnerabilityDb>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(&cli)?;
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("pkgs-update/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let pipeline = build_pipeline(&cli.repo, &config, http_client.clone())?;
    let estimator = RebuildEstimator::new(
        config.update.estimate_impact,
        config.update.baseline_max_age(),
    );

    match cli.command {
        Commands::Update {
            package,
            old_version,
            new_version,
            source_url,
        } => {
            let mut candidate =
                Candidate::new(package, old_version, new_version, config.update.clone());
            candidate.source_url = source_url;
            cmd_update(&pipeline, estimator, candidate).await
        }
        Commands::UpdateBatch { file } => {
            cmd_update_batch(&pipeline, estimator, &config, http_client, &file).await
        }
    }
}

/// Config file, then command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    if cli.no_submit {
        config.update.submit_changes = false;
    }
    if cli.push_to_cache {
        config.update.push_to_cache = true;
    }
    if cli.no_impact {
        config.update.estimate_impact = false;
    }
    if cli.github_token.is_some() {
        config.github.token = cli.github_token.clone();
    }
    Ok(config)
}

fn build_pipeline(repo: &Path, config: &Config, http_client: reqwest::Client) -> Result<Pipeline> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Repository {} not found", repo.display()))?;
    let executor = CommandExecutor::new(&repo);

    let vulns = match &config.vulnerability_db {
        Some(path) => JsonVulnerabilityDb::load(path)
            .with_context(|| format!("Failed to load vulnerability database {}", path.display()))?,
        None => JsonVulnerabilityDb::default(),
    };

    let evaluator =
        NixEvaluator::new(executor.clone()).with_cache(config.update.cache_name.clone());
    let vcs = GitRepo::new(executor)
        .with_branches(&config.update.trunk_branch, &config.update.staging_branch);
    let host = GitHubClient::new(config.github.clone(), http_client);

    Ok(UpdatePipeline::new(evaluator, vcs, host, vulns)
        .with_blacklist(Blacklist::from_config(&config.blacklist)))
}

async fn cmd_update(
    pipeline: &Pipeline,
    mut estimator: RebuildEstimator,
    candidate: Candidate,
) -> Result<()> {
    let mut log = RunLog::Stdout;
    log.record(&candidate.to_string());

    match pipeline.execute(&candidate, &mut estimator).await {
        Ok(outcome) => {
            match &outcome.change_url {
                Some(url) => log.record(&format!("{} SUCCESS {}", candidate, url)),
                None => log.record(&format!(
                    "{} SUCCESS committed locally ({} rebuilds, target {})",
                    candidate, outcome.rebuild_count, outcome.target_branch
                )),
            }
            println!("\n{}", outcome.description);
            Ok(())
        }
        Err(e) => {
            log.record(&format!("{} FAIL [{}] {}", candidate, e.kind(), e));
            Err(e).context(format!("Update of {} failed", candidate))
        }
    }
}

async fn cmd_update_batch(
    pipeline: &Pipeline,
    estimator: RebuildEstimator,
    config: &Config,
    http_client: reqwest::Client,
    file: &Path,
) -> Result<()> {
    let input = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let log = RunLog::daily_in_cache_dir();
    if let Some(path) = log.current_file() {
        info!(log = %path.display(), "Writing run log");
    }

    let mut driver = BatchDriver::new(pipeline, estimator, log);
    if config.throttle.enabled {
        let signal = HttpLoadSignal::new(http_client, &config.throttle);
        driver = driver.with_throttle(
            Throttle::new(signal)
                .with_threshold(config.throttle.threshold)
                .with_interval(config.throttle.interval()),
        );
    }

    info!(
        impact_estimation = driver.estimator().enabled(),
        throttled = config.throttle.enabled,
        "Starting batch run"
    );
    let summary = driver.run_input(&input, &config.update).await;
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        retried = summary.retried,
        unparsable = summary.unparsable,
        "Run complete"
    );
    Ok(())
}
