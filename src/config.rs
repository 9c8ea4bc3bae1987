//! Runtime configuration.
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object (or no file at all) is a valid configuration. CLI flags override
//! the loaded values in `main`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::update::blacklist::Rule;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub update: UpdateOptions,
    pub throttle: ThrottleConfig,
    pub github: GitHubConfig,
    pub blacklist: BlacklistConfig,
    /// JSON file of vulnerability records; CVE reports are skipped without it.
    pub vulnerability_db: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Maximum rebuild count tolerated for attribute paths with a given prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcosystemLimit {
    pub attr_prefix: String,
    pub max_rebuilds: usize,
}

/// Options carried by every candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    /// Open a change request after pushing
    pub submit_changes: bool,

    /// Push build outputs to the binary cache
    pub push_to_cache: bool,

    /// Evaluate the whole tree to count rebuilds
    pub estimate_impact: bool,

    pub trunk_branch: String,
    pub staging_branch: String,

    /// Long-lived branches checked for an already-landed update
    pub update_check_branches: Vec<String>,

    /// Changes with at least this many rebuilds target the staging branch
    pub staging_rebuild_threshold: usize,

    pub ecosystem_limits: Vec<EcosystemLimit>,

    /// Age after which the merge-base outpaths are recomputed (seconds)
    pub baseline_max_age_secs: u64,

    /// Binary cache receiving build outputs
    pub cache_name: Option<String>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            submit_changes: true,
            push_to_cache: false,
            estimate_impact: true,
            trunk_branch: "master".to_string(),
            staging_branch: "staging".to_string(),
            update_check_branches: vec![
                "master".to_string(),
                "staging".to_string(),
                "staging-next".to_string(),
            ],
            staging_rebuild_threshold: 100,
            ecosystem_limits: vec![EcosystemLimit {
                attr_prefix: "python".to_string(),
                max_rebuilds: 25,
            }],
            baseline_max_age_secs: 60 * 60,
            cache_name: None,
        }
    }
}

impl UpdateOptions {
    pub fn baseline_max_age(&self) -> Duration {
        Duration::from_secs(self.baseline_max_age_secs)
    }
}

/// CI backpressure settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub threshold: u64,
    pub interval_secs: u64,
    /// URL returning JSON with the queue depth
    pub signal_url: String,
    /// JSON pointer to the queue depth inside the response
    pub signal_pointer: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 2,
            interval_secs: 60,
            signal_url: "https://events.ofborg.org/stats.php".to_string(),
            signal_pointer: "/evaluator/messages/waiting".to_string(),
        }
    }
}

impl ThrottleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_url: String,
    /// Upstream `owner/repo` receiving change requests
    pub repository: String,
    /// Owner of the fork the working branches are pushed to
    pub fork_owner: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            repository: "NixOS/nixpkgs".to_string(),
            fork_owner: None,
            token: None,
        }
    }
}

/// Rules appended to the built-in blacklist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub names: Vec<Rule>,
    pub urls: Vec<Rule>,
    pub contents: Vec<Rule>,
}
