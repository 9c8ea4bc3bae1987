//! Packages, sources and definition files the pipeline refuses to touch.

use serde::{Deserialize, Serialize};

use crate::config::BlacklistConfig;

/// How a rule's pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Eq,
    Prefix,
    Infix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub kind: MatchKind,
    pub pattern: String,
    pub reason: String,
}

impl Rule {
    pub fn new(kind: MatchKind, pattern: &str, reason: &str) -> Self {
        Self {
            kind,
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn matches(&self, subject: &str) -> bool {
        match self.kind {
            MatchKind::Eq => subject == self.pattern,
            MatchKind::Prefix => subject.starts_with(&self.pattern),
            MatchKind::Infix => subject.contains(&self.pattern),
        }
    }
}

/// Three rule lists checked at different pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blacklist {
    names: Vec<Rule>,
    urls: Vec<Rule>,
    contents: Vec<Rule>,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self {
            names: vec![
                Rule::new(MatchKind::Prefix, "r-", "attribute paths of R packages cannot be found"),
                Rule::new(MatchKind::Infix, "jquery", "not a real package"),
                Rule::new(MatchKind::Infix, "google-cloud-sdk", "complicated package"),
                Rule::new(MatchKind::Infix, "github-release", "complicated package"),
                Rule::new(MatchKind::Infix, "gst", "gstreamer plugins are kept in lockstep"),
                Rule::new(MatchKind::Infix, "electron", "multi-platform sources in one file"),
                Rule::new(MatchKind::Eq, "cdrtools", "repeatedly downgraded by accident"),
            ],
            urls: vec![Rule::new(
                MatchKind::Infix,
                "archive.org",
                "archived sources never change",
            )],
            contents: vec![
                Rule::new(
                    MatchKind::Infix,
                    "nixpkgs-update: no auto update",
                    "definition opts out of automatic updates",
                ),
                Rule::new(MatchKind::Infix, "DO NOT EDIT", "definition says not to edit it"),
                Rule::new(MatchKind::Infix, "Do not edit!", "definition says not to edit it"),
            ],
        }
    }
}

impl Blacklist {
    /// Default rules extended with configured ones.
    pub fn from_config(config: &BlacklistConfig) -> Self {
        let mut list = Self::default();
        list.names.extend(config.names.iter().cloned());
        list.urls.extend(config.urls.iter().cloned());
        list.contents.extend(config.contents.iter().cloned());
        list
    }

    fn first_match<'a>(rules: &'a [Rule], subject: &str) -> Option<&'a str> {
        rules
            .iter()
            .find(|r| r.matches(subject))
            .map(|r| r.reason.as_str())
    }

    /// Reason the package name is rejected, if it is.
    pub fn check_name(&self, name: &str) -> Option<&str> {
        Self::first_match(&self.names, name)
    }

    pub fn check_url(&self, url: &str) -> Option<&str> {
        Self::first_match(&self.urls, url)
    }

    pub fn check_content(&self, content: &str) -> Option<&str> {
        Self::first_match(&self.contents, content)
    }
}
