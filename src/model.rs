use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::UpdateOptions;
use crate::traits::ParseError;

/// One proposed package/version bump under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub package_name: String,
    pub old_version: String,
    pub new_version: String,
    pub source_url: Option<String>,
    pub options: UpdateOptions,
}

impl Candidate {
    pub fn new(
        package_name: impl Into<String>,
        old_version: impl Into<String>,
        new_version: impl Into<String>,
        options: UpdateOptions,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            old_version: old_version.into(),
            new_version: new_version.into(),
            source_url: None,
            options,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Parses `<package> <old> <new> [url]`.
    ///
    /// Returns `Ok(None)` for blank lines and `#` comments.
    pub fn parse_line(line: &str, options: &UpdateOptions) -> Result<Option<Self>, ParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [name, old, new] => Ok(Some(Self::new(*name, *old, *new, options.clone()))),
            [name, old, new, url] => Ok(Some(
                Self::new(*name, *old, *new, options.clone()).with_source_url(*url),
            )),
            _ => Err(ParseError::InvalidContent(format!(
                "expected `<package> <old> <new> [url]`, got {:?}",
                line
            ))),
        }
    }

    /// Working branch used for this candidate's commit.
    pub fn branch_name(&self) -> String {
        format!("auto-update/{}", self.package_name)
    }

    /// Derives the retry candidate for a failed bump ending in `.0`.
    pub fn without_trailing_zero(&self) -> Option<Self> {
        let stripped = self.new_version.strip_suffix(".0")?;
        if stripped.is_empty() {
            return None;
        }
        Some(Self {
            new_version: stripped.to_string(),
            ..self.clone()
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.package_name, self.old_version, self.new_version
        )
    }
}

/// Resolved location of a package inside the definition tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttrPath(pub String);

impl AttrPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expression selecting a sub-attribute, e.g. `foo.src`.
    pub fn child(&self, name: &str) -> String {
        format!("{}.{}", self.0, name)
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a rewrite step that modified the definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteOutcome {
    pub message: Option<String>,
}

impl RewriteOutcome {
    pub fn silent() -> Self {
        Self { message: None }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// A vulnerability affecting some range of a package's versions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub id: String, // CVE-2023-XXXX
    pub affected_version_range: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Evaluated metadata of a package, as reported by the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMeta {
    pub version: String,
    /// Definition file declaring the package.
    pub file: String,
    pub src_url: Option<String>,
    /// Content hash of the fixed-output source.
    pub src_hash: Option<String>,
    #[serde(default)]
    pub patches: Vec<String>,
    #[serde(default)]
    pub has_update_script: bool,
    /// `meta.broken` of the package.
    #[serde(default)]
    pub broken: bool,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub changelog: Option<String>,
}

/// Outcome of a build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub success: bool,
    /// Builder diagnostics (stderr).
    pub log: String,
}

impl BuildReport {
    /// Last `n` lines of the build log.
    pub fn tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.log.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// A change request to open against the upstream repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub head_branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
}
