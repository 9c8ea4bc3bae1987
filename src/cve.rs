//! Correlation of vulnerability records between two versions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;
use tracing::debug;

use crate::model::VulnerabilityRecord;
use crate::traits::{CollaboratorResult, VulnerabilityDb};
use crate::version;

/// A record in the report, annotated with patch coverage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReportedCve {
    pub record: VulnerabilityRecord,
    /// A patch named after this record is already applied
    pub patched: bool,
}

/// Vulnerabilities partitioned by how the update affects them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CveReport {
    /// In the old version, not in the new one
    pub resolved: Vec<ReportedCve>,
    /// In the new version, not in the old one
    pub introduced: Vec<ReportedCve>,
    /// In both versions
    pub unresolved: Vec<ReportedCve>,
    /// Why the database could not be consulted
    pub unavailable: Option<String>,
}

impl CveReport {
    /// Report standing in for a failed lookup.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unavailable.is_none()
            && self.resolved.is_empty()
            && self.introduced.is_empty()
            && self.unresolved.is_empty()
    }

    /// Markdown section for the change description; empty when nothing to report.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        if let Some(reason) = &self.unavailable {
            return format!(
                "###### Security vulnerability report\n\nCVE report unavailable: {}\n",
                reason
            );
        }

        let mut out = String::from(
            "###### Security vulnerability report\n\n<details>\n<summary>\nSecurity report (click to expand)\n</summary>\n",
        );
        for (title, records) in [
            ("CVEs resolved by this update:", &self.resolved),
            ("CVEs introduced by this update:", &self.introduced),
            ("CVEs present in both versions:", &self.unresolved),
        ] {
            if records.is_empty() {
                continue;
            }
            let _ = write!(out, "\n{}\n", title);
            for cve in records {
                let _ = write!(
                    out,
                    "- [{id}](https://nvd.nist.gov/vuln/detail/{id})",
                    id = cve.record.id
                );
                if cve.patched {
                    out.push_str(" (patched)");
                }
                out.push('\n');
            }
        }
        out.push_str("\n</details>\n");
        out
    }
}

/// Hyphenated and underscored spellings of a package name.
pub fn name_variants(package: &str) -> BTreeSet<String> {
    [package.replace('_', "-"), package.replace('-', "_")]
        .into_iter()
        .collect()
}

/// Splits old/new record sets into resolved, introduced and unresolved.
///
/// Records are matched by identifier.
pub fn partition(
    old: &[VulnerabilityRecord],
    new: &[VulnerabilityRecord],
    patches: &[String],
) -> CveReport {
    let old: BTreeMap<&str, &VulnerabilityRecord> =
        old.iter().map(|r| (r.id.as_str(), r)).collect();
    let new: BTreeMap<&str, &VulnerabilityRecord> =
        new.iter().map(|r| (r.id.as_str(), r)).collect();
    let patch_names = patches.concat();

    let annotate = |record: &VulnerabilityRecord| ReportedCve {
        record: record.clone(),
        patched: patch_names.contains(&record.id),
    };

    let mut report = CveReport::default();
    for (id, record) in &old {
        if new.contains_key(id) {
            report.unresolved.push(annotate(record));
        } else {
            report.resolved.push(annotate(record));
        }
    }
    for (id, record) in &new {
        if !old.contains_key(id) {
            report.introduced.push(annotate(record));
        }
    }
    report
}

/// Queries every name variant at both versions and partitions the result.
pub async fn correlate<D: VulnerabilityDb + ?Sized>(
    db: &D,
    package: &str,
    old_version: &str,
    new_version: &str,
    patches: &[String],
) -> CollaboratorResult<CveReport> {
    let mut old = Vec::new();
    let mut new = Vec::new();
    for name in name_variants(package) {
        old.extend(db.query(&name, old_version).await?);
        new.extend(db.query(&name, new_version).await?);
    }

    let report = partition(&old, &new, patches);
    debug!(
        package,
        resolved = report.resolved.len(),
        introduced = report.introduced.len(),
        unresolved = report.unresolved.len(),
        "CVE correlation done"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbEntry {
    product: String,
    #[serde(flatten)]
    record: VulnerabilityRecord,
}

/// Vulnerability database loaded from a JSON array of records.
///
/// Each entry carries `product`, `id`, `affected_version_range` and an
/// optional `description`.
#[derive(Debug, Default)]
pub struct JsonVulnerabilityDb {
    entries: Vec<DbEntry>,
}

impl JsonVulnerabilityDb {
    pub fn from_json(raw: &str) -> CollaboratorResult<Self> {
        Ok(Self {
            entries: serde_json::from_str(raw)?,
        })
    }

    pub fn load(path: &Path) -> CollaboratorResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[async_trait]
impl VulnerabilityDb for JsonVulnerabilityDb {
    async fn query(
        &self,
        product: &str,
        version: &str,
    ) -> CollaboratorResult<Vec<VulnerabilityRecord>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.product == product)
            .filter(|e| version::satisfies(&e.record.affected_version_range, version))
            .map(|e| e.record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str) -> VulnerabilityRecord {
        VulnerabilityRecord {
            id: id.to_string(),
            affected_version_range: "*".to_string(),
            description: None,
        }
    }

    fn ids(cves: &[ReportedCve]) -> Vec<&str> {
        cves.iter().map(|c| c.record.id.as_str()).collect()
    }

    #[test]
    fn test_partition() {
        let report = partition(&[rec("A"), rec("B")], &[rec("B"), rec("C")], &[]);
        assert_eq!(ids(&report.resolved), vec!["A"]);
        assert_eq!(ids(&report.introduced), vec!["C"]);
        assert_eq!(ids(&report.unresolved), vec!["B"]);
    }

    #[test]
    fn test_patch_annotation() {
        let patches = vec!["CVE-2023-0001.patch".to_string(), "fix-build.patch".to_string()];
        let report = partition(&[rec("CVE-2023-0001")], &[rec("CVE-2023-0001")], &patches);
        assert!(report.unresolved[0].patched);
        assert!(report.render().contains("(patched)"));
    }

    #[test]
    fn test_empty_report_renders_nothing() {
        let report = partition(&[], &[], &[]);
        assert!(report.is_empty());
        assert_eq!(report.render(), "");
    }

    #[test]
    fn test_unavailable_report_is_rendered() {
        let report = CveReport::unavailable("db unreachable");
        assert!(!report.is_empty());
        assert_eq!(
            report.render(),
            "###### Security vulnerability report\n\nCVE report unavailable: db unreachable\n"
        );
    }

    #[test]
    fn test_name_variants() {
        let variants = name_variants("foo-bar_baz");
        assert!(variants.contains("foo-bar-baz"));
        assert!(variants.contains("foo_bar_baz"));
    }

    #[tokio::test]
    async fn test_correlate_unions_name_variants() {
        let db = JsonVulnerabilityDb::from_json(
            r#"[
                {"product": "libfoo-bar", "id": "CVE-1", "affected_version_range": "<1.3"},
                {"product": "libfoo_bar", "id": "CVE-2", "affected_version_range": ">=1.0"},
                {"product": "libfoo_bar", "id": "CVE-3", "affected_version_range": ">=1.3"},
                {"product": "other", "id": "CVE-4", "affected_version_range": "*"}
            ]"#,
        )
        .unwrap();

        let report = correlate(&db, "libfoo-bar", "1.2", "1.3", &[]).await.unwrap();
        assert_eq!(ids(&report.resolved), vec!["CVE-1"]);
        assert_eq!(ids(&report.introduced), vec!["CVE-3"]);
        assert_eq!(ids(&report.unresolved), vec!["CVE-2"]);
    }
}
