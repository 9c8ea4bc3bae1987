//! Commit message and change-request description of a published update.

use std::fmt::Write as _;

use crate::cve::CveReport;
use crate::model::{AttrPath, Candidate, PackageMeta};

/// Everything the description is assembled from.
#[derive(Debug, Clone)]
pub struct ChangeSummary<'a> {
    pub candidate: &'a Candidate,
    pub attr_path: &'a AttrPath,
    pub meta: &'a PackageMeta,
    pub release_url: Option<String>,
    pub compare_url: Option<String>,
    /// Messages of rewrite steps, in the order they ran
    pub rewrite_messages: Vec<String>,
    pub rebuild_count: usize,
    pub head_commit: String,
    pub outputs: Vec<String>,
    pub cve_report: CveReport,
    pub target_branch: String,
}

impl ChangeSummary<'_> {
    /// `<attr>: <old> -> <new>`
    pub fn title(&self) -> String {
        format!(
            "{}: {} -> {}",
            self.attr_path, self.candidate.old_version, self.candidate.new_version
        )
    }

    pub fn commit_message(&self) -> String {
        let mut message = self.title();
        if let Some(url) = &self.release_url {
            let _ = write!(message, "\n\nRelease: {}", url);
        }
        for line in &self.rewrite_messages {
            let _ = write!(message, "\n\n{}", line);
        }
        message
    }

    pub fn description(&self) -> String {
        let c = self.candidate;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Automatic update of `{}` from {} to {}.\n",
            self.attr_path, c.old_version, c.new_version
        );

        let meta_lines = [
            ("Description", &self.meta.description),
            ("Homepage", &self.meta.homepage),
            ("Changelog", &self.meta.changelog),
            ("Release", &self.release_url),
            ("Compare changes", &self.compare_url),
        ];
        for (label, value) in meta_lines {
            if let Some(value) = value {
                let _ = writeln!(out, "- {}: {}", label, value);
            }
        }

        if self.meta.has_update_script {
            out.push_str("\nThe package carries its own update script; prefer it for future updates.\n");
        }

        if self.meta.broken {
            out.push_str("\nThe package is marked broken; the build result may not reflect a working package.\n");
        }

        if !self.rewrite_messages.is_empty() {
            out.push_str("\n###### Updates performed\n");
            for message in &self.rewrite_messages {
                let _ = writeln!(out, "- {}", message);
            }
        }

        let _ = writeln!(
            out,
            "\n###### Impact\n\n{} package rebuild(s), targeting `{}`.",
            self.rebuild_count, self.target_branch
        );
        let _ = writeln!(out, "Built from commit {}.", self.head_commit);

        if !self.outputs.is_empty() {
            out.push_str("\n<details>\n<summary>Build outputs</summary>\n\n");
            for path in &self.outputs {
                let _ = writeln!(out, "- {}", path);
            }
            out.push_str("</details>\n");
        }

        let report = self.cve_report.render();
        if !report.is_empty() {
            out.push('\n');
            out.push_str(&report);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateOptions;
    use crate::cve::partition;
    use crate::model::VulnerabilityRecord;

    fn summary<'a>(
        candidate: &'a Candidate,
        attr: &'a AttrPath,
        meta: &'a PackageMeta,
        cve_report: CveReport,
    ) -> ChangeSummary<'a> {
        ChangeSummary {
            candidate,
            attr_path: attr,
            meta,
            release_url: Some("https://github.com/o/foo/releases/tag/v1.3".to_string()),
            compare_url: None,
            rewrite_messages: vec!["Updated cargoHash to sha256-x".to_string()],
            rebuild_count: 1,
            head_commit: "abc123".to_string(),
            outputs: vec!["/nix/store/aaa-foo-1.3".to_string()],
            cve_report,
            target_branch: "master".to_string(),
        }
    }

    #[test]
    fn test_title_and_commit_message() {
        let candidate = Candidate::new("foo", "1.2", "1.3", UpdateOptions::default());
        let attr = AttrPath("foo".to_string());
        let meta = PackageMeta::default();
        let s = summary(&candidate, &attr, &meta, CveReport::default());

        assert_eq!(s.title(), "foo: 1.2 -> 1.3");
        let message = s.commit_message();
        assert!(message.starts_with("foo: 1.2 -> 1.3\n\nRelease: "));
        assert!(message.ends_with("Updated cargoHash to sha256-x"));
    }

    #[test]
    fn test_cve_section_only_when_present() {
        let candidate = Candidate::new("foo", "1.2", "1.3", UpdateOptions::default());
        let attr = AttrPath("foo".to_string());
        let meta = PackageMeta::default();

        let without = summary(&candidate, &attr, &meta, CveReport::default()).description();
        assert!(!without.contains("Security vulnerability report"));
        assert!(without.contains("1 package rebuild(s), targeting `master`"));

        let record = VulnerabilityRecord {
            id: "CVE-2024-1".to_string(),
            affected_version_range: "<1.3".to_string(),
            description: None,
        };
        let report = partition(&[record], &[], &[]);
        let with = summary(&candidate, &attr, &meta, report).description();
        assert!(with.contains("Security vulnerability report"));
        assert!(with.contains("CVE-2024-1"));
    }

    #[test]
    fn test_metadata_notes() {
        let candidate = Candidate::new("foo", "1.2", "1.3", UpdateOptions::default());
        let attr = AttrPath("foo".to_string());

        let plain = PackageMeta::default();
        let text = summary(&candidate, &attr, &plain, CveReport::default()).description();
        assert!(!text.contains("marked broken"));
        assert!(!text.contains("own update script"));

        let flagged = PackageMeta {
            broken: true,
            has_update_script: true,
            ..Default::default()
        };
        let text = summary(&candidate, &attr, &flagged, CveReport::default()).description();
        assert!(text.contains("The package is marked broken"));
        assert!(text.contains("own update script"));
    }
}
