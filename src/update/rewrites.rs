//! Built-in rewrite steps and the fixed-output hash recovery they share.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::model::RewriteOutcome;
use crate::update::traits::{HashRecoveryError, RewriteContext, RewriteError, Rewriter};

/// Placeholder hash no real source can match.
pub const SENTINEL_HASH: &str = "sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Marker preceding the expected hash in the builder's mismatch diagnostics.
pub const EXPECTED_HASH_DELIMITER: &str = "got:";

/// The steps run on every candidate, in order.
pub fn default_rewriters() -> Vec<Box<dyn Rewriter>> {
    vec![
        Box::new(VersionRewrite),
        Box::new(SourceHashRewrite),
        Box::new(CargoHashRewrite),
    ]
}

/// Extracts the expected hash from a hash-mismatch build log.
pub fn parse_expected_hash(log: &str) -> Result<String, HashRecoveryError> {
    let unrecognized = || {
        let tail: Vec<&str> = log.lines().rev().take(5).collect();
        HashRecoveryError::UnrecognizedDiagnostics(
            tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
        )
    };

    let (_, rest) = log.split_once(EXPECTED_HASH_DELIMITER).ok_or_else(unrecognized)?;
    let hash = rest.lines().next().unwrap_or_default().trim();
    if hash.is_empty() {
        return Err(unrecognized());
    }
    Ok(hash.to_string())
}

/// Learns the real hash of `attr_expr` by building it against the sentinel.
///
/// `current` is replaced by the sentinel in `file`, the build is forced, and
/// the sentinel is then replaced by the hash the builder reported.
pub async fn recover_hash(
    ctx: &RewriteContext<'_>,
    current: &str,
    attr_expr: &str,
) -> Result<String, RewriteError> {
    replace_in_file(ctx.file, current, SENTINEL_HASH).await?;

    let report = ctx.evaluator.build(attr_expr).await?;
    if report.success {
        return Err(HashRecoveryError::BuildSucceeded(attr_expr.to_string()).into());
    }

    let hash = parse_expected_hash(&report.log)?;
    replace_in_file(ctx.file, SENTINEL_HASH, &hash).await?;
    debug!(attr = attr_expr, %hash, "Recovered fixed-output hash");
    Ok(hash)
}

/// Replaces every occurrence of `from`; returns whether anything changed.
async fn replace_in_file(file: &Path, from: &str, to: &str) -> std::io::Result<bool> {
    let contents = tokio::fs::read_to_string(file).await?;
    if !contents.contains(from) {
        return Ok(false);
    }
    tokio::fs::write(file, contents.replace(from, to)).await?;
    Ok(true)
}

/// Value of the first `key = "value"` binding in `contents`.
pub(crate) fn quoted_binding<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(key)?;
        let rest = rest.trim_start().strip_prefix('=')?;
        let rest = rest.trim_start().strip_prefix('"')?;
        rest.split_once('"').map(|(value, _)| value)
    })
}

/// Replaces the quoted old version with the quoted new version.
pub struct VersionRewrite;

#[async_trait]
impl Rewriter for VersionRewrite {
    async fn rewrite(
        &self,
        ctx: &RewriteContext<'_>,
    ) -> Result<Option<RewriteOutcome>, RewriteError> {
        let old = format!("\"{}\"", ctx.candidate.old_version);
        let new = format!("\"{}\"", ctx.candidate.new_version);

        if replace_in_file(ctx.file, &old, &new).await? {
            info!(file = %ctx.file.display(), "Version updated");
            Ok(Some(RewriteOutcome::silent()))
        } else {
            Ok(None)
        }
    }

    fn name(&self) -> &'static str {
        "version"
    }
}

/// Recomputes the source hash after the version changed.
pub struct SourceHashRewrite;

#[async_trait]
impl Rewriter for SourceHashRewrite {
    async fn rewrite(
        &self,
        ctx: &RewriteContext<'_>,
    ) -> Result<Option<RewriteOutcome>, RewriteError> {
        let Some(current) = ctx.original_meta.src_hash.as_deref() else {
            return Ok(None);
        };
        let contents = tokio::fs::read_to_string(ctx.file).await?;
        if !contents.contains(current) {
            debug!("Source hash not declared in definition file");
            return Ok(None);
        }

        recover_hash(ctx, current, &ctx.attr_path.child("src")).await?;
        Ok(Some(RewriteOutcome::silent()))
    }

    fn name(&self) -> &'static str {
        "source_hash"
    }
}

/// Recomputes the vendored dependency hash of Rust packages.
pub struct CargoHashRewrite;

#[async_trait]
impl Rewriter for CargoHashRewrite {
    async fn rewrite(
        &self,
        ctx: &RewriteContext<'_>,
    ) -> Result<Option<RewriteOutcome>, RewriteError> {
        let contents = tokio::fs::read_to_string(ctx.file).await?;
        let Some(current) = quoted_binding(&contents, "cargoHash") else {
            return Ok(None);
        };

        let hash = recover_hash(ctx, current, &ctx.attr_path.child("cargoDeps")).await?;
        Ok(Some(RewriteOutcome::with_message(format!(
            "Updated cargoHash to {}",
            hash
        ))))
    }

    fn name(&self) -> &'static str {
        "cargo_hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateOptions;
    use crate::fakes::FakeEvaluator;
    use crate::model::{AttrPath, BuildReport, Candidate, PackageMeta};

    const MISMATCH_LOG: &str = "error: hash mismatch in fixed-output derivation '/nix/store/x-foo-1.3.tar.gz.drv':\n\
         specified: sha256-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\n\
            got:    sha256-NEWHASHNEWHASHNEWHASHNEWHASHNEWHASHNEWHASH=\n";

    #[test]
    fn test_parse_expected_hash() {
        assert_eq!(
            parse_expected_hash(MISMATCH_LOG).unwrap(),
            "sha256-NEWHASHNEWHASHNEWHASHNEWHASHNEWHASHNEWHASH="
        );
    }

    #[test]
    fn test_parse_expected_hash_unrecognized() {
        let err = parse_expected_hash("error: builder failed with exit code 2").unwrap_err();
        assert!(matches!(err, HashRecoveryError::UnrecognizedDiagnostics(_)));

        let err = parse_expected_hash("got:\n").unwrap_err();
        assert!(matches!(err, HashRecoveryError::UnrecognizedDiagnostics(_)));
    }

    #[test]
    fn test_quoted_binding() {
        let contents = "{\n  version = \"1.2\";\n  cargoHash = \"sha256-old\";\n}";
        assert_eq!(quoted_binding(contents, "cargoHash"), Some("sha256-old"));
        assert_eq!(quoted_binding(contents, "vendorHash"), None);
    }

    fn fixture(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("default.nix");
        std::fs::write(&file, contents).unwrap();
        (dir, file)
    }

    #[tokio::test]
    async fn test_rewrites_version_and_hashes() {
        let (_dir, file) = fixture(
            "{\n  version = \"1.2\";\n  hash = \"sha256-oldsrc\";\n  cargoHash = \"sha256-oldcargo\";\n}\n",
        );
        let evaluator = FakeEvaluator::new()
            .with_build("foo.src", BuildReport { success: false, log: "got: sha256-newsrc\n".into() })
            .with_build(
                "foo.cargoDeps",
                BuildReport { success: false, log: "got: sha256-newcargo\n".into() },
            );
        let candidate = Candidate::new("foo", "1.2", "1.3", UpdateOptions::default());
        let attr = AttrPath("foo".to_string());
        let meta = PackageMeta {
            src_hash: Some("sha256-oldsrc".to_string()),
            ..Default::default()
        };
        let ctx = RewriteContext {
            candidate: &candidate,
            attr_path: &attr,
            file: &file,
            original_meta: &meta,
            evaluator: &evaluator,
        };

        let mut messages = Vec::new();
        for step in default_rewriters() {
            if let Some(outcome) = step.rewrite(&ctx).await.unwrap() {
                messages.push(outcome.message);
            }
        }

        let contents = std::fs::read_to_string(&file).unwrap();
        assert!(contents.contains("version = \"1.3\""));
        assert!(contents.contains("hash = \"sha256-newsrc\""));
        assert!(contents.contains("cargoHash = \"sha256-newcargo\""));
        assert_eq!(
            messages,
            vec![None, None, Some("Updated cargoHash to sha256-newcargo".to_string())]
        );
    }

    #[tokio::test]
    async fn test_hash_recovery_rejects_successful_build() {
        let (_dir, file) = fixture("{ hash = \"sha256-oldsrc\"; }");
        let evaluator = FakeEvaluator::new()
            .with_build("foo.src", BuildReport { success: true, log: String::new() });
        let candidate = Candidate::new("foo", "1.2", "1.3", UpdateOptions::default());
        let attr = AttrPath("foo".to_string());
        let meta = PackageMeta::default();
        let ctx = RewriteContext {
            candidate: &candidate,
            attr_path: &attr,
            file: &file,
            original_meta: &meta,
            evaluator: &evaluator,
        };

        let err = recover_hash(&ctx, "sha256-oldsrc", "foo.src").await.unwrap_err();
        assert!(matches!(
            err,
            RewriteError::HashRecovery(HashRecoveryError::BuildSucceeded(_))
        ));
    }
}
