//! The nix CLI as evaluator and builder.

use async_trait::async_trait;
use serde::Deserialize;
use std::cmp::Ordering;
use tracing::{debug, info, instrument};

use crate::executor::{CommandExecutor, INTROSPECTION_TIMEOUT};
use crate::model::{AttrPath, BuildReport, PackageMeta};
use crate::outpaths::OutpathSet;
use crate::traits::{CollaboratorError, CollaboratorResult, Evaluator};

/// Quotes `s` as a nix string literal.
fn nix_string(s: &str) -> String {
    let escaped = s
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("${", "\\${");
    format!("\"{}\"", escaped)
}

/// Expression selecting `attr` from the package set in the working tree.
fn select_attr(attr: &AttrPath) -> String {
    format!(
        "(let pkgs = import ./. {{ }}; in pkgs.lib.getAttrFromPath (pkgs.lib.splitString \".\" {}) pkgs)",
        nix_string(attr.as_str())
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMeta {
    version: Option<String>,
    position: Option<String>,
    src_url: Option<String>,
    src_hash: Option<String>,
    #[serde(default)]
    patches: Vec<String>,
    #[serde(default)]
    has_update_script: bool,
    #[serde(default)]
    broken: bool,
    description: Option<String>,
    homepage: Option<String>,
    changelog: Option<String>,
}

impl RawMeta {
    fn into_meta(self, attr: &AttrPath) -> CollaboratorResult<PackageMeta> {
        let position = self.position.ok_or_else(|| {
            CollaboratorError::UnexpectedOutput(format!("{} has no meta.position", attr))
        })?;
        // `meta.position` is `<file>:<line>`
        let file = position
            .rsplit_once(':')
            .map(|(file, _)| file)
            .unwrap_or(&position)
            .to_string();

        Ok(PackageMeta {
            version: self.version.unwrap_or_default(),
            file,
            src_url: self.src_url,
            src_hash: self.src_hash,
            patches: self.patches,
            has_update_script: self.has_update_script,
            broken: self.broken,
            description: self.description,
            homepage: self.homepage,
            changelog: self.changelog,
        })
    }
}

/// Evaluator backed by `nix-instantiate`, `nix-env` and `nix-build`.
pub struct NixEvaluator {
    executor: CommandExecutor,
    cache_name: Option<String>,
}

impl NixEvaluator {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            cache_name: None,
        }
    }

    pub fn with_cache(mut self, cache_name: Option<String>) -> Self {
        self.cache_name = cache_name;
        self
    }

    async fn eval_json<T: serde::de::DeserializeOwned>(&self, expr: &str) -> CollaboratorResult<T> {
        let stdout = self.eval(expr).await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

#[async_trait]
impl Evaluator for NixEvaluator {
    async fn compare_versions(&self, a: &str, b: &str) -> CollaboratorResult<Ordering> {
        let expr = format!(
            "builtins.compareVersions {} {}",
            nix_string(a),
            nix_string(b)
        );
        let stdout = self
            .executor
            .run_checked(
                "nix-instantiate",
                &["--eval", "-E", &expr],
                Some(INTROSPECTION_TIMEOUT),
            )
            .await?;

        match stdout.trim() {
            "-1" => Ok(Ordering::Less),
            "0" => Ok(Ordering::Equal),
            "1" => Ok(Ordering::Greater),
            other => Err(CollaboratorError::UnexpectedOutput(format!(
                "compareVersions returned {}",
                other
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn resolve_attr_path(
        &self,
        name: &str,
        version: &str,
    ) -> CollaboratorResult<AttrPath> {
        let selector = format!("{}-{}", name, version);
        let stdout = self
            .executor
            .run_checked("nix-env", &["-qa", &selector, "-f", ".", "--attr-path"], None)
            .await?;

        stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .next()
            .map(|attr| AttrPath(attr.to_string()))
            .ok_or_else(|| {
                CollaboratorError::UnexpectedOutput(format!("no attribute path for {}", selector))
            })
    }

    #[instrument(skip(self))]
    async fn package_meta(&self, attr: &AttrPath) -> CollaboratorResult<PackageMeta> {
        let expr = format!(
            r#"let p = {sel}; in {{
  version = p.version or null;
  position = p.meta.position or null;
  srcUrl = p.src.url or (if p ? src && p.src ? urls then builtins.head p.src.urls else null);
  srcHash = p.src.outputHash or null;
  patches = map (x: baseNameOf (toString x)) (p.patches or [ ]);
  hasUpdateScript = p ? passthru && p.passthru ? updateScript;
  broken = p.meta.broken or false;
  description = p.meta.description or null;
  homepage = p.meta.homepage or null;
  changelog = p.meta.changelog or null;
}}"#,
            sel = select_attr(attr)
        );
        let raw: RawMeta = self.eval_json(&expr).await?;
        raw.into_meta(attr)
    }

    async fn eval(&self, expr: &str) -> CollaboratorResult<String> {
        self.executor
            .run_checked(
                "nix-instantiate",
                &["--eval", "--strict", "--json", "-E", expr],
                None,
            )
            .await
    }

    #[instrument(skip(self))]
    async fn build(&self, attr_expr: &str) -> CollaboratorResult<BuildReport> {
        info!(attr = attr_expr, "Building");
        let output = self
            .executor
            .run("nix-build", &["--no-out-link", "-A", attr_expr], None)
            .await?;
        Ok(BuildReport {
            success: output.success,
            log: output.stderr,
        })
    }

    async fn outputs(&self, attr: &AttrPath) -> CollaboratorResult<Vec<String>> {
        let expr = format!(
            "let p = {}; in map (o: p.${{o}}.outPath) (p.outputs or [ \"out\" ])",
            select_attr(attr)
        );
        self.eval_json(&expr).await
    }

    #[instrument(skip(self))]
    async fn eval_outpaths(&self) -> CollaboratorResult<OutpathSet> {
        let stdout = self
            .executor
            .run_checked(
                "nix-env",
                &[
                    "-f",
                    ".",
                    "-qaP",
                    "--no-name",
                    "--out-path",
                    "--arg",
                    "config",
                    "{ allowBroken = true; allowUnfree = true; allowAliases = false; }",
                ],
                None,
            )
            .await?;
        let set = OutpathSet::parse(&stdout);
        debug!(outputs = set.len(), "Outpaths listed");
        Ok(set)
    }

    async fn push_to_cache(&self, paths: &[String]) -> CollaboratorResult<()> {
        let Some(cache) = &self.cache_name else {
            debug!("No binary cache configured");
            return Ok(());
        };

        let mut args = vec!["push", cache.as_str()];
        args.extend(paths.iter().map(String::as_str));
        self.executor.run_checked("cachix", &args, None).await?;
        Ok(())
    }
}
