//! GitHub as the code host.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::config::GitHubConfig;
use crate::model::ChangeRequest;
use crate::traits::{CodeHost, CollaboratorError, CollaboratorResult};

/// `(owner, repo)` of a GitHub-hosted source URL.
pub fn github_repo(source_url: &str) -> Option<(&str, &str)> {
    let rest = source_url
        .strip_prefix("https://github.com/")
        .or_else(|| source_url.strip_prefix("http://github.com/"))?;
    let mut parts = rest.split('/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty())?;
    Some((owner, repo.trim_end_matches(".git")))
}

/// Release page of `new_version`, for GitHub sources.
pub fn release_url(source_url: &str, new_version: &str) -> Option<String> {
    let (owner, repo) = github_repo(source_url)?;
    let tag = if source_url.contains(&format!("/v{}", new_version)) {
        format!("v{}", new_version)
    } else {
        new_version.to_string()
    };
    Some(format!(
        "https://github.com/{}/{}/releases/tag/{}",
        owner, repo, tag
    ))
}

/// Comparison between two versions, for GitHub sources.
pub fn compare_url(source_url: &str, old_version: &str, new_version: &str) -> Option<String> {
    let (owner, repo) = github_repo(source_url)?;
    let prefix = if source_url.contains(&format!("/v{}", new_version)) {
        "v"
    } else {
        ""
    };
    Some(format!(
        "https://github.com/{}/{}/compare/{p}{}...{p}{}",
        owner,
        repo,
        old_version,
        new_version,
        p = prefix
    ))
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    html_url: String,
}

/// REST client for the upstream repository.
pub struct GitHubClient {
    config: GitHubConfig,
    http_client: reqwest::Client,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        let builder = self
            .http_client
            .request(method, url)
            .header("Accept", "application/vnd.github+json");
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn head_ref(&self, branch: &str) -> String {
        match &self.config.fork_owner {
            Some(owner) => format!("{}:{}", owner, branch),
            None => branch.to_string(),
        }
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    #[instrument(skip(self))]
    async fn open_change_for(
        &self,
        package: &str,
        new_version: &str,
    ) -> CollaboratorResult<Option<String>> {
        let query = format!(
            "repo:{} is:pr is:open in:title \"{}\" \"{}\"",
            self.config.repository, package, new_version
        );
        let results: SearchResults = self
            .request(reqwest::Method::GET, "/search/issues")
            .query(&[("q", query.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(matches = results.items.len(), "Searched open changes");
        Ok(results.items.into_iter().next().map(|item| item.html_url))
    }

    #[instrument(skip(self, change), fields(title = %change.title))]
    async fn submit_change(&self, change: &ChangeRequest) -> CollaboratorResult<String> {
        if self.config.token.is_none() {
            return Err(CollaboratorError::Http(
                "a GitHub token is required to open pull requests".to_string(),
            ));
        }

        let path = format!("/repos/{}/pulls", self.config.repository);
        let created: CreatedPull = self
            .request(reqwest::Method::POST, &path)
            .json(&json!({
                "title": change.title,
                "head": self.head_ref(&change.head_branch),
                "base": change.base_branch,
                "body": change.body,
                "maintainer_can_modify": true,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.html_url)
    }

    async fn release_url(
        &self,
        source_url: &str,
        new_version: &str,
    ) -> CollaboratorResult<Option<String>> {
        Ok(release_url(source_url, new_version))
    }

    async fn compare_url(
        &self,
        source_url: &str,
        old_version: &str,
        new_version: &str,
    ) -> CollaboratorResult<Option<String>> {
        Ok(compare_url(source_url, old_version, new_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_repo() {
        assert_eq!(
            github_repo("https://github.com/owner/repo/archive/v1.3.tar.gz"),
            Some(("owner", "repo"))
        );
        assert_eq!(github_repo("https://github.com/owner/repo.git"), Some(("owner", "repo")));
        assert_eq!(github_repo("https://example.org/foo-1.3.tar.gz"), None);
        assert_eq!(github_repo("https://github.com/owner"), None);
    }

    #[test]
    fn test_release_and_compare_urls() {
        let url = "https://github.com/owner/repo/archive/v1.3.tar.gz";
        assert_eq!(
            release_url(url, "1.3").as_deref(),
            Some("https://github.com/owner/repo/releases/tag/v1.3")
        );
        assert_eq!(
            compare_url(url, "1.2", "1.3").as_deref(),
            Some("https://github.com/owner/repo/compare/v1.2...v1.3")
        );

        let plain = "https://github.com/owner/repo/archive/1.3.tar.gz";
        assert_eq!(
            compare_url(plain, "1.2", "1.3").as_deref(),
            Some("https://github.com/owner/repo/compare/1.2...1.3")
        );
        assert_eq!(release_url("https://example.org/x.tar.gz", "1.3"), None);
    }

    #[test]
    fn test_head_ref_uses_fork_owner() {
        let config = GitHubConfig {
            fork_owner: Some("bot".to_string()),
            ..Default::default()
        };
        let client = GitHubClient::new(config, reqwest::Client::new());
        assert_eq!(client.head_ref("auto-update/foo"), "bot:auto-update/foo");
    }

    #[tokio::test]
    async fn test_submit_requires_token() {
        let client = GitHubClient::new(GitHubConfig::default(), reqwest::Client::new());
        let change = ChangeRequest {
            head_branch: "auto-update/foo".to_string(),
            base_branch: "master".to_string(),
            title: "foo: 1.2 -> 1.3".to_string(),
            body: String::new(),
        };
        assert!(matches!(
            client.submit_change(&change).await,
            Err(CollaboratorError::Http(_))
        ));
    }
}
