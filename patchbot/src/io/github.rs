//! GitHub REST adapter for identity, forks, and pull requests.
//!
//! The [`CodeHost`] trait decouples the publish workflow from the hosting
//! service; tests use scripted hosts that never touch the network.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::repo::RepoRef;

/// A repository as seen by the hosting service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    /// Login of the repository owner.
    pub owner: String,
    pub clone_url: String,
    pub default_branch: String,
    pub fork: bool,
    /// `owner/name` of the fork parent when `fork` is true.
    pub parent_full_name: Option<String>,
}

/// A created pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Hosting operations the pipeline depends on: identity lookup, repository
/// lookup, fork creation, and pull request creation.
pub trait CodeHost {
    /// Login of the authenticated identity.
    fn viewer_login(&self) -> Result<String>;
    /// Look a repository up; `None` when it does not exist.
    fn get_repo(&self, owner: &str, repo: &str) -> Result<Option<RepoInfo>>;
    /// Start a fork of `upstream` under the authenticated identity. Fork
    /// creation is asynchronous on the hosting side; callers poll.
    fn create_fork(&self, upstream: &RepoRef) -> Result<()>;
    /// Open a pull request `head` -> `base` on `upstream`.
    fn create_pull_request(
        &self,
        upstream: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;
}

/// GitHub REST v3 backend.
pub struct GitHubClient {
    http: reqwest::blocking::Client,
    api_base: String,
    token: String,
}

impl GitHubClient {
    pub fn new(token: String) -> Result<Self> {
        Self::with_base("https://api.github.com", token)
    }

    pub fn with_base(api_base: &str, token: String) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("patchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .with_context(|| format!("GET {path}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, path)?;
        let value = response
            .json()
            .with_context(|| format!("decode {path}"))?;
        Ok(Some(value))
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(body)
            .send()
            .with_context(|| format!("POST {path}"))?;
        let response = check_status(response, path)?;
        response.json().with_context(|| format!("decode {path}"))
    }
}

fn check_status(
    response: reqwest::blocking::Response,
    path: &str,
) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let brief: String = body.chars().take(300).collect();
    bail!("{path} returned {status}: {brief}");
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiParent {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    owner: ApiUser,
    clone_url: String,
    default_branch: String,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    parent: Option<ApiParent>,
}

impl From<ApiRepo> for RepoInfo {
    fn from(repo: ApiRepo) -> Self {
        RepoInfo {
            owner: repo.owner.login,
            clone_url: repo.clone_url,
            default_branch: repo.default_branch,
            fork: repo.fork,
            parent_full_name: repo.parent.map(|p| p.full_name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    html_url: String,
}

impl CodeHost for GitHubClient {
    #[instrument(skip_all)]
    fn viewer_login(&self) -> Result<String> {
        let user: ApiUser = self
            .get_json("/user")?
            .context("authenticated user not found")?;
        debug!(login = %user.login, "resolved identity");
        Ok(user.login)
    }

    #[instrument(skip_all, fields(owner, repo))]
    fn get_repo(&self, owner: &str, repo: &str) -> Result<Option<RepoInfo>> {
        let found: Option<ApiRepo> = self.get_json(&format!("/repos/{owner}/{repo}"))?;
        Ok(found.map(RepoInfo::from))
    }

    #[instrument(skip_all, fields(upstream = %upstream))]
    fn create_fork(&self, upstream: &RepoRef) -> Result<()> {
        let _: serde_json::Value = self.post_json(
            &format!("/repos/{}/{}/forks", upstream.owner, upstream.repo),
            &serde_json::json!({}),
        )?;
        Ok(())
    }

    #[instrument(skip_all, fields(upstream = %upstream, head, base))]
    fn create_pull_request(
        &self,
        upstream: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let pull: ApiPull = self.post_json(
            &format!("/repos/{}/{}/pulls", upstream.owner, upstream.repo),
            &serde_json::json!({
                "title": title,
                "head": head,
                "base": base,
                "body": body,
            }),
        )?;
        Ok(PullRequest {
            number: pull.number,
            url: pull.html_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_api_repository_payloads() {
        let raw = r#"{
            "owner": {"login": "octocat"},
            "clone_url": "https://github.com/octocat/widget.git",
            "default_branch": "main",
            "fork": true,
            "parent": {"full_name": "acme/widget"}
        }"#;
        let api: ApiRepo = serde_json::from_str(raw).expect("parse");
        let info = RepoInfo::from(api);
        assert_eq!(info.owner, "octocat");
        assert_eq!(info.parent_full_name.as_deref(), Some("acme/widget"));
        assert!(info.fork);
    }

    #[test]
    fn missing_fork_fields_default_to_non_fork() {
        let raw = r#"{
            "owner": {"login": "acme"},
            "clone_url": "https://github.com/acme/widget.git",
            "default_branch": "main"
        }"#;
        let api: ApiRepo = serde_json::from_str(raw).expect("parse");
        let info = RepoInfo::from(api);
        assert!(!info.fork);
        assert!(info.parent_full_name.is_none());
    }
}
