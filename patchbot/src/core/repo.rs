//! Upstream repository references parsed from user-supplied URLs.

use std::fmt;

use anyhow::Result;
use url::Url;

/// `{owner, repo}` pair identifying an upstream GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// The input URL does not look like a GitHub repository URL.
#[derive(Debug, Clone)]
pub struct InvalidRepositoryUrlError {
    pub url: String,
}

impl fmt::Display for InvalidRepositoryUrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid repository url '{}' (expected https://github.com/<owner>/<repo>)",
            self.url
        )
    }
}

impl std::error::Error for InvalidRepositoryUrlError {}

/// Parse `{owner, repo}` out of a GitHub repository URL.
///
/// Accepts `https://github.com/<owner>/<repo>` with an optional `.git`
/// suffix; extra path segments are ignored.
pub fn parse_repo_url(input: &str) -> Result<RepoRef> {
    let invalid = || InvalidRepositoryUrlError {
        url: input.to_string(),
    };
    let parsed = Url::parse(input.trim()).map_err(|_| invalid())?;
    match parsed.host_str() {
        Some("github.com") | Some("www.github.com") => {}
        _ => return Err(invalid().into()),
    }
    let mut segments = parsed
        .path_segments()
        .ok_or_else(invalid)?
        .filter(|s| !s.is_empty());
    let owner = segments.next().ok_or_else(invalid)?.to_string();
    let repo = segments
        .next()
        .ok_or_else(invalid)?
        .trim_end_matches(".git")
        .to_string();
    if repo.is_empty() {
        return Err(invalid().into());
    }
    Ok(RepoRef { owner, repo })
}
