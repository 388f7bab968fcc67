//! Repository hosting service.
//!
//! [`RepoHost`] is the seam between the pipeline and the hosting API;
//! [`GitHubClient`] implements it against the GitHub REST API:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | list files | `GET /repos/{owner}/{repo}/git/trees/{branch}?recursive=1` |
//! | fetch file | `GET /repos/{owner}/{repo}/contents/{path}?ref={branch}` |
//! | list commits | `GET /repos/{owner}/{repo}/commits?sha={branch}&per_page=N` (N >= 30) |
//! | commit diff | `GET /repos/{owner}/{repo}/commits/{sha}` (diff media type) |

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::config::GithubConfig;
use crate::error::Error;
use crate::models::CommitInfo;
use crate::retry::{with_retry, RetryPolicy};

const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const DIFF_MEDIA_TYPE: &str = "application/vnd.github.v3.diff";
/// Commits are ordered by author date within one page of at least this size.
const MIN_COMMIT_PAGE: usize = 30;
const MAX_COMMIT_PAGE: usize = 100;

/// `owner/name` of a hosted repository plus the credential to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocator {
    pub owner: String,
    pub name: String,
    pub access_token: Option<String>,
}

impl RepoLocator {
    /// Parse `https://host/owner/repo[.git][/...]` or `git@host:owner/repo.git`.
    pub fn parse(repo_url: &str) -> Result<Self, Error> {
        let trimmed = repo_url.trim();
        if trimmed.is_empty() {
            return Err(Error::Input("repository URL is empty".to_string()));
        }

        let segments: Vec<String> = if let Some(rest) = trimmed.strip_prefix("git@") {
            let (_, path) = rest
                .split_once(':')
                .ok_or_else(|| Error::Input(format!("malformed repository URL: {}", trimmed)))?;
            path.split('/').map(str::to_string).collect()
        } else {
            let url = Url::parse(trimmed)
                .map_err(|e| Error::Input(format!("malformed repository URL '{}': {}", trimmed, e)))?;
            if url.scheme() != "https" && url.scheme() != "http" {
                return Err(Error::Input(format!(
                    "unsupported repository URL scheme: {}",
                    url.scheme()
                )));
            }
            url.path_segments()
                .map(|s| s.map(str::to_string).collect())
                .unwrap_or_default()
        };

        let mut parts = segments.into_iter().filter(|s| !s.is_empty());
        let owner = parts.next();
        let name = parts.next().map(|n| n.trim_end_matches(".git").to_string());

        match (owner, name) {
            (Some(owner), Some(name)) if !name.is_empty() => Ok(Self {
                owner,
                name,
                access_token: None,
            }),
            _ => Err(Error::Input(format!(
                "repository URL must name an owner and a repository: {}",
                trimmed
            ))),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// A blob listed in the repository tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub size: u64,
}

/// A recursive tree listing. `truncated` is set when the API cut the
/// listing short, so files past the cut are absent from `files`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoTree {
    pub files: Vec<RemoteFile>,
    pub truncated: bool,
}

#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Every file (not directory) on the default branch, recursively.
    async fn list_files(&self, repo: &RepoLocator) -> Result<RepoTree>;

    /// Raw bytes of one file on the default branch.
    async fn fetch_file(&self, repo: &RepoLocator, path: &str) -> Result<Vec<u8>>;

    /// The most recent `limit` commits, newest first by author date.
    async fn list_commits(&self, repo: &RepoLocator, limit: usize) -> Result<Vec<CommitInfo>>;

    /// Unified diff of a single commit.
    async fn commit_diff(&self, repo: &RepoLocator, hash: &str) -> Result<String>;
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: Url,
    branch: String,
    default_token: Option<String>,
    retry: RetryPolicy,
}

impl GitHubClient {
    /// Build a client from config. The fallback token is read from the
    /// environment variable named by `github.token_env`, when present.
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let default_token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::with_token(config, default_token)
    }

    pub fn with_token(config: &GithubConfig, default_token: Option<String>) -> Result<Self> {
        let api_url = Url::parse(&config.api_url)
            .with_context(|| format!("Invalid github.api_url: {}", config.api_url))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            api_url,
            branch: config.branch.clone(),
            default_token,
            retry: config.retry_policy(),
        })
    }

    fn endpoint(&self, repo: &RepoLocator, tail: &[&str]) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("github.api_url cannot be a base URL"))?
            .pop_if_empty()
            .extend(["repos", repo.owner.as_str(), repo.name.as_str()])
            .extend(tail);
        Ok(url)
    }

    async fn get(&self, repo: &RepoLocator, url: &Url, accept: &str) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .get(url.clone())
            .header(ACCEPT, accept)
            .header(USER_AGENT, "repo-vision");
        if let Some(token) = repo.access_token.as_deref().or(self.default_token.as_deref()) {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::upstream("github", None, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // GitHub reports an exhausted rate limit as 403
        let rate_limited = status.as_u16() == 403
            && response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                == Some("0");
        let code = if rate_limited { 429 } else { status.as_u16() };
        let body = response.text().await.unwrap_or_default();
        Err(Error::upstream("github", Some(code), body).into())
    }

    async fn get_json<T: DeserializeOwned>(&self, repo: &RepoLocator, url: &Url) -> Result<T> {
        with_retry(self.retry, "github", || async {
            let response = self.get(repo, url, JSON_MEDIA_TYPE).await?;
            let parsed = response
                .json::<T>()
                .await
                .map_err(|e| Error::upstream("github", None, e.to_string()))?;
            Ok(parsed)
        })
        .await
    }
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct ContentResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Deserialize)]
struct CommitItem {
    sha: String,
    commit: CommitDetail,
    author: Option<AccountRef>,
}

#[derive(Deserialize)]
struct CommitDetail {
    #[serde(default)]
    message: String,
    author: Option<GitSignature>,
}

#[derive(Deserialize)]
struct GitSignature {
    #[serde(default)]
    name: String,
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct AccountRef {
    #[serde(default)]
    avatar_url: String,
}

fn decode_content(payload: ContentResponse) -> Result<Vec<u8>> {
    match payload.encoding.as_str() {
        "base64" => {
            let compact: String = payload
                .content
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            Ok(base64::engine::general_purpose::STANDARD.decode(compact)?)
        }
        "" | "utf-8" => Ok(payload.content.into_bytes()),
        other => Err(anyhow!("unsupported content encoding: {}", other)),
    }
}

/// Convert API items into [`CommitInfo`], newest first, capped at `limit`.
fn commit_page_size(limit: usize) -> usize {
    limit.clamp(MIN_COMMIT_PAGE, MAX_COMMIT_PAGE)
}

fn to_commit_infos(items: Vec<CommitItem>, limit: usize) -> Vec<CommitInfo> {
    let mut commits: Vec<CommitInfo> = items
        .into_iter()
        .map(|item| {
            let (author_name, timestamp) = match item.commit.author {
                Some(sig) => (sig.name, sig.date.unwrap_or_default()),
                None => (String::new(), DateTime::<Utc>::default()),
            };
            CommitInfo {
                hash: item.sha,
                message: item.commit.message,
                author_name,
                author_avatar_url: item.author.map(|a| a.avatar_url).unwrap_or_default(),
                timestamp,
            }
        })
        .collect();
    commits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    commits.truncate(limit);
    commits
}

#[async_trait]
impl RepoHost for GitHubClient {
    async fn list_files(&self, repo: &RepoLocator) -> Result<RepoTree> {
        let mut url = self.endpoint(repo, &["git", "trees", self.branch.as_str()])?;
        url.query_pairs_mut().append_pair("recursive", "1");

        let tree: TreeResponse = self
            .get_json(repo, &url)
            .await
            .with_context(|| format!("Failed to list files of {}", repo.full_name()))?;

        if tree.truncated {
            tracing::warn!(
                repo = %repo.full_name(),
                "repository tree was truncated by the API; some files will not be indexed"
            );
        }

        let files = tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .map(|entry| RemoteFile {
                path: entry.path,
                size: entry.size,
            })
            .collect();
        Ok(RepoTree {
            files,
            truncated: tree.truncated,
        })
    }

    async fn fetch_file(&self, repo: &RepoLocator, path: &str) -> Result<Vec<u8>> {
        let mut tail = vec!["contents"];
        tail.extend(path.split('/'));
        let mut url = self.endpoint(repo, &tail)?;
        url.query_pairs_mut().append_pair("ref", &self.branch);

        let payload: ContentResponse = self.get_json(repo, &url).await?;
        decode_content(payload)
    }

    async fn list_commits(&self, repo: &RepoLocator, limit: usize) -> Result<Vec<CommitInfo>> {
        let mut url = self.endpoint(repo, &["commits"])?;
        url.query_pairs_mut()
            .append_pair("sha", &self.branch)
            .append_pair("per_page", &commit_page_size(limit).to_string());

        let items: Vec<CommitItem> = self
            .get_json(repo, &url)
            .await
            .with_context(|| format!("Failed to list commits of {}", repo.full_name()))?;
        Ok(to_commit_infos(items, limit))
    }

    async fn commit_diff(&self, repo: &RepoLocator, hash: &str) -> Result<String> {
        let url = self.endpoint(repo, &["commits", hash])?;
        with_retry(self.retry, "github diff", || async {
            let response = self.get(repo, &url, DIFF_MEDIA_TYPE).await?;
            let text = response
                .text()
                .await
                .map_err(|e| Error::upstream("github", None, e.to_string()))?;
            Ok(text)
        })
        .await
    }
}
