//! TOML configuration.
//!
//! Everything except `[db]` has defaults, so a minimal config file is just
//! the database path plus the embedding model.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    #[serde(default = "default_github_api")]
    pub api_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Globs matched against the repository-relative path.
    #[serde(default = "default_ignore_files")]
    pub ignore_files: Vec<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Environment variable holding the fallback access token.
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    #[serde(default = "default_commit_limit")]
    pub commit_limit: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api(),
            branch: default_branch(),
            ignore_files: default_ignore_files(),
            max_concurrency: default_max_concurrency(),
            max_file_bytes: default_max_file_bytes(),
            token_env: default_github_token_env(),
            commit_limit: default_commit_limit(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_ignore_files() -> Vec<String> {
    [
        "package.json",
        "package-lock.json",
        "composer.json",
        "composer.lock",
        "yarn.lock",
        "pnpm-lock.yaml",
        "bun.lockb",
    ]
    .iter()
    .map(|name| format!("**/{}", name))
    .collect()
}
fn default_max_concurrency() -> usize {
    5
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}
fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_commit_limit() -> usize {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on a whole streamed answer.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: None,
            api_key_env: default_openai_key_env(),
            timeout_secs: default_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_stream_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Files summarized and embedded in parallel.
    #[serde(default = "default_ingest_concurrency")]
    pub concurrency: usize,
    /// Commits summarized in parallel during a poll.
    #[serde(default = "default_ingest_concurrency")]
    pub commit_concurrency: usize,
    #[serde(default = "default_summary_prefix_chars")]
    pub summary_prefix_chars: usize,
    #[serde(default = "default_max_diff_chars")]
    pub max_diff_chars: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_ingest_concurrency(),
            commit_concurrency: default_ingest_concurrency(),
            summary_prefix_chars: default_summary_prefix_chars(),
            max_diff_chars: default_max_diff_chars(),
        }
    }
}

fn default_ingest_concurrency() -> usize {
    4
}
fn default_summary_prefix_chars() -> usize {
    1000
}
fn default_max_diff_chars() -> usize {
    20_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.5
}
fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_retries")]
    pub max_retries: u32,
    #[serde(default = "default_refresh_backoff_secs")]
    pub backoff_secs: u64,
    /// When set, every active project is polled on this interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_retries: default_refresh_retries(),
            backoff_secs: default_refresh_backoff_secs(),
            interval_secs: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_refresh_retries() -> u32 {
    2
}
fn default_refresh_backoff_secs() -> u64 {
    5
}
fn default_queue_capacity() -> usize {
    64
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl GithubConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EmbeddingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }
}

impl GenerationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }
}

impl RefreshConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_base_delay(Duration::from_secs(self.backoff_secs))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.github.max_concurrency == 0 {
        anyhow::bail!("github.max_concurrency must be > 0");
    }
    if config.github.commit_limit == 0 {
        anyhow::bail!("github.commit_limit must be > 0");
    }
    if config.ingest.concurrency == 0 || config.ingest.commit_concurrency == 0 {
        anyhow::bail!("ingest.concurrency and ingest.commit_concurrency must be > 0");
    }
    if config.ingest.summary_prefix_chars == 0 {
        anyhow::bail!("ingest.summary_prefix_chars must be > 0");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }
    if config.refresh.queue_capacity == 0 {
        anyhow::bail!("refresh.queue_capacity must be > 0");
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.generation.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!(
            r#"
[db]
path = "/tmp/rv.sqlite"

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768
{}
"#,
            extra
        );
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse("").unwrap();
        assert_eq!(config.github.branch, "main");
        assert_eq!(config.github.max_concurrency, 5);
        assert_eq!(config.github.commit_limit, 15);
        assert_eq!(config.retrieval.top_k, 10);
        assert!((config.retrieval.similarity_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.ingest.summary_prefix_chars, 1000);
        assert!(config
            .github
            .ignore_files
            .contains(&"**/package-lock.json".to_string()));
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let err = parse("[retrieval]\ntop_k = 0").unwrap_err();
        assert!(err.to_string().contains("top_k"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let content = r#"
[db]
path = "/tmp/rv.sqlite"

[embedding]
provider = "carrier-pigeon"
model = "x"
dims = 3
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_requires_dims() {
        let content = r#"
[db]
path = "/tmp/rv.sqlite"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
"#;
        let config: Config = toml::from_str(content).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("dims"));
    }
}
