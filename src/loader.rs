//! Repository loading.
//!
//! Lists the tree, drops ignored and oversized paths, then fetches the
//! remaining files with at most `github.max_concurrency` requests in
//! flight. A file that fails to fetch or is not UTF-8 is logged and
//! skipped; only a failure to list the tree aborts the load.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::GithubConfig;
use crate::github::{RepoHost, RepoLocator};
use crate::models::RepoFile;

#[derive(Debug, Default)]
pub struct LoadedRepository {
    /// Loaded files, sorted by path.
    pub files: Vec<RepoFile>,
    /// Paths that exist in the tree but could not be loaded this time.
    pub skipped: Vec<String>,
    /// The host returned a partial tree listing.
    pub truncated: bool,
}

pub async fn load_repository(
    host: &dyn RepoHost,
    repo: &RepoLocator,
    config: &GithubConfig,
) -> Result<LoadedRepository> {
    let ignore = build_globset(&config.ignore_files)?;

    let listed = host
        .list_files(repo)
        .await
        .with_context(|| format!("Repository {} is unreachable", repo.full_name()))?;

    let truncated = listed.truncated;
    let candidates: Vec<String> = listed
        .files
        .into_iter()
        .filter(|file| {
            if ignore.is_match(&file.path) {
                return false;
            }
            if file.size > config.max_file_bytes {
                tracing::debug!(path = %file.path, size = file.size, "skipping oversized file");
                return false;
            }
            true
        })
        .map(|file| file.path)
        .collect();

    tracing::info!(
        repo = %repo.full_name(),
        files = candidates.len(),
        "loading repository"
    );

    let fetched: Vec<(String, Result<Vec<u8>>)> = stream::iter(candidates)
        .map(|path| async move {
            let result = host.fetch_file(repo, &path).await;
            (path, result)
        })
        .buffer_unordered(config.max_concurrency.max(1))
        .collect()
        .await;

    let mut loaded = LoadedRepository {
        truncated,
        ..Default::default()
    };
    for (path, result) in fetched {
        match result {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => loaded.files.push(RepoFile { path, content }),
                Err(_) => {
                    tracing::warn!(path = %path, "skipping binary file");
                    loaded.skipped.push(path);
                }
            },
            Err(e) => {
                tracing::warn!(path = %path, error = %format!("{:#}", e), "failed to fetch file");
                loaded.skipped.push(path);
            }
        }
    }

    loaded.files.sort_by(|a, b| a.path.cmp(&b.path));
    loaded.skipped.sort();
    Ok(loaded)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern).with_context(|| format!("Invalid ignore pattern: {}", pattern))?,
        );
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{RemoteFile, RepoTree};
    use crate::models::CommitInfo;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHost {
        files: HashMap<String, Vec<u8>>,
        broken: Vec<String>,
        truncated: bool,
        fetches: AtomicUsize,
    }

    impl FakeHost {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(p, c)| (p.to_string(), c.to_vec()))
                    .collect(),
                broken: Vec::new(),
                truncated: false,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RepoHost for FakeHost {
        async fn list_files(&self, _repo: &RepoLocator) -> Result<RepoTree> {
            let files = self
                .files
                .iter()
                .map(|(path, content)| RemoteFile {
                    path: path.clone(),
                    size: content.len() as u64,
                })
                .collect();
            Ok(RepoTree {
                files,
                truncated: self.truncated,
            })
        }

        async fn fetch_file(&self, _repo: &RepoLocator, path: &str) -> Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.broken.iter().any(|b| b == path) {
                anyhow::bail!("boom");
            }
            Ok(self.files[path].clone())
        }

        async fn list_commits(&self, _repo: &RepoLocator, _limit: usize) -> Result<Vec<CommitInfo>> {
            Ok(Vec::new())
        }

        async fn commit_diff(&self, _repo: &RepoLocator, _hash: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn repo() -> RepoLocator {
        RepoLocator::parse("https://github.com/acme/widgets").unwrap()
    }

    #[tokio::test]
    async fn test_ignored_files_never_fetched() {
        let host = FakeHost::new(&[
            ("src/lib.rs", b"pub fn a() {}"),
            ("web/package-lock.json", b"{}"),
            ("yarn.lock", b"x"),
        ]);
        let loaded = load_repository(&host, &repo(), &GithubConfig::default())
            .await
            .unwrap();

        let paths: Vec<&str> = loaded.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs"]);
        assert_eq!(host.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_and_binary_files_are_skipped() {
        let mut host = FakeHost::new(&[
            ("a.rs", b"fn a() {}"),
            ("b.rs", b"fn b() {}"),
            ("logo.png", &[0xff, 0xfe, 0x00, 0x81]),
        ]);
        host.broken.push("b.rs".to_string());

        let loaded = load_repository(&host, &repo(), &GithubConfig::default())
            .await
            .unwrap();
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].path, "a.rs");
        assert_eq!(loaded.skipped, vec!["b.rs".to_string(), "logo.png".to_string()]);
    }

    #[tokio::test]
    async fn test_oversized_files_dropped() {
        let host = FakeHost::new(&[("big.txt", b"0123456789"), ("small.txt", b"01")]);
        let config = GithubConfig {
            max_file_bytes: 5,
            ..Default::default()
        };
        let loaded = load_repository(&host, &repo(), &config).await.unwrap();
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].path, "small.txt");
        assert!(loaded.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_files_sorted_by_path() {
        let host = FakeHost::new(&[("z.rs", b"z"), ("a.rs", b"a"), ("m/n.rs", b"n")]);
        let loaded = load_repository(&host, &repo(), &GithubConfig::default())
            .await
            .unwrap();
        let paths: Vec<&str> = loaded.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.rs", "m/n.rs", "z.rs"]);
        assert!(!loaded.truncated);
    }

    #[tokio::test]
    async fn test_truncated_listing_is_reported() {
        let mut host = FakeHost::new(&[("a.rs", b"a")]);
        host.truncated = true;
        let loaded = load_repository(&host, &repo(), &GithubConfig::default())
            .await
            .unwrap();
        assert!(loaded.truncated);
        assert_eq!(loaded.files.len(), 1);
    }
}
