//! Incremental commit tracking.
//!
//! A poll lists the latest `github.commit_limit` commits, drops hashes the
//! store already holds, summarizes the rest with `ingest.commit_concurrency`
//! diffs in flight, and appends them. Duplicate hashes that race in from a
//! concurrent poll are absorbed by the `(project_id, hash)` constraint and
//! counted, not raised. A commit whose diff or summary fails is still
//! stored, with an empty summary.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};

use crate::config::Config;
use crate::error::Error;
use crate::github::{RepoHost, RepoLocator};
use crate::models::{CommitInfo, NewCommit};
use crate::store::Store;
use crate::summarize::Summarizer;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    /// Commits returned by the hosting API.
    pub fetched: usize,
    /// Of those, hashes not yet stored.
    pub new: usize,
    pub inserted: u64,
    pub duplicates: u64,
    pub summary_failures: usize,
}

pub struct CommitContext<'a> {
    pub host: &'a dyn RepoHost,
    pub store: &'a Store,
    pub summarizer: &'a Summarizer,
    pub config: &'a Config,
}

pub async fn poll_commits(ctx: &CommitContext<'_>, project_id: &str) -> Result<PollReport> {
    let project = ctx
        .store
        .get_project(project_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
    let repo = RepoLocator::parse(&project.repo_url)?;

    let upstream = ctx
        .host
        .list_commits(&repo, ctx.config.github.commit_limit)
        .await
        .with_context(|| format!("Failed to list commits for project {}", project_id))?;
    let known = ctx.store.commit_hashes(project_id).await?;

    let unseen: Vec<CommitInfo> = upstream
        .iter()
        .filter(|c| !known.contains(&c.hash))
        .cloned()
        .collect();

    let mut report = PollReport {
        fetched: upstream.len(),
        new: unseen.len(),
        ..Default::default()
    };
    if unseen.is_empty() {
        tracing::debug!(project = project_id, "no new commits");
        return Ok(report);
    }

    let mut summarized: Vec<(NewCommit, bool)> = stream::iter(unseen)
        .map(|info| summarize(ctx, &repo, info))
        .buffer_unordered(ctx.config.ingest.commit_concurrency.max(1))
        .collect()
        .await;
    summarized.sort_by(|a, b| {
        b.0.info
            .timestamp
            .cmp(&a.0.info.timestamp)
            .then_with(|| a.0.info.hash.cmp(&b.0.info.hash))
    });

    report.summary_failures = summarized.iter().filter(|(_, ok)| !ok).count();
    let commits: Vec<NewCommit> = summarized.into_iter().map(|(c, _)| c).collect();

    let outcome = ctx.store.append_commits(project_id, &commits).await?;
    report.inserted = outcome.inserted;
    report.duplicates = outcome.duplicates;

    tracing::info!(
        project = project_id,
        fetched = report.fetched,
        inserted = report.inserted,
        duplicates = report.duplicates,
        summary_failures = report.summary_failures,
        "commits polled"
    );
    Ok(report)
}

/// Summarize one commit. The boolean is false when the summary fell back
/// to empty.
async fn summarize(ctx: &CommitContext<'_>, repo: &RepoLocator, info: CommitInfo) -> (NewCommit, bool) {
    let result: Result<String> = async {
        let diff = ctx.host.commit_diff(repo, &info.hash).await?;
        ctx.summarizer.summarize_commit(&info.hash, &diff).await
    }
    .await;

    match result {
        Ok(summary) => (NewCommit { info, summary }, true),
        Err(e) => {
            tracing::warn!(hash = %info.hash, error = %format!("{:#}", e), "commit summary failed");
            (
                NewCommit {
                    info,
                    summary: String::new(),
                },
                false,
            )
        }
    }
}
