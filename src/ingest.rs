//! Repository ingestion pipeline.
//!
//! Orchestrates the flow from a hosted repository to searchable artifacts:
//!
//! ```text
//! list tree → fetch files → skip unchanged → summarize → embed → write → prune
//! ```
//!
//! Summarize and embed run with `ingest.concurrency` files in flight; writes
//! are sequential, one transaction per file. A file is unchanged when its
//! content hash matches the stored row and that row already holds a vector
//! from the current embedding model, so re-ingesting an untouched
//! repository performs no model calls.
//!
//! Per-file failures never abort the run:
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | fetch, binary content | skipped; an existing row is kept |
//! | summary | reported in `failed`; an existing row is kept |
//! | embedding | row written without a vector (`staged`) |
//! | write | reported in `failed` |
//!
//! Rows whose path no longer exists in the tree are pruned, unless the host
//! reported a truncated listing; then every existing row is kept.

use anyhow::Result;
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::config::Config;
use crate::embedding::{embed_one, Embedder};
use crate::github::{RepoHost, RepoLocator};
use crate::index::write_artifacts;
use crate::loader::load_repository;
use crate::models::{IndexedFile, ItemFailure, RepoFile};
use crate::store::Store;
use crate::summarize::Summarizer;

#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    pub files_loaded: usize,
    pub skipped_fetch: usize,
    pub unchanged: usize,
    pub written: usize,
    pub staged: usize,
    pub failed: Vec<ItemFailure>,
    pub pruned: u64,
}

impl IngestReport {
    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

/// Everything a pipeline run needs, borrowed from the caller.
pub struct IngestContext<'a> {
    pub host: &'a dyn RepoHost,
    pub store: &'a Store,
    pub embedder: &'a dyn Embedder,
    pub summarizer: &'a Summarizer,
    pub config: &'a Config,
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Load, summarize, embed and persist every file of `repo` into `project_id`.
///
/// Fails only when the repository cannot be listed or the store cannot be
/// read; everything else is recorded in the report.
pub async fn ingest_repository(
    ctx: &IngestContext<'_>,
    project_id: &str,
    repo: &RepoLocator,
) -> Result<IngestReport> {
    let loaded = load_repository(ctx.host, repo, &ctx.config.github).await?;
    let fingerprints = ctx.store.artifact_fingerprints(project_id).await?;
    let model = ctx.embedder.model_name();

    let mut report = IngestReport {
        files_loaded: loaded.files.len(),
        skipped_fetch: loaded.skipped.len(),
        ..Default::default()
    };

    let mut keep: HashSet<String> = loaded.skipped.iter().cloned().collect();
    let mut changed: Vec<(RepoFile, String)> = Vec::new();
    for file in loaded.files {
        keep.insert(file.path.clone());
        let hash = content_hash(&file.content);
        let fresh = fingerprints.get(&file.path).is_some_and(|fp| {
            fp.content_hash == hash && fp.has_vector && fp.embedding_model.as_deref() == Some(model)
        });
        if fresh {
            report.unchanged += 1;
        } else {
            changed.push((file, hash));
        }
    }

    tracing::info!(
        project = project_id,
        changed = changed.len(),
        unchanged = report.unchanged,
        "indexing files"
    );

    let results: Vec<Result<IndexedFile, ItemFailure>> = stream::iter(changed)
        .map(|(file, hash)| index_file(ctx, file, hash))
        .buffer_unordered(ctx.config.ingest.concurrency.max(1))
        .collect()
        .await;

    let mut indexed = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(file) => indexed.push(file),
            Err(failure) => report.failed.push(failure),
        }
    }
    indexed.sort_by(|a, b| a.path.cmp(&b.path));

    let written = write_artifacts(ctx.store, project_id, model, &indexed).await;
    report.written = written.written;
    report.staged = written.staged;
    report.failed.extend(written.failed);
    report.failed.sort_by(|a, b| a.item.cmp(&b.item));

    if loaded.truncated {
        tracing::warn!(project = project_id, "tree listing truncated; skipping prune");
    } else {
        report.pruned = ctx.store.prune_artifacts(project_id, &keep).await?;
    }

    tracing::info!(
        project = project_id,
        written = report.written,
        staged = report.staged,
        failed = report.failure_count(),
        pruned = report.pruned,
        "ingestion finished"
    );
    Ok(report)
}

async fn index_file(
    ctx: &IngestContext<'_>,
    file: RepoFile,
    content_hash: String,
) -> Result<IndexedFile, ItemFailure> {
    let summary = match ctx.summarizer.summarize_file(&file.path, &file.content).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::warn!(path = %file.path, error = %format!("{:#}", e), "summary failed");
            return Err(ItemFailure::new(&file.path, &e));
        }
    };

    let embedding = match embed_one(ctx.embedder, &summary).await {
        Ok(vector) => Some(vector),
        Err(e) => {
            tracing::warn!(
                path = %file.path,
                error = %format!("{:#}", e),
                "embedding failed; staging artifact for reconcile"
            );
            None
        }
    };

    Ok(IndexedFile {
        path: file.path,
        source: file.content,
        summary,
        content_hash,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable_hex() {
        let a = content_hash("fn main() {}");
        assert_eq!(a, content_hash("fn main() {}"));
        assert_ne!(a, content_hash("fn main() { }"));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
