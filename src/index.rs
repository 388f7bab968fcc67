//! Artifact writes and vector reconciliation.
//!
//! [`write_artifacts`] persists summarized files one transaction per file.
//! Files whose embedding failed are still written, with a NULL vector;
//! [`reconcile`] later finds those rows (and rows embedded by a different
//! model) and attaches fresh vectors.

use anyhow::Result;

use crate::embedding::Embedder;
use crate::error::Error;
use crate::models::{IndexedFile, ItemFailure};
use crate::store::Store;

const RECONCILE_BATCH: usize = 16;

#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    /// Rows written with a vector.
    pub written: usize,
    /// Rows written without a vector, awaiting reconciliation.
    pub staged: usize,
    pub failed: Vec<ItemFailure>,
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub pending: usize,
    pub repaired: usize,
    pub failed: Vec<ItemFailure>,
}

/// Write every file, continuing past individual failures.
pub async fn write_artifacts(
    store: &Store,
    project_id: &str,
    model: &str,
    files: &[IndexedFile],
) -> IndexReport {
    let mut report = IndexReport::default();

    for file in files {
        match store.replace_artifact(project_id, file, model).await {
            Ok(()) if file.embedding.is_some() => report.written += 1,
            Ok(()) => report.staged += 1,
            Err(e) => {
                let err = anyhow::Error::new(Error::PartialWrite {
                    path: file.path.clone(),
                    reason: format!("{:#}", e),
                });
                tracing::warn!(path = %file.path, error = %err, "artifact write failed");
                report.failed.push(ItemFailure::new(&file.path, &err));
            }
        }
    }

    report
}

/// Re-embed staged or stale artifacts of one project.
pub async fn reconcile(
    store: &Store,
    embedder: &dyn Embedder,
    project_id: &str,
) -> Result<ReconcileReport> {
    let pending = store
        .pending_artifacts(project_id, embedder.model_name(), embedder.dims())
        .await?;

    let mut report = ReconcileReport {
        pending: pending.len(),
        ..Default::default()
    };

    for batch in pending.chunks(RECONCILE_BATCH) {
        let texts: Vec<String> = batch.iter().map(|p| p.summary.clone()).collect();
        let vectors = match embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => vectors,
            Ok(vectors) => {
                let err = anyhow::anyhow!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                );
                report
                    .failed
                    .extend(batch.iter().map(|p| ItemFailure::new(&p.path, &err)));
                continue;
            }
            Err(e) => {
                tracing::warn!(project = project_id, error = %format!("{:#}", e), "reconcile batch failed");
                report
                    .failed
                    .extend(batch.iter().map(|p| ItemFailure::new(&p.path, &e)));
                continue;
            }
        };

        for (artifact, vector) in batch.iter().zip(vectors.iter()) {
            if vector.len() != embedder.dims() {
                let err = anyhow::anyhow!(
                    "expected {} dimensions, got {}",
                    embedder.dims(),
                    vector.len()
                );
                report.failed.push(ItemFailure::new(&artifact.path, &err));
                continue;
            }
            match store
                .attach_embedding(&artifact.id, embedder.model_name(), vector)
                .await
            {
                Ok(()) => report.repaired += 1,
                Err(e) => report.failed.push(ItemFailure::new(&artifact.path, &e)),
            }
        }
    }

    Ok(report)
}
