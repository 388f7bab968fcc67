//! Core data models.
//!
//! Persisted rows carry Unix-second timestamps like the schema does;
//! values coming from the hosting API keep `DateTime<Utc>` until they are
//! written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository being indexed, owned by one or more users.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// A file fetched from the repository, before summarization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub path: String,
    pub content: String,
}

/// A file that is summarized and ready for the index writer.
///
/// `embedding` is `None` when the embedding call failed; the row is then
/// staged for reconciliation instead of being dropped.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub path: String,
    pub source: String,
    pub summary: String,
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
}

/// What the store already knows about an artifact, used to skip unchanged files.
#[derive(Debug, Clone)]
pub struct ArtifactFingerprint {
    pub content_hash: String,
    pub embedding_model: Option<String>,
    pub has_vector: bool,
}

/// An artifact that needs its vector (re)attached.
#[derive(Debug, Clone)]
pub struct PendingArtifact {
    pub id: String,
    pub path: String,
    pub summary: String,
}

/// A stored artifact with its decoded vector, as seen by the retrieval scan.
#[derive(Debug, Clone)]
pub struct StoredVector {
    pub path: String,
    pub source: String,
    pub summary: String,
    pub embedding: Vec<f32>,
}

/// A ranked retrieval hit. Also the snapshot stored with a saved answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedArtifact {
    pub path: String,
    pub source: String,
    pub summary: String,
    pub similarity: f32,
}

/// One commit as reported by the hosting API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub author_name: String,
    pub author_avatar_url: String,
    pub timestamp: DateTime<Utc>,
}

/// A summarized commit ready to be appended.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub info: CommitInfo,
    pub summary: String,
}

/// A persisted commit.
#[derive(Debug, Clone, Serialize)]
pub struct CommitRecord {
    pub id: String,
    pub project_id: String,
    pub hash: String,
    pub message: String,
    pub author_name: String,
    pub author_avatar_url: String,
    pub committed_at: i64,
    pub summary: String,
    pub created_at: i64,
}

/// A question, its answer, and the artifacts used as evidence.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionLog {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub question: String,
    pub answer: String,
    pub references: Vec<RetrievedArtifact>,
    pub created_at: i64,
}

/// A single item that failed inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub error: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            item: item.into(),
            error: format!("{:#}", err),
        }
    }
}
