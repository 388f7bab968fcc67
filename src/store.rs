//! SQLite-backed persistence for projects, artifacts, commits and questions.
//!
//! Every public method is a single statement or a single transaction, so
//! callers never see a half-written artifact or a half-created project.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{
    ArtifactFingerprint, CommitRecord, IndexedFile, NewCommit, PendingArtifact, Project,
    QuestionLog, RetrievedArtifact, StoredVector,
};

/// Outcome of appending a batch of commits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub inserted: u64,
    /// Rows rejected by the `(project_id, hash)` constraint.
    pub duplicates: u64,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Projects ============

    /// Create a project and make `user_id` a member, atomically.
    pub async fn create_project(&self, name: &str, repo_url: &str, user_id: &str) -> Result<Project> {
        let now = chrono::Utc::now().timestamp();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO projects (id, name, repo_url, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.repo_url)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO project_members (user_id, project_id, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(&project.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(project)
    }

    /// Fetch a project that has not been soft-deleted.
    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, repo_url, created_at, updated_at, deleted_at FROM projects WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(project_from_row))
    }

    pub async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.repo_url, p.created_at, p.updated_at, p.deleted_at
            FROM projects p
            JOIN project_members m ON m.project_id = p.id
            WHERE m.user_id = ? AND p.deleted_at IS NULL
            ORDER BY p.created_at DESC, p.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(project_from_row).collect())
    }

    pub async fn list_active_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, name, repo_url, created_at, updated_at, deleted_at FROM projects WHERE deleted_at IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(project_from_row).collect())
    }

    /// Mark a project deleted. Returns false when it was already gone.
    pub async fn soft_delete_project(&self, id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE projects SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ============ Artifacts ============

    pub async fn artifact_fingerprints(
        &self,
        project_id: &str,
    ) -> Result<HashMap<String, ArtifactFingerprint>> {
        let rows = sqlx::query(
            "SELECT path, content_hash, embedding_model, embedding IS NOT NULL AS has_vector FROM artifacts WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("path"),
                    ArtifactFingerprint {
                        content_hash: row.get("content_hash"),
                        embedding_model: row.get("embedding_model"),
                        has_vector: row.get("has_vector"),
                    },
                )
            })
            .collect())
    }

    /// Replace the artifact for `file.path` in one transaction.
    ///
    /// The row and its vector land together; a file without an embedding is
    /// written with a NULL vector so `reconcile` can find it.
    pub async fn replace_artifact(
        &self,
        project_id: &str,
        file: &IndexedFile,
        model: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let blob = file.embedding.as_deref().map(vec_to_blob);
        let dims = file.embedding.as_ref().map(|v| v.len() as i64);
        let model = file.embedding.as_ref().map(|_| model);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM artifacts WHERE project_id = ? AND path = ?")
            .bind(project_id)
            .bind(&file.path)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, project_id, path, source, summary, content_hash,
                                   embedding, embedding_model, dims, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(&file.path)
        .bind(&file.source)
        .bind(&file.summary)
        .bind(&file.content_hash)
        .bind(blob)
        .bind(model)
        .bind(dims)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Delete artifacts whose path is not in `keep`. Returns the number removed.
    pub async fn prune_artifacts(&self, project_id: &str, keep: &HashSet<String>) -> Result<u64> {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT path FROM artifacts WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for path in existing.iter().filter(|p| !keep.contains(*p)) {
            removed += sqlx::query("DELETE FROM artifacts WHERE project_id = ? AND path = ?")
                .bind(project_id)
                .bind(path)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Artifacts with no vector, or a vector from another model or size.
    pub async fn pending_artifacts(
        &self,
        project_id: &str,
        model: &str,
        dims: usize,
    ) -> Result<Vec<PendingArtifact>> {
        let rows = sqlx::query(
            r#"
            SELECT id, path, summary FROM artifacts
            WHERE project_id = ?
              AND (embedding IS NULL OR embedding_model IS NOT ? OR dims IS NOT ?)
            ORDER BY path
            "#,
        )
        .bind(project_id)
        .bind(model)
        .bind(dims as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PendingArtifact {
                id: row.get("id"),
                path: row.get("path"),
                summary: row.get("summary"),
            })
            .collect())
    }

    /// Attach a vector to a staged artifact.
    pub async fn attach_embedding(&self, artifact_id: &str, model: &str, vector: &[f32]) -> Result<()> {
        sqlx::query("UPDATE artifacts SET embedding = ?, embedding_model = ?, dims = ? WHERE id = ?")
            .bind(vec_to_blob(vector))
            .bind(model)
            .bind(vector.len() as i64)
            .bind(artifact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every vector of the project comparable with `model`/`dims`.
    pub async fn artifact_vectors(
        &self,
        project_id: &str,
        model: &str,
        dims: usize,
    ) -> Result<Vec<StoredVector>> {
        let rows = sqlx::query(
            r#"
            SELECT path, source, summary, embedding FROM artifacts
            WHERE project_id = ? AND embedding IS NOT NULL
              AND embedding_model = ? AND dims = ?
            "#,
        )
        .bind(project_id)
        .bind(model)
        .bind(dims as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                StoredVector {
                    path: row.get("path"),
                    source: row.get("source"),
                    summary: row.get("summary"),
                    embedding: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    pub async fn artifact_paths(&self, project_id: &str) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar("SELECT path FROM artifacts WHERE project_id = ? ORDER BY path")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    // ============ Commits ============

    pub async fn commit_hashes(&self, project_id: &str) -> Result<HashSet<String>> {
        let hashes: Vec<String> = sqlx::query_scalar("SELECT hash FROM commits WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(hashes.into_iter().collect())
    }

    /// Append commits; hashes already present are skipped, not errors.
    pub async fn append_commits(&self, project_id: &str, commits: &[NewCommit]) -> Result<AppendOutcome> {
        let now = chrono::Utc::now().timestamp();
        let mut outcome = AppendOutcome::default();

        let mut tx = self.pool.begin().await?;
        for commit in commits {
            let result = sqlx::query(
                r#"
                INSERT INTO commits (id, project_id, hash, message, author_name,
                                     author_avatar_url, committed_at, summary, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(project_id, hash) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(project_id)
            .bind(&commit.info.hash)
            .bind(&commit.info.message)
            .bind(&commit.info.author_name)
            .bind(&commit.info.author_avatar_url)
            .bind(commit.info.timestamp.timestamp())
            .bind(&commit.summary)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        tx.commit().await?;

        Ok(outcome)
    }

    /// Commits of a project, newest first.
    pub async fn list_commits(&self, project_id: &str) -> Result<Vec<CommitRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, hash, message, author_name, author_avatar_url,
                   committed_at, summary, created_at
            FROM commits
            WHERE project_id = ?
            ORDER BY committed_at DESC, hash
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CommitRecord {
                id: row.get("id"),
                project_id: row.get("project_id"),
                hash: row.get("hash"),
                message: row.get("message"),
                author_name: row.get("author_name"),
                author_avatar_url: row.get("author_avatar_url"),
                committed_at: row.get("committed_at"),
                summary: row.get("summary"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ============ Questions ============

    pub async fn insert_question(
        &self,
        project_id: &str,
        user_id: &str,
        question: &str,
        answer: &str,
        references: &[RetrievedArtifact],
    ) -> Result<QuestionLog> {
        let log = QuestionLog {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            references: references.to_vec(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let references_json = serde_json::to_string(&log.references)?;

        sqlx::query(
            r#"
            INSERT INTO questions (id, project_id, user_id, question, answer, references_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.project_id)
        .bind(&log.user_id)
        .bind(&log.question)
        .bind(&log.answer)
        .bind(&references_json)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;

        Ok(log)
    }

    /// Saved questions of a project, newest first.
    pub async fn list_questions(&self, project_id: &str) -> Result<Vec<QuestionLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, user_id, question, answer, references_json, created_at
            FROM questions
            WHERE project_id = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<QuestionLog> {
                let references_json: String = row.get("references_json");
                let references = serde_json::from_str(&references_json)
                    .with_context(|| "Corrupt question references")?;
                Ok(QuestionLog {
                    id: row.get("id"),
                    project_id: row.get("project_id"),
                    user_id: row.get("user_id"),
                    question: row.get("question"),
                    answer: row.get("answer"),
                    references,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

fn project_from_row(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        name: row.get("name"),
        repo_url: row.get("repo_url"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::CommitInfo;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn test_store(tmp: &TempDir) -> Store {
        let path = tmp.path().join("rv.sqlite");
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        Store::new(pool)
    }

    fn commit(hash: &str, ts: i64) -> NewCommit {
        NewCommit {
            info: CommitInfo {
                hash: hash.to_string(),
                message: format!("commit {}", hash),
                author_name: "dev".to_string(),
                author_avatar_url: String::new(),
                timestamp: chrono::Utc.timestamp_opt(ts, 0).unwrap(),
            },
            summary: String::new(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_hash_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;
        let project = store.create_project("demo", "https://github.com/o/r", "u1").await.unwrap();

        let first = store
            .append_commits(&project.id, &[commit("a", 1), commit("b", 2)])
            .await
            .unwrap();
        assert_eq!(first, AppendOutcome { inserted: 2, duplicates: 0 });

        let second = store
            .append_commits(&project.id, &[commit("b", 2), commit("c", 3)])
            .await
            .unwrap();
        assert_eq!(second, AppendOutcome { inserted: 1, duplicates: 1 });

        let listed = store.list_commits(&project.id).await.unwrap();
        let hashes: Vec<&str> = listed.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_replace_artifact_keeps_one_row_per_path() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;
        let project = store.create_project("demo", "https://github.com/o/r", "u1").await.unwrap();

        let mut file = IndexedFile {
            path: "src/lib.rs".to_string(),
            source: "v1".to_string(),
            summary: "first".to_string(),
            content_hash: "h1".to_string(),
            embedding: Some(vec![1.0, 0.0]),
        };
        store.replace_artifact(&project.id, &file, "m").await.unwrap();
        file.source = "v2".to_string();
        file.content_hash = "h2".to_string();
        store.replace_artifact(&project.id, &file, "m").await.unwrap();

        let vectors = store.artifact_vectors(&project.id, "m", 2).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].source, "v2");
    }

    #[tokio::test]
    async fn test_staged_rows_are_pending_and_hidden_from_scan() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;
        let project = store.create_project("demo", "https://github.com/o/r", "u1").await.unwrap();

        let staged = IndexedFile {
            path: "a.rs".to_string(),
            source: "fn a() {}".to_string(),
            summary: "defines a".to_string(),
            content_hash: "h".to_string(),
            embedding: None,
        };
        store.replace_artifact(&project.id, &staged, "m").await.unwrap();

        assert!(store.artifact_vectors(&project.id, "m", 2).await.unwrap().is_empty());
        let pending = store.pending_artifacts(&project.id, "m", 2).await.unwrap();
        assert_eq!(pending.len(), 1);

        store.attach_embedding(&pending[0].id, "m", &[0.5, 0.5]).await.unwrap();
        assert!(store.pending_artifacts(&project.id, "m", 2).await.unwrap().is_empty());
        assert_eq!(store.artifact_vectors(&project.id, "m", 2).await.unwrap().len(), 1);
        // a different model sees it as stale
        assert_eq!(store.pending_artifacts(&project.id, "other", 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_deleted_projects_are_hidden() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp).await;
        let project = store.create_project("demo", "https://github.com/o/r", "u1").await.unwrap();
        store.create_project("other", "https://github.com/o/s", "u2").await.unwrap();

        assert_eq!(store.list_projects("u1").await.unwrap().len(), 1);
        assert!(store.soft_delete_project(&project.id).await.unwrap());
        assert!(!store.soft_delete_project(&project.id).await.unwrap());
        assert!(store.get_project(&project.id).await.unwrap().is_none());
        assert!(store.list_projects("u1").await.unwrap().is_empty());
    }
}
