//! Similarity retrieval over a project's artifact vectors.
//!
//! The question is embedded with the same model that indexed the project,
//! then every comparable stored vector is scored by cosine similarity. A
//! hit must score strictly above the threshold; hits are ordered by
//! descending similarity, ties by ascending path, and cut to `top_k`.

use anyhow::Result;

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, embed_one, Embedder};
use crate::error::Error;
use crate::models::{RetrievedArtifact, StoredVector};
use crate::store::Store;

pub async fn retrieve(
    store: &Store,
    embedder: &dyn Embedder,
    config: &RetrievalConfig,
    project_id: &str,
    question: &str,
) -> Result<Vec<RetrievedArtifact>> {
    let question = question.trim();
    if question.is_empty() {
        return Err(Error::Input("question is empty".to_string()).into());
    }

    let query_vec = embed_one(embedder, question).await?;
    let candidates = store
        .artifact_vectors(project_id, embedder.model_name(), embedder.dims())
        .await?;

    let ranked = rank_candidates(&query_vec, candidates, config.similarity_threshold, config.top_k);
    tracing::debug!(project = project_id, hits = ranked.len(), "retrieval finished");
    Ok(ranked)
}

pub fn rank_candidates(
    query_vec: &[f32],
    candidates: Vec<StoredVector>,
    threshold: f32,
    top_k: usize,
) -> Vec<RetrievedArtifact> {
    let mut hits: Vec<RetrievedArtifact> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let similarity = cosine_similarity(query_vec, &candidate.embedding);
            (similarity > threshold).then(|| RetrievedArtifact {
                path: candidate.path,
                source: candidate.source,
                summary: candidate.summary,
                similarity,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.path.cmp(&b.path))
    });
    hits.truncate(top_k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(path: &str, embedding: Vec<f32>) -> StoredVector {
        StoredVector {
            path: path.to_string(),
            source: String::new(),
            summary: String::new(),
            embedding,
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        // edge.rs scores exactly 0.5
        let hits = rank_candidates(
            &[1.0, 0.0, 0.0, 0.0],
            vec![
                stored("same.rs", vec![2.0, 0.0, 0.0, 0.0]),
                stored("edge.rs", vec![1.0, 1.0, 1.0, 1.0]),
            ],
            0.5,
            10,
        );
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["same.rs"]);
    }

    #[test]
    fn test_sorted_descending_with_path_tiebreak() {
        let hits = rank_candidates(
            &[1.0, 0.0],
            vec![
                stored("b.rs", vec![1.0, 0.0]),
                stored("c.rs", vec![1.0, 0.2]),
                stored("a.rs", vec![3.0, 0.0]),
            ],
            0.0,
            10,
        );
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["a.rs", "b.rs", "c.rs"]);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[test]
    fn test_truncates_to_top_k() {
        let candidates = (0..20)
            .map(|i| stored(&format!("f{:02}.rs", i), vec![1.0, i as f32 * 0.01]))
            .collect();
        let hits = rank_candidates(&[1.0, 0.0], candidates, 0.5, 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].path, "f00.rs");
    }

    #[test]
    fn test_no_candidates_above_threshold() {
        let hits = rank_candidates(&[1.0, 0.0], vec![stored("x.rs", vec![0.0, 1.0])], 0.5, 10);
        assert!(hits.is_empty());
    }
}
