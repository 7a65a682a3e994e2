//! Multi-query fan-out retrieval with group-level aggregation.
//!
//! The chosen query, its phrasing variants and an optional hypothetical
//! document are embedded in one batch and searched independently; hits are
//! collapsed to at most one candidate per group id, keeping the best score
//! and the query that produced it.

use crate::capability::Embedder;
use crate::models::{Result, RetrievalCandidate, RetrievalConfig, TekmerionError};
use crate::retrieval::index::VectorIndex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Marker recorded as `matched_query` when the hypothetical-document
/// embedding produced the best hit; the text itself never surfaces.
pub const HYDE_QUERY_MARKER: &str = "[hyde]";

/// Raw per-row fan-out budget, before group aggregation trims the set.
const RAW_K_FACTOR: usize = 3;

/// Assemble the fan-out query set: the chosen query first, then distinct
/// variants, capped at `multi_query_n`.
pub fn fanout_queries(chosen: &str, variants: &[String], multi_query_n: usize) -> Vec<String> {
    let mut queries = vec![chosen.trim().to_string()];
    let mut seen: HashSet<String> = queries.iter().map(|q| q.to_lowercase()).collect();
    for variant in variants {
        let variant = variant.trim();
        if variant.is_empty() || !seen.insert(variant.to_lowercase()) {
            continue;
        }
        queries.push(variant.to_string());
        if queries.len() >= multi_query_n.max(1) {
            break;
        }
    }
    queries
}

/// Collapse per-query hits to one candidate per group, by max score.
pub fn aggregate_by_group(
    per_query: &[(String, Vec<(usize, f64)>)],
    index: &VectorIndex,
    exclude: &HashSet<String>,
    min_score: f64,
) -> Vec<RetrievalCandidate> {
    let mut best: HashMap<String, RetrievalCandidate> = HashMap::new();

    for (query, hits) in per_query {
        for (row, score) in hits {
            let Some(record) = index.record(*row) else { continue };
            if *score < min_score || exclude.contains(&record.group_id) {
                continue;
            }
            let entry = best.entry(record.group_id.clone());
            match entry {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if *score > slot.get().score {
                        let candidate = slot.get_mut();
                        candidate.score = *score;
                        candidate.matched_query = query.clone();
                    }
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(RetrievalCandidate {
                        group_id: record.group_id.clone(),
                        score: *score,
                        matched_query: query.clone(),
                        title: record.title.clone(),
                        passage: record.passage.clone(),
                        topic: record.topic.clone(),
                    });
                }
            }
        }
    }

    let mut candidates: Vec<RetrievalCandidate> = best.into_values().collect();
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}

/// Run the fan-out search.
///
/// All query texts (plus the optional hypothetical document) go through one
/// embedding batch; each vector searches the index with an oversized raw k
/// so group aggregation has enough to dedup from. An empty outcome is the
/// `RetrievalEmpty` condition, surfaced to the caller as not-found.
pub async fn retrieve<E: Embedder>(
    embedder: &E,
    index: &VectorIndex,
    queries: &[String],
    hyde_text: Option<&str>,
    exclude: &HashSet<String>,
    config: &RetrievalConfig,
) -> Result<Vec<RetrievalCandidate>> {
    let mut texts: Vec<String> = queries.to_vec();
    let mut labels: Vec<String> = queries.to_vec();
    if let Some(hyde) = hyde_text.filter(|h| !h.trim().is_empty()) {
        texts.push(hyde.to_string());
        labels.push(HYDE_QUERY_MARKER.to_string());
    }

    if texts.is_empty() {
        return Err(TekmerionError::RetrievalEmpty);
    }

    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(TekmerionError::CapabilityUnavailable(
            "query embedding".to_string(),
        ));
    }

    let raw_k = config.top_k.max(1) * RAW_K_FACTOR;
    let per_query: Vec<(String, Vec<(usize, f64)>)> = labels
        .iter()
        .zip(vectors.iter())
        .map(|(label, vector)| {
            let hits = index
                .search(vector, raw_k)
                .into_iter()
                .map(|h| (h.row, h.score))
                .collect();
            (label.clone(), hits)
        })
        .collect();

    let mut candidates = aggregate_by_group(&per_query, index, exclude, config.min_score);
    candidates.truncate(config.top_k);

    debug!(
        queries = labels.len(),
        candidates = candidates.len(),
        "Fan-out retrieval complete"
    );

    if candidates.is_empty() {
        return Err(TekmerionError::RetrievalEmpty);
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::index::DocRecord;

    fn record(group: &str) -> DocRecord {
        DocRecord {
            group_id: group.to_string(),
            title: format!("title {group}"),
            passage: format!("passage {group}"),
            topic: None,
        }
    }

    fn index() -> VectorIndex {
        VectorIndex::from_rows(
            2,
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]],
            vec![record("a"), record("b"), record("a")],
        )
        .unwrap()
    }

    struct MapEmbedder;

    impl Embedder for MapEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("second") {
                        vec![0.1, 1.0]
                    } else {
                        vec![1.0, 0.0]
                    }
                })
                .collect())
        }
    }

    #[test]
    fn test_fanout_queries_dedups_and_caps() {
        let queries = fanout_queries(
            "main query",
            &[
                "Main Query".to_string(),
                "variant one".to_string(),
                "variant two".to_string(),
                "variant three".to_string(),
            ],
            3,
        );
        assert_eq!(queries, vec!["main query", "variant one", "variant two"]);
    }

    #[test]
    fn test_aggregate_keeps_max_score_per_group() {
        let idx = index();
        let per_query = vec![
            ("q1".to_string(), vec![(0usize, 0.8), (2usize, 0.9)]),
            ("q2".to_string(), vec![(0usize, 0.5), (1usize, 0.6)]),
        ];
        let candidates = aggregate_by_group(&per_query, &idx, &HashSet::new(), 0.22);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].group_id, "a");
        assert!((candidates[0].score - 0.9).abs() < 1e-9);
        assert_eq!(candidates[0].matched_query, "q1");
        assert_eq!(candidates[1].group_id, "b");
    }

    #[test]
    fn test_aggregate_applies_floor_and_exclusion() {
        let idx = index();
        let per_query = vec![("q".to_string(), vec![(0usize, 0.9), (1usize, 0.1)])];
        let exclude: HashSet<String> = ["a".to_string()].into_iter().collect();
        let candidates = aggregate_by_group(&per_query, &idx, &exclude, 0.22);
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_ranks_across_queries() {
        let idx = index();
        let queries = vec!["first concept".to_string(), "second concept".to_string()];
        let candidates = retrieve(
            &MapEmbedder,
            &idx,
            &queries,
            None,
            &HashSet::new(),
            &RetrievalConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].group_id, "a");
        assert_eq!(candidates[0].matched_query, "first concept");
        assert_eq!(candidates[1].matched_query, "second concept");
    }

    #[tokio::test]
    async fn test_retrieve_everything_excluded_is_empty() {
        let idx = index();
        let exclude: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let err = retrieve(
            &MapEmbedder,
            &idx,
            &["first".to_string()],
            None,
            &exclude,
            &RetrievalConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TekmerionError::RetrievalEmpty));
    }

    #[tokio::test]
    async fn test_retrieve_hyde_hit_uses_marker() {
        let idx = index();
        let candidates = retrieve(
            &MapEmbedder,
            &idx,
            &["second concept".to_string()],
            Some("A hypothetical first-concept passage."),
            &HashSet::new(),
            &RetrievalConfig::default(),
        )
        .await
        .unwrap();

        let a = candidates.iter().find(|c| c.group_id == "a").unwrap();
        assert_eq!(a.matched_query, HYDE_QUERY_MARKER);
    }
}
