//! Evidence linking: tie each choice to the passage sentences that ground it.
//!
//! Primary path scores declared candidates by cosine similarity over cached
//! embeddings. When embeddings are unavailable the linker degrades to lexical
//! token overlap. A choice whose declared ids all fall outside the passage
//! comes back with no evidence at all; that is a repair condition, not a
//! linking problem to paper over.

use crate::models::{EvidenceDiagnostics, Sentence};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-run embedding cache.
///
/// Passage sentences are embedded once per run; choice texts are refreshed
/// only for choices rewritten in a repair round.
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    by_sentence: HashMap<i64, Vec<f32>>,
    by_choice: HashMap<usize, Vec<f32>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_sentence(&mut self, id: i64, vector: Vec<f32>) {
        self.by_sentence.insert(id, vector);
    }

    pub fn put_choice(&mut self, index: usize, vector: Vec<f32>) {
        self.by_choice.insert(index, vector);
    }

    pub fn sentence(&self, id: i64) -> Option<&Vec<f32>> {
        self.by_sentence.get(&id)
    }

    pub fn choice(&self, index: usize) -> Option<&Vec<f32>> {
        self.by_choice.get(&index)
    }

    /// True when both the choice vector and every candidate sentence vector
    /// are present, so cosine linking can run.
    pub fn covers(&self, choice_index: usize, sentence_ids: &[i64]) -> bool {
        self.by_choice.contains_key(&choice_index)
            && sentence_ids.iter().all(|id| self.by_sentence.contains_key(id))
    }
}

/// Cosine similarity; zero-length or mismatched vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Tokenize for the lexical fallback: runs of alphanumerics or Hangul,
/// lowercased.
fn tokens(text: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    let mut current = String::new();
    for c in text.chars() {
        let keep = c.is_alphanumeric() || ('\u{AC00}'..='\u{D7A3}').contains(&c);
        if keep {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            set.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        set.insert(current);
    }
    set
}

/// Candidate ids for a choice: the declared ids that exist in the passage,
/// deduplicated, declaration order preserved. Nothing surviving validation
/// means the choice has no usable evidence; widening to unrelated sentences
/// would hide that condition from the repair loop.
fn candidate_ids(declared: &[i64], sentences: &[Sentence]) -> Vec<i64> {
    let valid: HashSet<i64> = sentences.iter().map(|s| s.id).collect();
    let mut seen = HashSet::new();
    declared
        .iter()
        .copied()
        .filter(|id| valid.contains(id) && seen.insert(*id))
        .collect()
}

/// Link one choice to its evidence sentences.
///
/// Keeps every candidate at or above `sim_threshold` (strongest first,
/// at most `max_keep`); when none clears the bar, keeps the single best.
/// Missing embeddings route to [`overlap_fallback`]. Empty output means the
/// declared set was empty after validation; the caller fails that choice
/// into repair.
pub fn link_evidence(
    choice_index: usize,
    choice_text: &str,
    declared: &[i64],
    sentences: &[Sentence],
    cache: &EmbeddingCache,
    sim_threshold: f64,
    max_keep: usize,
) -> EvidenceDiagnostics {
    let candidates = candidate_ids(declared, sentences);
    if candidates.is_empty() {
        return EvidenceDiagnostics {
            method: "embed_cached".to_string(),
            picked: Vec::new(),
            similarity_by_id: BTreeMap::new(),
        };
    }

    if !cache.covers(choice_index, &candidates) {
        return overlap_fallback(choice_text, declared, sentences, max_keep);
    }

    let choice_vec = match cache.choice(choice_index) {
        Some(v) => v,
        None => return overlap_fallback(choice_text, declared, sentences, max_keep),
    };

    let mut scored: Vec<(i64, f64)> = candidates
        .iter()
        .map(|id| {
            let sim = cache
                .sentence(*id)
                .map(|v| cosine(choice_vec, v))
                .unwrap_or(0.0);
            (*id, sim)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let similarity_by_id: BTreeMap<i64, f64> = scored.iter().copied().collect();

    let mut picked: Vec<i64> = scored
        .iter()
        .filter(|(_, sim)| *sim >= sim_threshold)
        .take(max_keep)
        .map(|(id, _)| *id)
        .collect();
    if picked.is_empty() {
        if let Some((best_id, _)) = scored.first() {
            picked.push(*best_id);
        }
    }

    EvidenceDiagnostics {
        method: "embed_cached".to_string(),
        picked,
        similarity_by_id,
    }
}

/// Lexical fallback: score candidates by shared token count with the choice.
///
/// When every overlap is zero, keeps the first declared (or first passage)
/// sentence so downstream verification still has something to cite.
pub fn overlap_fallback(
    choice_text: &str,
    declared: &[i64],
    sentences: &[Sentence],
    max_keep: usize,
) -> EvidenceDiagnostics {
    let candidates = candidate_ids(declared, sentences);
    let by_id: HashMap<i64, &Sentence> = sentences.iter().map(|s| (s.id, s)).collect();
    let choice_tokens = tokens(choice_text);

    let mut scored: Vec<(i64, f64)> = candidates
        .iter()
        .filter_map(|id| by_id.get(id).map(|s| (*id, s)))
        .map(|(id, sentence)| {
            let overlap = tokens(&sentence.text)
                .intersection(&choice_tokens)
                .count();
            (id, overlap as f64)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let similarity_by_id: BTreeMap<i64, f64> = scored.iter().copied().collect();

    let mut picked: Vec<i64> = scored
        .iter()
        .filter(|(_, score)| *score > 0.0)
        .take(max_keep)
        .map(|(id, _)| *id)
        .collect();
    if picked.is_empty() {
        if let Some(id) = candidates.first() {
            picked.push(*id);
        }
    }

    EvidenceDiagnostics {
        method: "overlap_fallback".to_string(),
        picked,
        similarity_by_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences() -> Vec<Sentence> {
        vec![
            Sentence {
                id: 1,
                text: "Tides rise twice a day on most coasts.".to_string(),
            },
            Sentence {
                id: 2,
                text: "The moon's gravity pulls the ocean toward it.".to_string(),
            },
            Sentence {
                id: 3,
                text: "Basalt is a common volcanic rock.".to_string(),
            },
        ]
    }

    #[test]
    fn test_cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_link_keeps_only_above_threshold() {
        let mut cache = EmbeddingCache::new();
        cache.put_choice(0, vec![1.0, 0.0]);
        // sim(2) = 0.40 above threshold, sim(3) = 0.10 below
        cache.put_sentence(2, vec![0.40, (1.0f32 - 0.40 * 0.40).sqrt()]);
        cache.put_sentence(3, vec![0.10, (1.0f32 - 0.10 * 0.10).sqrt()]);

        let diag = link_evidence(0, "choice", &[2, 3], &sentences(), &cache, 0.22, 2);
        assert_eq!(diag.method, "embed_cached");
        assert_eq!(diag.picked, vec![2]);
        assert!((diag.similarity_by_id[&2] - 0.40).abs() < 1e-6);
    }

    #[test]
    fn test_link_keeps_single_best_when_none_pass() {
        let mut cache = EmbeddingCache::new();
        cache.put_choice(0, vec![1.0, 0.0]);
        cache.put_sentence(1, vec![0.05, 1.0]);
        cache.put_sentence(2, vec![0.15, 1.0]);

        let diag = link_evidence(0, "choice", &[1, 2], &sentences(), &cache, 0.22, 2);
        assert_eq!(diag.picked, vec![2]);
    }

    #[test]
    fn test_link_is_idempotent() {
        let mut cache = EmbeddingCache::new();
        cache.put_choice(0, vec![0.6, 0.8]);
        cache.put_sentence(1, vec![0.6, 0.8]);
        cache.put_sentence(2, vec![0.8, 0.6]);

        let first = link_evidence(0, "choice", &[1, 2], &sentences(), &cache, 0.22, 2);
        let second = link_evidence(0, "choice", &first.picked, &sentences(), &cache, 0.22, 2);
        assert_eq!(second.picked[0], first.picked[0]);
    }

    #[test]
    fn test_missing_embeddings_fall_back_to_overlap() {
        let cache = EmbeddingCache::new();
        let diag = link_evidence(
            0,
            "The moon's gravity pulls the ocean.",
            &[1, 2],
            &sentences(),
            &cache,
            0.22,
            2,
        );
        assert_eq!(diag.method, "overlap_fallback");
        assert_eq!(diag.picked.first(), Some(&2));
    }

    #[test]
    fn test_overlap_zero_keeps_first_declared() {
        let diag = overlap_fallback("완전히 다른 내용", &[3, 1], &sentences(), 2);
        assert_eq!(diag.picked, vec![3]);
    }

    #[test]
    fn test_invalid_declared_ids_yield_empty_evidence() {
        let mut cache = EmbeddingCache::new();
        cache.put_choice(0, vec![1.0, 0.0]);
        for s in sentences() {
            cache.put_sentence(s.id, vec![0.5, 0.5]);
        }

        let diag = link_evidence(0, "choice", &[99, 100], &sentences(), &cache, 0.22, 2);
        assert!(diag.picked.is_empty());
        assert!(diag.similarity_by_id.is_empty());
    }

    #[test]
    fn test_overlap_fallback_invalid_ids_yield_empty_evidence() {
        let diag = overlap_fallback("Tides rise twice a day.", &[99], &sentences(), 2);
        assert!(diag.picked.is_empty());
    }

    #[test]
    fn test_duplicate_declared_ids_dedup_but_survive() {
        let cache = EmbeddingCache::new();
        let diag = link_evidence(0, "Basalt is volcanic rock.", &[3, 3, 99], &sentences(), &cache, 0.22, 2);
        assert_eq!(diag.picked, vec![3]);
    }

    #[test]
    fn test_empty_passage_yields_empty_evidence() {
        let cache = EmbeddingCache::new();
        let diag = link_evidence(0, "choice", &[1], &[], &cache, 0.22, 2);
        assert!(diag.picked.is_empty());
    }
}
