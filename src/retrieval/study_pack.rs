//! End-to-end "find me something easier" pipeline.
//!
//! rewrite -> evaluate -> refine under hysteresis -> fan-out retrieval ->
//! paraphrased study pack. The result is shaped like a generated item so the
//! simplified passage participates in the same sentence-id scheme, and it
//! carries the full query audit trail for the caller's bookkeeping.

use crate::capability::{parse_json_block, Embedder, Parsed, QualityScorer};
use crate::client::LlmClient;
use crate::models::{
    db_key, split_sentences, ModelSpec, Result, RetrievalCandidate, RetrievalConfig, StudyPack,
    StudyPackResult, TekmerionError, UsedContext,
};
use crate::retrieval::index::VectorIndex;
use crate::retrieval::multi_query::{fanout_queries, retrieve};
use crate::retrieval::refine::{evaluate_query, select_query};
use crate::retrieval::rewrite::rewrite_query;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Context snippet cap per retrieved passage.
const CONTEXT_SNIPPET_CHARS: usize = 800;

const PACK_SYSTEM: &str = "You write gentle study material grounded strictly in the provided \
context passages. Always output JSON only.";

/// One similar-material request.
#[derive(Debug, Clone)]
pub struct SimilarRequest {
    /// The passage the learner found too hard
    pub passage: String,
    /// Their stated reason, in their own words
    pub reason: String,
    /// Group ids already served to this learner
    pub exclude_group_ids: HashSet<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawStudyPack {
    #[serde(default)]
    title: String,
    #[serde(flatten)]
    pack: StudyPack,
}

/// Adaptive retrieval pipeline producing study packs.
pub struct SimilarPipeline<Q, E> {
    client: Arc<LlmClient>,
    rewriter: ModelSpec,
    quality: Arc<Q>,
    embedder: Arc<E>,
    index: Arc<VectorIndex>,
    config: RetrievalConfig,
}

impl<Q, E> SimilarPipeline<Q, E>
where
    Q: QualityScorer,
    E: Embedder,
{
    pub fn new(
        client: Arc<LlmClient>,
        rewriter: ModelSpec,
        quality: Arc<Q>,
        embedder: Arc<E>,
        index: Arc<VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            client,
            rewriter,
            quality,
            embedder,
            index,
            config,
        }
    }

    /// Run one request to completion.
    ///
    /// `RetrievalEmpty` propagates untouched so the caller can answer
    /// not-found instead of fabricating material.
    pub async fn run(&self, req: &SimilarRequest) -> Result<StudyPackResult> {
        if req.passage.trim().is_empty() {
            return Err(TekmerionError::InvalidInput(
                "passage must not be empty".to_string(),
            ));
        }

        let rewritten =
            rewrite_query(&self.client, &self.rewriter, &req.passage, &req.reason).await?;
        let eval_before =
            evaluate_query(&self.client, &self.rewriter, &rewritten, &req.reason, &self.config)
                .await?;
        let eval_after = evaluate_query(
            &self.client,
            &self.rewriter,
            &eval_before.improved,
            &req.reason,
            &self.config,
        )
        .await?;

        let (final_query, switched) = select_query(
            &eval_before.score,
            &eval_after.score,
            &rewritten.query,
            &eval_before.improved.query,
            &self.config,
        );
        let final_query = final_query.to_string();
        let chosen_eval = if switched { &eval_after } else { &eval_before };

        info!(
            switched = switched,
            before = eval_before.score.overall,
            after = eval_after.score.overall,
            "Query selected"
        );

        let queries = fanout_queries(
            &final_query,
            &chosen_eval.variant_queries,
            self.config.multi_query_n,
        );
        let hyde = self
            .config
            .enable_hyde
            .then_some(chosen_eval.hyde_text.as_str())
            .filter(|h| !h.trim().is_empty());

        let candidates = retrieve(
            self.embedder.as_ref(),
            self.index.as_ref(),
            &queries,
            hyde,
            &req.exclude_group_ids,
            &self.config,
        )
        .await?;

        let context: Vec<&RetrievalCandidate> =
            candidates.iter().take(self.config.context_top_k).collect();
        let raw_pack = self
            .generate_pack(&rewritten.reading_goals, &req.reason, &context)
            .await?;

        let title = if raw_pack.title.trim().is_empty() {
            context
                .first()
                .map(|c| c.title.clone())
                .unwrap_or_else(|| final_query.clone())
        } else {
            raw_pack.title.trim().to_string()
        };
        let pack = raw_pack.pack;

        let sentences = split_sentences(&pack.simplified_passage);
        let quality = self
            .quality
            .score(
                &pack.simplified_passage,
                &final_query,
                &rewritten.reading_goals.join(" "),
            )
            .await?;

        Ok(StudyPackResult {
            db_key: db_key(&title, &pack.simplified_passage),
            passage_text: pack.simplified_passage.clone(),
            sentences,
            quality,
            topic: context.first().and_then(|c| c.topic.clone()),
            title,

            summary: pack.summary,
            key_points: pack.key_points,
            outline: pack.outline,
            glossary: pack.glossary,
            study_questions: pack.study_questions,
            difficulty_note: pack.difficulty_note,

            rewritten,
            final_query,
            eval_before: eval_before.score,
            eval_after: eval_after.score,
            queries_used: queries,
            used_context: context
                .iter()
                .map(|c| UsedContext {
                    group_id: c.group_id.clone(),
                    title: c.title.clone(),
                    score: c.score,
                    matched_query: c.matched_query.clone(),
                })
                .collect(),
        })
    }

    async fn generate_pack(
        &self,
        reading_goals: &[String],
        reason: &str,
        context: &[&RetrievalCandidate],
    ) -> Result<RawStudyPack> {
        let response = self
            .client
            .complete_json(
                &self.rewriter,
                PACK_SYSTEM,
                &pack_prompt(reading_goals, reason, context),
            )
            .await?;

        match parse_json_block::<RawStudyPack>(&response.content) {
            Parsed::Parsed(raw) => Ok(raw),
            Parsed::Invalid(raw) => {
                warn!(raw_len = raw.len(), "Malformed study pack, using context head");
                Ok(fallback_pack(context))
            }
        }
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(CONTEXT_SNIPPET_CHARS).collect()
}

fn pack_prompt(reading_goals: &[String], reason: &str, context: &[&RetrievalCandidate]) -> String {
    let context_block: String = context
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{n}] {title}\n{body}\n", n = i + 1, title = c.title, body = snippet(&c.passage)))
        .collect();

    format!(
        r#"Build a study pack from the context passages ONLY; do not add outside facts.
Paraphrase, never copy sentences verbatim.

- "title": concise noun phrase for the pack
- "summary": 2-3 sentences of what the material covers
- "key_points": the claims the learner must retain
- "outline": sections with a one-line note each
- "glossary": the hard terms, each with a plain definition
- "simplified_passage": one connected passage, plain sentences with terminal punctuation
- "study_questions": 3-5 self-check questions answerable from the simplified passage
- "difficulty_note": one sentence on how this is easier than what the learner struggled with

[Learner's difficulty]: {reason}
[Reading goals]: {goals}

[Context]
{context_block}

[Output JSON]
{{"title": "...", "summary": "...", "key_points": ["..."], "outline": [{{"section": "...", "note": "..."}}],
 "glossary": [{{"term": "...", "definition": "..."}}], "simplified_passage": "...",
 "study_questions": ["..."], "difficulty_note": "..."}}"#,
        goals = reading_goals.join("; "),
    )
}

/// Degraded pack: hand back the strongest context passage untouched.
fn fallback_pack(context: &[&RetrievalCandidate]) -> RawStudyPack {
    let top = context.first();
    RawStudyPack {
        title: top.map(|c| c.title.clone()).unwrap_or_default(),
        pack: StudyPack {
            simplified_passage: top.map(|c| snippet(&c.passage)).unwrap_or_default(),
            difficulty_note: "Source material returned as-is; simplification unavailable."
                .to_string(),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(group: &str, passage: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            group_id: group.to_string(),
            score: 0.9,
            matched_query: "q".to_string(),
            title: format!("title {group}"),
            passage: passage.to_string(),
            topic: None,
        }
    }

    #[test]
    fn test_snippet_caps_length() {
        let long = "y".repeat(2000);
        assert_eq!(snippet(&long).chars().count(), CONTEXT_SNIPPET_CHARS);
    }

    #[test]
    fn test_fallback_pack_uses_top_candidate() {
        let a = candidate("a", "Plain explanation of osmosis.");
        let b = candidate("b", "Other passage.");
        let pack = fallback_pack(&[&a, &b]);
        assert_eq!(pack.title, "title a");
        assert_eq!(pack.pack.simplified_passage, "Plain explanation of osmosis.");
        assert!(pack.pack.key_points.is_empty());
    }

    #[test]
    fn test_fallback_pack_no_context() {
        let pack = fallback_pack(&[]);
        assert!(pack.pack.simplified_passage.is_empty());
    }

    #[test]
    fn test_raw_pack_flattening() {
        let raw: RawStudyPack = serde_json::from_str(
            r#"{"title": "Osmosis Basics", "summary": "s", "simplified_passage": "Water moves."}"#,
        )
        .unwrap();
        assert_eq!(raw.title, "Osmosis Basics");
        assert_eq!(raw.pack.summary, "s");
        assert_eq!(raw.pack.simplified_passage, "Water moves.");
    }
}
