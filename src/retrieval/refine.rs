//! Query evaluation and hysteresis-guarded refinement.
//!
//! Every candidate query is scored on five axes; the aggregate is always
//! recomputed locally so the model cannot inflate its own verdict. Switching
//! from the evaluated query to its proposed improvement is guarded both
//! ways: a good query needs a real gain to be replaced, and a weak query is
//! replaced unless the improvement is materially worse.

use crate::capability::{parse_json_block, Parsed};
use crate::client::LlmClient;
use crate::models::{ModelSpec, QueryEvaluation, QueryScore, Result, RetrievalConfig, RewrittenQuery};
use tracing::{debug, warn};

const EVALUATE_SYSTEM: &str = "You audit retrieval queries for study-material search. \
Always output JSON only.";

fn prompt(rewritten: &RewrittenQuery, reason: &str, variant_count: usize) -> String {
    let rewritten_json = serde_json::to_string(rewritten).unwrap_or_default();
    format!(
        r#"Evaluate the retrieval query below, axes in [0, 1]:
- coverage: how much of must_have_terms and the concepts it names the query carries
- clarity: unambiguous phrasing a search engine can act on
- specificity: narrow enough to avoid generic matches
- goal_alignment: serves the stated reading goals
- noise: unwanted terms or contradictions (lower is better)

Also produce:
- "improved": the same structure with a better query (keep every must_have_term)
- "variant_queries": up to {variant_count} alternative phrasings of the improved query
- "hyde_text": a 3-5 sentence hypothetical passage that would answer the query perfectly

[Reason it was hard]: {reason}
[Query under evaluation]: {rewritten_json}

[Output JSON]
{{"score": {{"coverage": 0.8, "clarity": 0.8, "specificity": 0.8, "goal_alignment": 0.8, "noise": 0.1}},
 "improved": {{"query": "...", "must_have_terms": [], "reading_goals": [], "simplify_strategy": "", "should_avoid_terms": []}},
 "variant_queries": ["..."], "hyde_text": "..."}}"#
    )
}

/// Score a query and collect its proposed refinements.
///
/// The `overall` aggregate is recomputed from the axes; the improved query
/// falls back to the evaluated one and is forced to carry every must-have
/// term.
pub async fn evaluate_query(
    client: &LlmClient,
    model: &ModelSpec,
    rewritten: &RewrittenQuery,
    reason: &str,
    config: &RetrievalConfig,
) -> Result<QueryEvaluation> {
    let variant_count = config.multi_query_n.saturating_sub(1);
    let response = client
        .complete_json(model, EVALUATE_SYSTEM, &prompt(rewritten, reason, variant_count))
        .await?;

    let mut eval = match parse_json_block::<QueryEvaluation>(&response.content) {
        Parsed::Parsed(eval) => eval,
        Parsed::Invalid(raw) => {
            warn!(raw_len = raw.len(), "Malformed query evaluation, using neutral score");
            QueryEvaluation::default()
        }
    };

    eval.score = clamp_axes(eval.score).with_overall();
    if eval.improved.query.trim().is_empty() {
        eval.improved = rewritten.clone();
    }
    if eval.improved.must_have_terms.is_empty() {
        eval.improved.must_have_terms = rewritten.must_have_terms.clone();
    }
    eval.improved.query = ensure_terms(&eval.improved.query, &rewritten.must_have_terms);
    eval.variant_queries.truncate(variant_count);

    debug!(overall = eval.score.overall, "Query evaluated");
    Ok(eval)
}

fn clamp_axes(mut score: QueryScore) -> QueryScore {
    score.coverage = score.coverage.clamp(0.0, 1.0);
    score.clarity = score.clarity.clamp(0.0, 1.0);
    score.specificity = score.specificity.clamp(0.0, 1.0);
    score.goal_alignment = score.goal_alignment.clamp(0.0, 1.0);
    score.noise = score.noise.clamp(0.0, 1.0);
    score
}

/// Append any must-have term the query dropped (case-insensitive match).
pub fn ensure_terms(query: &str, must_have_terms: &[String]) -> String {
    let mut result = query.trim().to_string();
    let lower = result.to_lowercase();
    let mut missing: Vec<&str> = Vec::new();
    for term in must_have_terms {
        let term = term.trim();
        if !term.is_empty() && !lower.contains(&term.to_lowercase()) {
            missing.push(term);
        }
    }
    for term in missing {
        if !result.is_empty() {
            result.push(' ');
        }
        result.push_str(term);
    }
    result
}

/// Pick between the original query and its improvement.
///
/// Above the pass threshold the original wins unless the improvement gains
/// more than `improve_delta`. Below it the improvement wins unless it is
/// worse by more than `degraded_margin`. Returns the chosen query and
/// whether the improvement was taken.
pub fn select_query<'a>(
    before: &QueryScore,
    after: &QueryScore,
    original: &'a str,
    improved: &'a str,
    config: &RetrievalConfig,
) -> (&'a str, bool) {
    let switch = if before.overall >= config.pass_threshold {
        after.overall > before.overall + config.improve_delta
    } else {
        after.overall >= before.overall - config.degraded_margin
    };

    if switch {
        (improved, true)
    } else {
        (original, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(overall: f64) -> QueryScore {
        QueryScore {
            overall,
            ..Default::default()
        }
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig::default()
    }

    #[test]
    fn test_select_switches_on_clear_gain_above_threshold() {
        let (chosen, switched) =
            select_query(&score(0.90), &score(0.95), "orig", "better", &config());
        assert!(switched);
        assert_eq!(chosen, "better");
    }

    #[test]
    fn test_select_keeps_good_query_on_small_gain() {
        let (chosen, switched) =
            select_query(&score(0.76), &score(0.77), "orig", "better", &config());
        assert!(!switched);
        assert_eq!(chosen, "orig");
    }

    #[test]
    fn test_select_below_threshold_prefers_improvement() {
        let (chosen, switched) =
            select_query(&score(0.50), &score(0.48), "orig", "better", &config());
        assert!(switched, "small regression within the margin still switches");
        assert_eq!(chosen, "better");
    }

    #[test]
    fn test_select_below_threshold_rejects_degraded_improvement() {
        let (chosen, switched) =
            select_query(&score(0.50), &score(0.40), "orig", "better", &config());
        assert!(!switched);
        assert_eq!(chosen, "orig");
    }

    #[test]
    fn test_ensure_terms_appends_missing_only() {
        let query = ensure_terms(
            "photosynthesis in plants",
            &[
                "Photosynthesis".to_string(),
                "chlorophyll".to_string(),
                "  ".to_string(),
            ],
        );
        assert_eq!(query, "photosynthesis in plants chlorophyll");
    }

    #[test]
    fn test_ensure_terms_empty_query() {
        assert_eq!(ensure_terms("", &["osmosis".to_string()]), "osmosis");
    }
}
