//! Query and retrieval entities for the adaptive multi-query subsystem.

use serde::{Deserialize, Serialize};

use super::{QualityScore, Sentence};

/// Retrieval-oriented rewrite of a passage + difficulty reason.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewrittenQuery {
    /// Compact query aimed at pedagogically useful material
    pub query: String,
    /// Core concepts that must appear in any derived query
    #[serde(default)]
    pub must_have_terms: Vec<String>,
    /// What the learner should come to understand
    #[serde(default)]
    pub reading_goals: Vec<String>,
    /// How to soften the elements the learner found hard
    #[serde(default)]
    pub simplify_strategy: String,
    /// Elements derived material should avoid
    #[serde(default)]
    pub should_avoid_terms: Vec<String>,
}

/// Five-axis query score, each axis in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryScore {
    pub coverage: f64,
    pub clarity: f64,
    pub specificity: f64,
    pub goal_alignment: f64,
    /// Unwanted terms / contradictions; lower is better
    pub noise: f64,
    /// Weighted aggregate, recomputed deterministically from the axes
    pub overall: f64,
}

impl QueryScore {
    /// Weight of the noise penalty before capping.
    const NOISE_WEIGHT: f64 = 0.3;
    /// Maximum penalty noise can inflict on the aggregate.
    const NOISE_CAP: f64 = 0.15;

    /// Recompute `overall` from the axes:
    /// `0.30*coverage + 0.25*clarity + 0.25*specificity + 0.20*goal_alignment
    ///  - min(noise*0.3, 0.15)`, clamped to [0, 1].
    pub fn with_overall(mut self) -> Self {
        let weighted = 0.30 * self.coverage
            + 0.25 * self.clarity
            + 0.25 * self.specificity
            + 0.20 * self.goal_alignment;
        let penalty = (self.noise * Self::NOISE_WEIGHT).min(Self::NOISE_CAP);
        self.overall = (weighted - penalty).clamp(0.0, 1.0);
        self
    }
}

/// Evaluation of a query plus proposed refinements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryEvaluation {
    pub score: QueryScore,
    /// Improved query block (falls back to the evaluated query)
    pub improved: RewrittenQuery,
    /// Up to N-1 phrasing variants for fan-out diversity
    #[serde(default)]
    pub variant_queries: Vec<String>,
    /// Hypothetical-document expansion text, embedding use only
    #[serde(default)]
    pub hyde_text: String,
}

/// One aggregated retrieval hit; at most one per group id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    /// Stable identifier of the source-passage cluster
    pub group_id: String,
    /// Max cosine score observed for this group across all fan-out queries
    pub score: f64,
    /// The fan-out query that produced the max score
    pub matched_query: String,
    pub title: String,
    pub passage: String,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Paraphrased learning artifact built from retrieved context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyPack {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub outline: Vec<OutlineEntry>,
    #[serde(default)]
    pub glossary: Vec<GlossaryEntry>,
    #[serde(default)]
    pub simplified_passage: String,
    #[serde(default)]
    pub study_questions: Vec<String>,
    #[serde(default)]
    pub difficulty_note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub section: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub term: String,
    #[serde(default)]
    pub definition: String,
}

/// Context actually fed to the study-pack generator, echoed for exclusion
/// bookkeeping on the caller side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsedContext {
    pub group_id: String,
    pub title: String,
    pub score: f64,
    pub matched_query: String,
}

/// Full study-pack response, shaped like a generated item so the simplified
/// passage participates in the same evidence-referencing scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyPackResult {
    pub title: String,
    pub db_key: String,
    pub passage_text: String,
    pub sentences: Vec<Sentence>,
    pub quality: QualityScore,
    pub topic: Option<String>,

    pub summary: String,
    pub key_points: Vec<String>,
    pub outline: Vec<OutlineEntry>,
    pub glossary: Vec<GlossaryEntry>,
    pub study_questions: Vec<String>,
    pub difficulty_note: String,

    // Query audit trail
    pub rewritten: RewrittenQuery,
    pub final_query: String,
    pub eval_before: QueryScore,
    pub eval_after: QueryScore,
    pub queries_used: Vec<String>,
    pub used_context: Vec<UsedContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_formula() {
        let score = QueryScore {
            coverage: 1.0,
            clarity: 1.0,
            specificity: 1.0,
            goal_alignment: 1.0,
            noise: 0.0,
            overall: 0.0,
        }
        .with_overall();
        assert!((score.overall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_noise_penalty_is_capped() {
        let low_noise = QueryScore {
            coverage: 0.8,
            clarity: 0.8,
            specificity: 0.8,
            goal_alignment: 0.8,
            noise: 0.2,
            overall: 0.0,
        }
        .with_overall();
        // penalty = 0.2 * 0.3 = 0.06
        assert!((low_noise.overall - (0.8 - 0.06)).abs() < 1e-9);

        let max_noise = QueryScore {
            coverage: 0.8,
            clarity: 0.8,
            specificity: 0.8,
            goal_alignment: 0.8,
            noise: 1.0,
            overall: 0.0,
        }
        .with_overall();
        // penalty capped at 0.15 even though 1.0 * 0.3 = 0.30
        assert!((max_noise.overall - (0.8 - 0.15)).abs() < 1e-9);
    }

    #[test]
    fn test_overall_clamped_to_unit_interval() {
        let score = QueryScore {
            noise: 1.0,
            ..Default::default()
        }
        .with_overall();
        assert_eq!(score.overall, 0.0);
    }
}
