//! Item entities flowing through the generation/verification pipeline.
//!
//! Everything a draft produces is normalized into these canonical types at
//! the generation boundary before any other component consumes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// One passage sentence. Ids start at 1 and are unique within a passage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    pub id: i64,
    pub text: String,
}

/// Intended logical stance of a choice toward the passage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// The choice is true given the passage
    Support,
    /// The choice is false given the passage
    Contradict,
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relation::Support => write!(f, "support"),
            Relation::Contradict => write!(f, "contradict"),
        }
    }
}

/// Verdict from the verifier, restricted to the cited evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLabel {
    Support,
    Contradict,
    /// Partial match, extension or speculation
    Weak,
    /// Not connectable to the cited evidence
    NoEvidence,
}

impl VerifyLabel {
    /// A label is a faithfulness error unless it equals the required relation.
    pub fn matches(&self, must: Relation) -> bool {
        matches!(
            (self, must),
            (VerifyLabel::Support, Relation::Support)
                | (VerifyLabel::Contradict, Relation::Contradict)
        )
    }
}

/// How evidence was linked and what each candidate scored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceDiagnostics {
    /// "embed_cached" or "overlap_fallback"
    pub method: String,
    /// Final evidence ids, ranked
    pub picked: Vec<i64>,
    /// Per-candidate similarity (cosine) or overlap score
    pub similarity_by_id: std::collections::BTreeMap<i64, f64>,
}

/// A multiple-choice option with its evidence trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// 0-based, stable across repair rounds
    pub index: usize,
    pub text: String,
    pub is_correct: bool,
    pub relation: Relation,
    /// Subset of the passage's sentence ids, ranked by support strength
    pub evidence_sentence_ids: Vec<i64>,
    /// Ids as originally declared by the generator, before linking
    pub declared_evidence_ids: Vec<i64>,
    pub evidence_diagnostics: EvidenceDiagnostics,
    pub verify_label: Option<VerifyLabel>,
    pub verify_notes: String,
}

impl Choice {
    /// The relation this choice must verify as.
    pub fn must_relation(&self) -> Relation {
        if self.is_correct {
            Relation::Support
        } else {
            Relation::Contradict
        }
    }

    /// Accepted iff the verifier agreed with the required relation.
    pub fn is_accepted(&self) -> bool {
        self.verify_label
            .map(|l| l.matches(self.must_relation()))
            .unwrap_or(false)
    }
}

/// One minimal rewrite applied during a repair round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecord {
    pub choice_index: usize,
    pub must_relation: Relation,
    pub before_text: String,
    pub after_text: String,
    pub reason: String,
}

/// Five-axis passage quality score, each axis in [0, 2].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    pub topic_alignment: u8,
    pub logic: u8,
    pub factuality: u8,
    pub groundedness: u8,
    pub clarity: u8,
    pub pass_fail: PassFail,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassFail {
    Pass,
    Revise,
}

impl QualityScore {
    /// Heuristic fallback when the scoring capability returns garbage.
    pub fn fallback(notes: impl Into<String>) -> Self {
        Self {
            topic_alignment: 1,
            logic: 1,
            factuality: 1,
            groundedness: 1,
            clarity: 1,
            pass_fail: PassFail::Revise,
            notes: notes.into(),
        }
    }
}

/// RAG-style evaluation summary over a verified choice batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Fraction of choices whose label equals the required relation
    pub label_accuracy: f64,
    /// Mean similarity of final evidence across choices
    pub avg_evidence_strength: f64,
    /// Fraction of final evidence ids at or above the similarity threshold
    pub context_precision: f64,
    /// Fraction of originally declared evidence ids retained after linking
    pub context_recall: f64,
    /// Fraction of choices with a mismatched, weak or no_evidence label
    pub faithfulness_error_rate: f64,
    pub sim_threshold: f64,
    /// Linking method that produced the evidence ("embed_cached"/"overlap_fallback")
    pub method: String,
}

/// Per-phase timings and capability call counts. Observational only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Telemetry {
    pub gen_passage_ms: f64,
    pub gen_choices_ms: f64,
    pub quality_ms: f64,
    pub embed_ms_total: f64,
    pub verify_ms_total: f64,
    pub rewrite_ms_total: f64,
    pub total_ms: f64,
    pub repair_rounds: u32,
    pub regen_count: u32,
    pub api_calls: ApiCallCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiCallCounts {
    pub generate_passage: u32,
    pub generate_choices: u32,
    pub quality: u32,
    pub verify: u32,
    pub rewrite: u32,
    pub embed: u32,
}

/// Finalized output of one generation request.
///
/// Created once per request, mutated in place across repair rounds, and
/// finalized (accepted or exhausted) before being handed to persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Request id, for log correlation
    pub id: String,
    pub title: String,
    pub question: String,
    /// Idempotent upsert key: slug of the title + content-hash suffix
    pub db_key: String,
    pub passage_text: String,
    pub sentences: Vec<Sentence>,
    pub choices: Vec<Choice>,
    pub quality: QualityScore,
    pub rag_eval: Option<AggregateMetrics>,
    pub repairs: Vec<RepairRecord>,
    pub regen_count: u32,
    /// True when repair rounds and regenerations ran out without full acceptance
    pub exhausted: bool,
    pub telemetry: Telemetry,
    pub created_at: DateTime<Utc>,
}

/// Derive the idempotent storage key for a passage.
///
/// Slug rules: NFKC-normalize the title, collapse whitespace to `-`, strip
/// everything outside Hangul/ASCII alphanumerics/`-`, squeeze `-` runs,
/// lowercase. Suffix with the first 8 hex chars of sha256(passage_text).
/// Byte-identical across repeated calls with identical inputs.
pub fn db_key(title: &str, passage_text: &str) -> String {
    let title = if title.trim().is_empty() {
        let head: String = passage_text.chars().take(20).collect();
        if head.trim().is_empty() {
            "untitled".to_string()
        } else {
            head
        }
    } else {
        title.to_string()
    };

    let normalized: String = title.trim().nfkc().collect();
    let spaced = regex::Regex::new(r"\s+")
        .expect("static regex")
        .replace_all(&normalized, "-")
        .into_owned();
    let cleaned = regex::Regex::new(r"[^\p{Hangul}A-Za-z0-9\-]")
        .expect("static regex")
        .replace_all(&spaced, "")
        .into_owned();
    let squeezed = regex::Regex::new(r"-{2,}")
        .expect("static regex")
        .replace_all(&cleaned, "-")
        .into_owned();
    let slug = squeezed.trim_matches('-').to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(passage_text.as_bytes());
    let digest = hasher.finalize();
    let suffix = format!("{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3]);

    if slug.is_empty() {
        format!("untitled-{suffix}")
    } else {
        format!("{slug}-{suffix}")
    }
}

/// Split free text into `Sentence` entities on terminal punctuation.
///
/// A boundary is `.`, `!` or `?` followed by whitespace (or end of text).
/// Lets study-pack passages participate in the same evidence-referencing
/// scheme as generated items.
pub fn split_sentences(text: &str) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.trim().chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map(|n| n.is_whitespace()).unwrap_or(true);
            if at_boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
                while chars.peek().is_some_and(|n| n.is_whitespace()) {
                    chars.next();
                }
            }
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
        .into_iter()
        .enumerate()
        .map(|(i, text)| Sentence {
            id: (i + 1) as i64,
            text,
        })
        .collect()
}
