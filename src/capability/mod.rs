//! Capability contracts and the strict parse boundary.
//!
//! Every external capability (generation, verification, quality scoring,
//! embeddings) is a trait so the orchestrator can be exercised against
//! in-memory implementations. Model output crosses [`parse_json_block`]
//! exactly once; downstream code branches on the tagged result instead of
//! unwinding on malformed JSON.

mod embedding;
mod generation;
mod quality;
mod verify;

pub use embedding::*;
pub use generation::*;
pub use quality::*;
pub use verify::*;

use crate::models::{QualityScore, Relation, Result, Sentence, VerifyLabel};
use serde::de::DeserializeOwned;
use std::future::Future;

/// Outcome of parsing a capability response.
///
/// `Invalid` carries the raw text so the caller can log it and take the
/// explicit fallback branch; it is an expected state, not an error.
#[derive(Debug, Clone)]
pub enum Parsed<T> {
    Parsed(T),
    Invalid(String),
}

impl<T> Parsed<T> {
    /// Take the parsed value or compute a fallback from the raw text.
    pub fn unwrap_or_else_raw(self, fallback: impl FnOnce(&str) -> T) -> T {
        match self {
            Parsed::Parsed(v) => v,
            Parsed::Invalid(raw) => fallback(&raw),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Parsed::Parsed(_))
    }
}

/// Parse the first `{...}` block out of model output.
///
/// Models occasionally wrap JSON in prose or code fences; the extraction is
/// the same greedy brace match the rest of the pipeline was tuned against.
pub fn parse_json_block<T: DeserializeOwned>(raw: &str) -> Parsed<T> {
    let trimmed = raw.trim();
    let candidate = regex::Regex::new(r"(?s)\{.*\}")
        .expect("static regex")
        .find(trimmed)
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    match serde_json::from_str::<T>(candidate) {
        Ok(v) => Parsed::Parsed(v),
        Err(_) => Parsed::Invalid(raw.to_string()),
    }
}

/// Seed material injected into passage drafting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SeedContext {
    pub group_id: Option<String>,
    pub sentences: Vec<Sentence>,
}

/// Passage drafting request.
#[derive(Debug, Clone)]
pub struct PassageRequest {
    pub topic: String,
    pub difficulty: Difficulty,
    pub target_chars: u32,
    pub seed_context: Option<SeedContext>,
}

/// Difficulty band for a passage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Basic,
    Standard,
    Advanced,
}

impl Difficulty {
    /// (min sentences, max sentences, inference-depth rule for the prompt)
    pub fn spec(&self) -> (u32, u32, &'static str) {
        match self {
            Difficulty::Basic => (
                6,
                10,
                "Plain vocabulary and sentence structure, factual statements, at most one inference step.",
            ),
            Difficulty::Standard => (
                8,
                12,
                "Moderate vocabulary, concept linking with one to two inference steps.",
            ),
            Difficulty::Advanced => (
                10,
                14,
                "Technical terms allowed sparingly, propositional relations with two or more inference steps.",
            ),
        }
    }
}

/// Normalized passage draft, produced at the generation boundary.
#[derive(Debug, Clone)]
pub struct PassageDraft {
    pub title: String,
    pub question: String,
    pub sentences: Vec<Sentence>,
}

/// Normalized choice draft before evidence linking.
#[derive(Debug, Clone)]
pub struct ChoiceDraft {
    pub text: String,
    pub is_correct: bool,
    pub relation: Relation,
    pub evidence_sentence_ids: Vec<i64>,
}

/// Minimal-rewrite request for one failing choice.
#[derive(Debug, Clone)]
pub struct RewriteRequest {
    pub choice_text: String,
    pub must_relation: Relation,
    /// Current evidence the rewrite is constrained to: (sentence id, text)
    pub evidence: Vec<(i64, String)>,
}

/// One entry of a batched verification call.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub index: usize,
    pub text: String,
    pub evidence_ids: Vec<i64>,
    pub must_relation: Relation,
}

/// One index-aligned verification outcome.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub label: VerifyLabel,
    pub notes: String,
}

impl Default for VerifyOutcome {
    fn default() -> Self {
        Self {
            label: VerifyLabel::NoEvidence,
            notes: String::new(),
        }
    }
}

/// Passage, choice and repair drafting.
pub trait Generator: Send + Sync {
    /// Draft a passage with title and question.
    fn draft_passage(
        &self,
        req: &PassageRequest,
    ) -> impl Future<Output = Result<PassageDraft>> + Send;

    /// Draft a five-choice batch over the given passage sentences.
    fn draft_choices(
        &self,
        sentences: &[Sentence],
    ) -> impl Future<Output = Result<Vec<ChoiceDraft>>> + Send;

    /// Minimally rewrite a failing choice, constrained to its current
    /// evidence and target relation. No new facts.
    fn rewrite_choice(&self, req: &RewriteRequest) -> impl Future<Output = Result<String>> + Send;
}

/// Five-axis passage quality scoring.
pub trait QualityScorer: Send + Sync {
    fn score(
        &self,
        passage: &str,
        topic_hint: &str,
        key_points: &str,
    ) -> impl Future<Output = Result<QualityScore>> + Send;
}

/// Evidence-restricted relation verification, batched.
pub trait Verifier: Send + Sync {
    /// Returns one outcome per request, index-aligned. Missing or malformed
    /// entries default to `no_evidence` rather than failing the batch.
    fn verify_batch(
        &self,
        sentences: &[Sentence],
        batch: &[VerifyRequest],
    ) -> impl Future<Output = Result<Vec<VerifyOutcome>>> + Send;
}

/// Batch text embedding.
pub trait Embedder: Send + Sync {
    /// Returns vectors aligned with the input order. An empty result signals
    /// the capability is unavailable; callers degrade to lexical overlap.
    fn embed(&self, texts: &[String]) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;
}
