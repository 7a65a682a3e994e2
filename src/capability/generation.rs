//! LLM-backed passage/choice drafting and choice repair.
//!
//! Raw model output is loosely typed on purpose; one normalization pass per
//! call turns it into canonical, validated entities before anything else
//! touches it. Malformed output is coerced with defaults, never fatal.

use crate::capability::{
    parse_json_block, ChoiceDraft, Generator, Parsed, PassageDraft, PassageRequest, RewriteRequest,
};
use crate::client::LlmClient;
use crate::models::{ModelSpec, Relation, Result, Sentence};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

/// Number of choices in a batch: exactly one correct, four contradicting.
pub const CHOICE_BATCH_SIZE: usize = 5;

/// Compensates the model's token-to-character estimate for Hangul-heavy
/// passages when computing the length band.
const CHAR_LENGTH_BIAS: f64 = 1.3;

const DEFAULT_QUESTION: &str = "Which statement is consistent with the passage?";

const PASSAGE_SYSTEM: &str = "You are an expert author of nonfiction reading-comprehension \
passages for standardized exams. Always output JSON only.";

const CHOICES_SYSTEM: &str = "You are an expert author of multiple-choice options for \
nonfiction reading-comprehension exams. Always output JSON only.";

const REWRITE_SYSTEM: &str = "You are a repair tool for reading-comprehension choices. \
Always output JSON only.";

/// Raw draft shapes as the model emits them.
#[derive(Debug, Deserialize, Default)]
struct RawPassageDraft {
    #[serde(default)]
    title: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    passage_sentences: Vec<RawSentence>,
}

#[derive(Debug, Deserialize)]
struct RawSentence {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawChoiceSet {
    #[serde(default)]
    choices: Vec<RawChoice>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_correct: bool,
    #[serde(default)]
    evidence_sent_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct RawRewrite {
    #[serde(default)]
    text: String,
}

/// Normalize a raw passage draft into canonical entities.
///
/// Sentences are trimmed, empties dropped, and ids assigned sequentially
/// from 1 regardless of what the model claimed. Title/question fall back to
/// defaults instead of failing.
fn normalize_passage(raw: RawPassageDraft) -> PassageDraft {
    let sentences: Vec<Sentence> = raw
        .passage_sentences
        .into_iter()
        .map(|s| s.text.trim().to_string())
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(i, text)| Sentence {
            id: (i + 1) as i64,
            text,
        })
        .collect();

    let question = {
        let q = raw.question.trim();
        if q.is_empty() {
            DEFAULT_QUESTION.to_string()
        } else {
            q.to_string()
        }
    };

    PassageDraft {
        title: raw.title.trim().to_string(),
        question,
        sentences,
    }
}

/// Normalize a raw choice set: cap at the batch size, derive the relation
/// from correctness, and force exactly one correct choice.
fn normalize_choices(raw: RawChoiceSet) -> Vec<ChoiceDraft> {
    let mut drafts: Vec<ChoiceDraft> = raw
        .choices
        .into_iter()
        .take(CHOICE_BATCH_SIZE)
        .map(|c| {
            let relation = if c.is_correct {
                Relation::Support
            } else {
                Relation::Contradict
            };
            ChoiceDraft {
                text: c.text.trim().to_string(),
                is_correct: c.is_correct,
                relation,
                evidence_sentence_ids: c.evidence_sent_ids,
            }
        })
        .filter(|c| !c.text.is_empty())
        .collect();

    let correct_count = drafts.iter().filter(|c| c.is_correct).count();
    if correct_count != 1 && !drafts.is_empty() {
        warn!(correct_count, "Coercing choice batch to a single correct option");
        let keep = drafts.iter().position(|c| c.is_correct).unwrap_or(0);
        for (i, draft) in drafts.iter_mut().enumerate() {
            draft.is_correct = i == keep;
            draft.relation = if i == keep {
                Relation::Support
            } else {
                Relation::Contradict
            };
        }
    }

    drafts
}

/// Production generator over an OpenAI-compatible endpoint.
pub struct LlmGenerator {
    client: Arc<LlmClient>,
    model: ModelSpec,
    rewrite_model: ModelSpec,
}

impl LlmGenerator {
    pub fn new(client: Arc<LlmClient>, model: ModelSpec, rewrite_model: ModelSpec) -> Self {
        Self {
            client,
            model,
            rewrite_model,
        }
    }

    fn passage_prompt(req: &PassageRequest) -> String {
        let (sent_min, sent_max, diff_rule) = req.difficulty.spec();
        let min_chars = ((req.target_chars as f64 * 0.9 * CHAR_LENGTH_BIAS) as u32).max(300);
        let max_chars = (req.target_chars as f64 * 1.1 * CHAR_LENGTH_BIAS) as u32;

        let seed = req
            .seed_context
            .as_ref()
            .and_then(|s| serde_json::to_string(s).ok())
            .unwrap_or_else(|| "null".to_string());

        format!(
            r#"[Generation constraints]
- Topic category: {topic}
- Difficulty: {difficulty:?} ({diff_rule})
- Passage length: {min_chars}-{max_chars} characters
- Sentence count: {sent_min}-{sent_max}, each ending with terminal punctuation
- Do not invent facts; preserve the seed's claims and their relations (paraphrase, never copy)

[Seed material]
SEED = {seed}

[Output JSON]
{{
  "title": "concise noun phrase, 8-20 characters, no punctuation",
  "question": "{question}",
  "passage_sentences": [{{"id": 1, "text": "..."}}]
}}"#,
            topic = req.topic,
            difficulty = req.difficulty,
            question = DEFAULT_QUESTION,
        )
    }

    fn choices_prompt(sentences: &[Sentence]) -> String {
        let sentences_json = serde_json::to_string(sentences).unwrap_or_default();
        format!(
            r#"[Passage sentences]
{sentences_json}

[Choice rules]
- "choices" contains exactly {n} entries
- Exactly one correct choice (is_correct=true, relation="support"); the other {m} are incorrect (is_correct=false, relation="contradict")
- Each choice must be directly supported or contradicted by 1-2 passage sentences, cited in "evidence_sent_ids"
- No absolute wording (always/only/all) unless the passage guarantees it
- Place the correct choice at a random position
- No claims beyond the passage content

[Output JSON]
{{
  "choices": [
    {{"text": "...", "is_correct": true, "relation": "support", "evidence_sent_ids": [2]}},
    {{"text": "...", "is_correct": false, "relation": "contradict", "evidence_sent_ids": [3]}}
  ]
}}"#,
            n = CHOICE_BATCH_SIZE,
            m = CHOICE_BATCH_SIZE - 1,
        )
    }

    fn rewrite_prompt(req: &RewriteRequest) -> String {
        let evidence: std::collections::BTreeMap<i64, &str> = req
            .evidence
            .iter()
            .map(|(id, text)| (*id, text.as_str()))
            .collect();
        let evidence_json = serde_json::to_string(&evidence).unwrap_or_default();
        format!(
            r#"Minimally rewrite the choice text so that it is directly linked to the evidence sentences below.
- Target verdict: {must}
- Do not add new facts or terms; reflect the evidence content and its relation precisely
Output: {{"text": "..."}}

[Evidence sentences]: {evidence_json}
[Original choice]: {before}"#,
            must = req.must_relation,
            before = req.choice_text,
        )
    }
}

impl Generator for LlmGenerator {
    async fn draft_passage(&self, req: &PassageRequest) -> Result<PassageDraft> {
        let response = self
            .client
            .complete_json(&self.model, PASSAGE_SYSTEM, &Self::passage_prompt(req))
            .await?;

        let raw = match parse_json_block::<RawPassageDraft>(&response.content) {
            Parsed::Parsed(raw) => raw,
            Parsed::Invalid(raw) => {
                warn!(raw_len = raw.len(), "Malformed passage draft, coercing empty");
                RawPassageDraft::default()
            }
        };

        Ok(normalize_passage(raw))
    }

    async fn draft_choices(&self, sentences: &[Sentence]) -> Result<Vec<ChoiceDraft>> {
        let response = self
            .client
            .complete_json(&self.model, CHOICES_SYSTEM, &Self::choices_prompt(sentences))
            .await?;

        let raw = match parse_json_block::<RawChoiceSet>(&response.content) {
            Parsed::Parsed(raw) => raw,
            Parsed::Invalid(raw) => {
                warn!(raw_len = raw.len(), "Malformed choice set, coercing empty");
                RawChoiceSet::default()
            }
        };

        Ok(normalize_choices(raw))
    }

    async fn rewrite_choice(&self, req: &RewriteRequest) -> Result<String> {
        let response = self
            .client
            .complete_json(&self.rewrite_model, REWRITE_SYSTEM, &Self::rewrite_prompt(req))
            .await?;

        // A failed rewrite keeps the original text; the verifier decides.
        let text = parse_json_block::<RawRewrite>(&response.content)
            .unwrap_or_else_raw(|_| RawRewrite {
                text: req.choice_text.clone(),
            })
            .text;
        let text = text.trim();
        if text.is_empty() {
            Ok(req.choice_text.clone())
        } else {
            Ok(text.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_passage_renumbers_and_drops_empty() {
        let raw: RawPassageDraft = serde_json::from_str(
            r#"{
                "title": "  Tides  ",
                "question": "",
                "passage_sentences": [
                    {"id": 7, "text": " First. "},
                    {"text": "   "},
                    {"id": 2, "text": "Second."}
                ]
            }"#,
        )
        .unwrap();

        let draft = normalize_passage(raw);
        assert_eq!(draft.title, "Tides");
        assert_eq!(draft.question, DEFAULT_QUESTION);
        assert_eq!(draft.sentences.len(), 2);
        assert_eq!(draft.sentences[0].id, 1);
        assert_eq!(draft.sentences[1].id, 2);
        assert_eq!(draft.sentences[1].text, "Second.");
    }

    #[test]
    fn test_normalize_choices_forces_single_correct() {
        let raw: RawChoiceSet = serde_json::from_str(
            r#"{
                "choices": [
                    {"text": "a", "is_correct": true, "evidence_sent_ids": [1]},
                    {"text": "b", "is_correct": true, "evidence_sent_ids": [2]},
                    {"text": "c", "is_correct": false, "evidence_sent_ids": [3]}
                ]
            }"#,
        )
        .unwrap();

        let drafts = normalize_choices(raw);
        assert_eq!(drafts.iter().filter(|c| c.is_correct).count(), 1);
        assert!(drafts[0].is_correct);
        assert_eq!(drafts[0].relation, Relation::Support);
        assert_eq!(drafts[1].relation, Relation::Contradict);
    }

    #[test]
    fn test_normalize_choices_no_correct_promotes_first() {
        let raw: RawChoiceSet = serde_json::from_str(
            r#"{"choices": [
                {"text": "a", "is_correct": false, "evidence_sent_ids": []},
                {"text": "b", "is_correct": false, "evidence_sent_ids": []}
            ]}"#,
        )
        .unwrap();

        let drafts = normalize_choices(raw);
        assert!(drafts[0].is_correct);
        assert!(!drafts[1].is_correct);
    }

    #[test]
    fn test_normalize_choices_caps_batch_size() {
        let choices: Vec<String> = (0..8)
            .map(|i| {
                format!(
                    r#"{{"text": "c{i}", "is_correct": {}, "evidence_sent_ids": [1]}}"#,
                    i == 0
                )
            })
            .collect();
        let raw: RawChoiceSet =
            serde_json::from_str(&format!(r#"{{"choices": [{}]}}"#, choices.join(","))).unwrap();

        let drafts = normalize_choices(raw);
        assert_eq!(drafts.len(), CHOICE_BATCH_SIZE);
    }
}
