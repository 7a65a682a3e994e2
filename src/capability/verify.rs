//! Evidence-restricted relation verification.
//!
//! One batched call per round: every pending choice is judged against only
//! its cited evidence sentences. Results come back index-aligned; a missing
//! or malformed entry is a `no_evidence` verdict, never a batch failure.

use crate::capability::{parse_json_block, Parsed, Verifier, VerifyOutcome, VerifyRequest};
use crate::client::LlmClient;
use crate::models::{ModelSpec, Result, Sentence, VerifyLabel};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

const VERIFY_SYSTEM: &str = "You judge whether statements are supported or contradicted by \
cited evidence sentences, and nothing else. Always output JSON only.";

#[derive(Debug, Deserialize, Default)]
struct RawVerifyResults {
    #[serde(default)]
    results: Vec<RawVerifyEntry>,
}

#[derive(Debug, Deserialize)]
struct RawVerifyEntry {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    notes: String,
}

fn parse_label(s: &str) -> VerifyLabel {
    match s.trim().to_lowercase().as_str() {
        "support" => VerifyLabel::Support,
        "contradict" => VerifyLabel::Contradict,
        "weak" => VerifyLabel::Weak,
        _ => VerifyLabel::NoEvidence,
    }
}

/// Align raw entries with the request batch by `index`.
///
/// Output length always equals the batch length; requests the model skipped
/// (or mangled) get the default `no_evidence` outcome.
fn align_results(batch: &[VerifyRequest], raw: RawVerifyResults) -> Vec<VerifyOutcome> {
    let mut by_index: BTreeMap<usize, VerifyOutcome> = BTreeMap::new();
    for entry in raw.results {
        let Some(index) = entry.index else { continue };
        by_index.insert(
            index,
            VerifyOutcome {
                label: parse_label(&entry.label),
                notes: entry.notes,
            },
        );
    }

    batch
        .iter()
        .map(|req| by_index.remove(&req.index).unwrap_or_default())
        .collect()
}

/// Production verifier over an OpenAI-compatible endpoint.
pub struct LlmVerifier {
    client: Arc<LlmClient>,
    model: ModelSpec,
}

impl LlmVerifier {
    pub fn new(client: Arc<LlmClient>, model: ModelSpec) -> Self {
        Self { client, model }
    }

    fn prompt(sentences: &[Sentence], batch: &[VerifyRequest]) -> String {
        let by_id: BTreeMap<i64, &str> =
            sentences.iter().map(|s| (s.id, s.text.as_str())).collect();

        let items: Vec<serde_json::Value> = batch
            .iter()
            .map(|req| {
                let evidence: BTreeMap<i64, &str> = req
                    .evidence_ids
                    .iter()
                    .filter_map(|id| by_id.get(id).map(|t| (*id, *t)))
                    .collect();
                serde_json::json!({
                    "index": req.index,
                    "statement": req.text,
                    "evidence": evidence,
                    "required": req.must_relation.to_string(),
                })
            })
            .collect();

        format!(
            r#"For each item, judge the statement against ONLY its evidence sentences.
Labels:
- "support": the evidence makes the statement true
- "contradict": the evidence makes the statement false
- "weak": partial match, extension or speculation beyond the evidence
- "no_evidence": the statement cannot be connected to the evidence

Ignore "required"; it states the intended relation, not the answer.

[Items]
{items}

[Output JSON]
{{"results": [{{"index": 0, "label": "support", "notes": "one short reason"}}]}}"#,
            items = serde_json::to_string_pretty(&items).unwrap_or_default(),
        )
    }
}

impl Verifier for LlmVerifier {
    async fn verify_batch(
        &self,
        sentences: &[Sentence],
        batch: &[VerifyRequest],
    ) -> Result<Vec<VerifyOutcome>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .complete_json(&self.model, VERIFY_SYSTEM, &Self::prompt(sentences, batch))
            .await?;

        let raw = match parse_json_block::<RawVerifyResults>(&response.content) {
            Parsed::Parsed(raw) => raw,
            Parsed::Invalid(raw) => {
                warn!(raw_len = raw.len(), "Malformed verify batch, defaulting to no_evidence");
                RawVerifyResults::default()
            }
        };

        Ok(align_results(batch, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Relation;

    fn req(index: usize) -> VerifyRequest {
        VerifyRequest {
            index,
            text: format!("statement {index}"),
            evidence_ids: vec![1],
            must_relation: Relation::Support,
        }
    }

    #[test]
    fn test_align_results_by_index() {
        let batch = vec![req(0), req(2), req(4)];
        let raw: RawVerifyResults = serde_json::from_str(
            r#"{"results": [
                {"index": 4, "label": "contradict", "notes": "c"},
                {"index": 0, "label": "support", "notes": "a"}
            ]}"#,
        )
        .unwrap();

        let outcomes = align_results(&batch, raw);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].label, VerifyLabel::Support);
        assert_eq!(outcomes[1].label, VerifyLabel::NoEvidence);
        assert_eq!(outcomes[2].label, VerifyLabel::Contradict);
    }

    #[test]
    fn test_align_results_unknown_label_is_no_evidence() {
        let batch = vec![req(0)];
        let raw: RawVerifyResults = serde_json::from_str(
            r#"{"results": [{"index": 0, "label": "sorta", "notes": ""}]}"#,
        )
        .unwrap();

        let outcomes = align_results(&batch, raw);
        assert_eq!(outcomes[0].label, VerifyLabel::NoEvidence);
    }

    #[test]
    fn test_parse_label_variants() {
        assert_eq!(parse_label(" Support "), VerifyLabel::Support);
        assert_eq!(parse_label("WEAK"), VerifyLabel::Weak);
        assert_eq!(parse_label("no_evidence"), VerifyLabel::NoEvidence);
        assert_eq!(parse_label(""), VerifyLabel::NoEvidence);
    }
}
