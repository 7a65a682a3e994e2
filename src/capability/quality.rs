//! Five-axis passage quality scoring.

use crate::capability::{parse_json_block, Parsed, QualityScorer};
use crate::client::LlmClient;
use crate::models::{ModelSpec, PassFail, QualityScore, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

const QUALITY_SYSTEM: &str = "You are a strict reviewer of nonfiction reading-comprehension \
passages. Always output JSON only.";

#[derive(Debug, Deserialize)]
struct RawQuality {
    #[serde(default)]
    topic_alignment: i64,
    #[serde(default)]
    logic: i64,
    #[serde(default)]
    factuality: i64,
    #[serde(default)]
    groundedness: i64,
    #[serde(default)]
    clarity: i64,
    #[serde(default)]
    pass_fail: String,
    #[serde(default)]
    notes: String,
}

fn clamp_axis(v: i64) -> u8 {
    v.clamp(0, 2) as u8
}

fn normalize_quality(raw: RawQuality) -> QualityScore {
    QualityScore {
        topic_alignment: clamp_axis(raw.topic_alignment),
        logic: clamp_axis(raw.logic),
        factuality: clamp_axis(raw.factuality),
        groundedness: clamp_axis(raw.groundedness),
        clarity: clamp_axis(raw.clarity),
        pass_fail: if raw.pass_fail.eq_ignore_ascii_case("pass") {
            PassFail::Pass
        } else {
            PassFail::Revise
        },
        notes: raw.notes,
    }
}

/// Production scorer over an OpenAI-compatible endpoint.
pub struct LlmQualityScorer {
    client: Arc<LlmClient>,
    model: ModelSpec,
}

impl LlmQualityScorer {
    pub fn new(client: Arc<LlmClient>, model: ModelSpec) -> Self {
        Self { client, model }
    }

    fn prompt(passage: &str, topic_hint: &str, key_points: &str) -> String {
        format!(
            r#"Score the passage on five axes, each as an integer 0-2.
- topic_alignment: fits the topic hint
- logic: sentences connect without gaps or contradictions
- factuality: no claims a domain reader would reject
- groundedness: stays within the given key points, no invented specifics
- clarity: readable at the intended level

Verdict "pass" only if every axis is 2 or the weaknesses are cosmetic; otherwise "revise".

[Topic hint]: {topic_hint}
[Key points]: {key_points}
[Passage]:
{passage}

[Output JSON]
{{"topic_alignment": 2, "logic": 2, "factuality": 2, "groundedness": 2, "clarity": 2, "pass_fail": "pass", "notes": "..."}}"#
        )
    }
}

impl QualityScorer for LlmQualityScorer {
    async fn score(&self, passage: &str, topic_hint: &str, key_points: &str) -> Result<QualityScore> {
        let response = self
            .client
            .complete_json(
                &self.model,
                QUALITY_SYSTEM,
                &Self::prompt(passage, topic_hint, key_points),
            )
            .await?;

        match parse_json_block::<RawQuality>(&response.content) {
            Parsed::Parsed(raw) => Ok(normalize_quality(raw)),
            Parsed::Invalid(raw) => {
                warn!(raw_len = raw.len(), "Malformed quality score, using fallback");
                Ok(QualityScore::fallback("unparseable scorer output"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_quality_clamps_axes() {
        let raw: RawQuality = serde_json::from_str(
            r#"{"topic_alignment": 5, "logic": -1, "factuality": 2, "groundedness": 1,
                "clarity": 0, "pass_fail": "PASS", "notes": "ok"}"#,
        )
        .unwrap();

        let score = normalize_quality(raw);
        assert_eq!(score.topic_alignment, 2);
        assert_eq!(score.logic, 0);
        assert_eq!(score.factuality, 2);
        assert_eq!(score.pass_fail, PassFail::Pass);
    }

    #[test]
    fn test_normalize_quality_unknown_verdict_is_revise() {
        let raw: RawQuality =
            serde_json::from_str(r#"{"pass_fail": "maybe", "notes": ""}"#).unwrap();
        assert_eq!(normalize_quality(raw).pass_fail, PassFail::Revise);
    }

    #[test]
    fn test_fallback_score_requires_revision() {
        let score = QualityScore::fallback("bad");
        assert_eq!(score.pass_fail, PassFail::Revise);
        assert_eq!(score.topic_alignment, 1);
    }
}
