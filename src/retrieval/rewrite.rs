//! Retrieval-oriented query rewriting.
//!
//! Turns a passage the learner struggled with (plus their stated reason)
//! into a compact query aimed at pedagogically useful material. A failed
//! rewrite degrades to the passage head instead of aborting retrieval.

use crate::capability::{parse_json_block, Parsed};
use crate::client::LlmClient;
use crate::models::{ModelSpec, Result, RewrittenQuery};
use tracing::warn;

const REWRITE_SYSTEM: &str = "You turn difficult reading passages into search queries for \
easier study material. Always output JSON only.";

const FALLBACK_QUERY_CHARS: usize = 200;

/// Degraded rewrite: the first line of the learner's reason, truncated,
/// with empty hint lists. The passage head stands in when the reason is
/// blank too.
pub fn fallback_query(reason: &str, passage: &str) -> RewrittenQuery {
    let head = first_line(reason);
    let head = if head.is_empty() {
        first_line(passage)
    } else {
        head
    };
    RewrittenQuery {
        query: head.chars().take(FALLBACK_QUERY_CHARS).collect(),
        ..Default::default()
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
}

fn prompt(passage: &str, reason: &str) -> String {
    format!(
        r#"A learner found this passage too hard. Produce a retrieval query for material that
teaches the same concepts more gently.

- "query": one compact search query capturing the core concepts
- "must_have_terms": concepts any derived query must keep
- "reading_goals": what the learner should come to understand
- "simplify_strategy": how to soften what they found hard
- "should_avoid_terms": elements derived material should avoid

[Reason it was hard]: {reason}
[Passage]:
{passage}

[Output JSON]
{{"query": "...", "must_have_terms": ["..."], "reading_goals": ["..."], "simplify_strategy": "...", "should_avoid_terms": ["..."]}}"#
    )
}

/// Rewrite the passage into a retrieval query.
pub async fn rewrite_query(
    client: &LlmClient,
    model: &ModelSpec,
    passage: &str,
    reason: &str,
) -> Result<RewrittenQuery> {
    let response = client
        .complete_json(model, REWRITE_SYSTEM, &prompt(passage, reason))
        .await?;

    match parse_json_block::<RewrittenQuery>(&response.content) {
        Parsed::Parsed(mut rewritten) => {
            if rewritten.query.trim().is_empty() {
                rewritten.query = fallback_query(reason, passage).query;
            }
            Ok(rewritten)
        }
        Parsed::Invalid(raw) => {
            warn!(raw_len = raw.len(), "Malformed query rewrite, using degraded query");
            Ok(fallback_query(reason, passage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_query_takes_reason_first_line() {
        let rewritten = fallback_query(
            "\n\n  too many technical terms  \nand long sentences",
            "Osmosis moves water across membranes.",
        );
        assert_eq!(rewritten.query, "too many technical terms");
        assert!(rewritten.must_have_terms.is_empty());
    }

    #[test]
    fn test_fallback_query_blank_reason_uses_passage_head() {
        let rewritten = fallback_query("   ", "Osmosis moves water.\nMore.");
        assert_eq!(rewritten.query, "Osmosis moves water.");
    }

    #[test]
    fn test_fallback_query_truncates() {
        let long = "x".repeat(500);
        assert_eq!(fallback_query(&long, "").query.chars().count(), 200);
    }
}
