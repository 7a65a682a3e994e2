//! Aggregate RAG-style metrics over a verified choice batch.

use crate::models::{AggregateMetrics, Choice};

/// Compute the batch summary from finalized choices.
///
/// All fractions are over the choices present; an empty batch reports zeros
/// with a full faithfulness error rate so it can never look healthy.
pub fn aggregate(choices: &[Choice], sim_threshold: f64) -> AggregateMetrics {
    if choices.is_empty() {
        return AggregateMetrics {
            label_accuracy: 0.0,
            avg_evidence_strength: 0.0,
            context_precision: 0.0,
            context_recall: 0.0,
            faithfulness_error_rate: 1.0,
            sim_threshold,
            method: "embed_cached".to_string(),
        };
    }

    let n = choices.len() as f64;
    let accepted = choices.iter().filter(|c| c.is_accepted()).count() as f64;

    let mut strength_sum = 0.0;
    let mut picked_total = 0usize;
    let mut picked_above = 0usize;
    let mut recall_sum = 0.0;
    let mut recall_n = 0usize;

    for choice in choices {
        let diag = &choice.evidence_diagnostics;
        let sims: Vec<f64> = diag
            .picked
            .iter()
            .filter_map(|id| diag.similarity_by_id.get(id).copied())
            .collect();
        if !sims.is_empty() {
            strength_sum += sims.iter().sum::<f64>() / sims.len() as f64;
        }

        picked_total += diag.picked.len();
        picked_above += sims.iter().filter(|s| **s >= sim_threshold).count();

        if !choice.declared_evidence_ids.is_empty() {
            let retained = choice
                .declared_evidence_ids
                .iter()
                .filter(|id| diag.picked.contains(id))
                .count() as f64;
            recall_sum += retained / choice.declared_evidence_ids.len() as f64;
            recall_n += 1;
        }
    }

    let method = if choices
        .iter()
        .all(|c| c.evidence_diagnostics.method == "embed_cached")
    {
        "embed_cached"
    } else {
        "overlap_fallback"
    };

    AggregateMetrics {
        label_accuracy: accepted / n,
        avg_evidence_strength: strength_sum / n,
        context_precision: if picked_total > 0 {
            picked_above as f64 / picked_total as f64
        } else {
            0.0
        },
        context_recall: if recall_n > 0 {
            recall_sum / recall_n as f64
        } else {
            0.0
        },
        faithfulness_error_rate: (n - accepted) / n,
        sim_threshold,
        method: method.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvidenceDiagnostics, Relation, VerifyLabel};
    use std::collections::BTreeMap;

    fn choice(index: usize, label: VerifyLabel, picked: Vec<i64>, sims: &[(i64, f64)]) -> Choice {
        Choice {
            index,
            text: format!("choice {index}"),
            is_correct: index == 0,
            relation: if index == 0 {
                Relation::Support
            } else {
                Relation::Contradict
            },
            evidence_sentence_ids: picked.clone(),
            declared_evidence_ids: picked.clone(),
            evidence_diagnostics: EvidenceDiagnostics {
                method: "embed_cached".to_string(),
                picked,
                similarity_by_id: sims.iter().copied().collect::<BTreeMap<_, _>>(),
            },
            verify_label: Some(label),
            verify_notes: String::new(),
        }
    }

    #[test]
    fn test_aggregate_all_accepted() {
        let choices = vec![
            choice(0, VerifyLabel::Support, vec![1], &[(1, 0.8)]),
            choice(1, VerifyLabel::Contradict, vec![2], &[(2, 0.6)]),
        ];
        let m = aggregate(&choices, 0.22);
        assert!((m.label_accuracy - 1.0).abs() < 1e-9);
        assert!((m.faithfulness_error_rate).abs() < 1e-9);
        assert!((m.avg_evidence_strength - 0.7).abs() < 1e-9);
        assert!((m.context_precision - 1.0).abs() < 1e-9);
        assert!((m.context_recall - 1.0).abs() < 1e-9);
        assert_eq!(m.method, "embed_cached");
    }

    #[test]
    fn test_aggregate_counts_weak_as_error() {
        let choices = vec![
            choice(0, VerifyLabel::Support, vec![1], &[(1, 0.8)]),
            choice(1, VerifyLabel::Weak, vec![2], &[(2, 0.1)]),
        ];
        let m = aggregate(&choices, 0.22);
        assert!((m.label_accuracy - 0.5).abs() < 1e-9);
        assert!((m.faithfulness_error_rate - 0.5).abs() < 1e-9);
        // one of two picked ids clears the threshold
        assert!((m.context_precision - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_empty_batch_is_unhealthy() {
        let m = aggregate(&[], 0.22);
        assert_eq!(m.label_accuracy, 0.0);
        assert_eq!(m.faithfulness_error_rate, 1.0);
    }

    #[test]
    fn test_aggregate_mixed_method_reports_fallback() {
        let mut a = choice(0, VerifyLabel::Support, vec![1], &[(1, 0.8)]);
        a.evidence_diagnostics.method = "overlap_fallback".to_string();
        let b = choice(1, VerifyLabel::Contradict, vec![2], &[(2, 0.6)]);
        let m = aggregate(&[a, b], 0.22);
        assert_eq!(m.method, "overlap_fallback");
    }
}
