//! Bounded generate/verify/repair loop for one item request.
//!
//! Lifecycle per attempt: draft the passage, fork choice drafting and
//! quality scoring, embed everything once, then verify. Failing choices are
//! all rewritten in each repair round and re-verified in one batch. Rounds
//! and full regenerations are hard-bounded; running out marks the result
//! exhausted instead of failing it.

use crate::capability::{
    ChoiceDraft, Difficulty, Embedder, Generator, PassageRequest, QualityScorer, RewriteRequest,
    SeedContext, Verifier, VerifyRequest,
};
use crate::evidence::{link_evidence, EmbeddingCache};
use crate::models::{
    db_key, Choice, GenerationResult, PipelineConfig, QualityScore, RepairRecord, Result, Sentence,
    TekmerionError, Telemetry, VerifyLabel,
};
use crate::pipeline::metrics::aggregate;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// One item generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub topic: String,
    pub difficulty: Difficulty,
    /// Overrides the configured default passage length
    pub target_chars: Option<u32>,
    /// Retrieved seed material; absent for free generation
    pub seed_context: Option<SeedContext>,
    /// False skips choice drafting and verification: passage + quality only
    pub include_choices: bool,
}

struct AttemptOutcome {
    title: String,
    question: String,
    sentences: Vec<Sentence>,
    choices: Vec<Choice>,
    quality: QualityScore,
    repairs: Vec<RepairRecord>,
    repair_rounds: u32,
    all_accepted: bool,
}

/// Drives one request through generation, verification and bounded repair.
pub struct Orchestrator<G, Q, V, E> {
    generator: Arc<G>,
    quality: Arc<Q>,
    verifier: Arc<V>,
    embedder: Arc<E>,
    config: PipelineConfig,
    pool: Arc<Semaphore>,
}

impl<G, Q, V, E> Orchestrator<G, Q, V, E>
where
    G: Generator,
    Q: QualityScorer,
    V: Verifier,
    E: Embedder,
{
    pub fn new(
        generator: Arc<G>,
        quality: Arc<Q>,
        verifier: Arc<V>,
        embedder: Arc<E>,
        config: PipelineConfig,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            generator,
            quality,
            verifier,
            embedder,
            config,
            pool,
        }
    }

    /// Run one request to completion.
    ///
    /// Always returns a result when the capabilities stay reachable; an
    /// unrepairable batch comes back with `exhausted = true`.
    pub async fn run(&self, req: &GenerateRequest) -> Result<GenerationResult> {
        let id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut telemetry = Telemetry::default();
        let mut regen_count = 0u32;

        info!(request_id = %id, topic = %req.topic, difficulty = ?req.difficulty, "Starting item generation");

        let mut outcome = self.attempt(req, &mut telemetry).await?;
        while !outcome.all_accepted && regen_count < self.config.max_regenerate {
            regen_count += 1;
            warn!(
                request_id = %id,
                regen_count = regen_count,
                "Repair rounds exhausted, regenerating from scratch"
            );
            outcome = self.attempt(req, &mut telemetry).await?;
        }

        let exhausted = !outcome.all_accepted;
        if exhausted {
            warn!(request_id = %id, "Delivering exhausted result");
        }

        let passage_text = outcome
            .sentences
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let rag_eval = req
            .include_choices
            .then(|| aggregate(&outcome.choices, self.config.sim_threshold));

        telemetry.repair_rounds = outcome.repair_rounds;
        telemetry.regen_count = regen_count;
        telemetry.total_ms = started.elapsed().as_secs_f64() * 1000.0;

        info!(
            request_id = %id,
            exhausted = exhausted,
            repair_rounds = outcome.repair_rounds,
            label_accuracy = rag_eval.as_ref().map(|e| e.label_accuracy).unwrap_or(1.0),
            total_ms = telemetry.total_ms,
            "Item generation finished"
        );

        Ok(GenerationResult {
            id,
            db_key: db_key(&outcome.title, &passage_text),
            title: outcome.title,
            question: outcome.question,
            passage_text,
            sentences: outcome.sentences,
            choices: outcome.choices,
            quality: outcome.quality,
            rag_eval,
            repairs: outcome.repairs,
            regen_count,
            exhausted,
            telemetry,
            created_at: Utc::now(),
        })
    }

    async fn attempt(
        &self,
        req: &GenerateRequest,
        telemetry: &mut Telemetry,
    ) -> Result<AttemptOutcome> {
        let passage_req = PassageRequest {
            topic: req.topic.clone(),
            difficulty: req.difficulty,
            target_chars: req.target_chars.unwrap_or(self.config.target_chars),
            seed_context: req.seed_context.clone(),
        };

        let t = Instant::now();
        let draft = {
            let _permit = self.pool.acquire().await.map_err(|_| {
                TekmerionError::Internal("worker pool closed".to_string())
            })?;
            self.generator.draft_passage(&passage_req).await?
        };
        telemetry.gen_passage_ms += t.elapsed().as_secs_f64() * 1000.0;
        telemetry.api_calls.generate_passage += 1;

        if draft.sentences.is_empty() {
            return Err(TekmerionError::ParseError(
                "passage draft produced no sentences".to_string(),
            ));
        }

        let passage_text = draft
            .sentences
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let topic_hint = &req.topic;
        let key_points = req
            .seed_context
            .as_ref()
            .map(|s| {
                s.sentences
                    .iter()
                    .map(|sent| sent.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        // Choice drafting and quality scoring are independent; fork them.
        let t = Instant::now();
        let (choice_drafts, quality) = if req.include_choices {
            let (drafts, quality) = tokio::join!(
                async {
                    let _permit = self.pool.acquire().await.map_err(|_| {
                        TekmerionError::Internal("worker pool closed".to_string())
                    })?;
                    self.generator.draft_choices(&draft.sentences).await
                },
                async {
                    let _permit = self.pool.acquire().await.map_err(|_| {
                        TekmerionError::Internal("worker pool closed".to_string())
                    })?;
                    self.quality.score(&passage_text, topic_hint, &key_points).await
                }
            );
            telemetry.api_calls.generate_choices += 1;
            (drafts?, quality?)
        } else {
            let quality = {
                let _permit = self.pool.acquire().await.map_err(|_| {
                    TekmerionError::Internal("worker pool closed".to_string())
                })?;
                self.quality.score(&passage_text, topic_hint, &key_points).await?
            };
            (Vec::new(), quality)
        };
        let fork_ms = t.elapsed().as_secs_f64() * 1000.0;
        telemetry.gen_choices_ms += fork_ms;
        telemetry.quality_ms += fork_ms;
        telemetry.api_calls.quality += 1;

        if req.include_choices && choice_drafts.is_empty() {
            return Err(TekmerionError::ParseError(
                "choice draft produced no options".to_string(),
            ));
        }

        let mut choices: Vec<Choice> = choice_drafts
            .iter()
            .enumerate()
            .map(|(index, d)| from_draft(index, d))
            .collect();

        let mut repairs = Vec::new();
        let mut repair_rounds = 0u32;

        if choices.is_empty() {
            return Ok(AttemptOutcome {
                title: draft.title,
                question: draft.question,
                sentences: draft.sentences,
                all_accepted: true,
                choices,
                quality,
                repairs,
                repair_rounds,
            });
        }

        let mut cache = EmbeddingCache::new();
        self.embed_sentences(&draft.sentences, &mut cache, telemetry)
            .await?;
        self.embed_choices(&choices, &mut cache, telemetry).await?;

        self.verify_round(&draft.sentences, &mut choices, &cache, None, telemetry)
            .await?;

        while choices.iter().any(|c| !c.is_accepted())
            && repair_rounds < self.config.max_repair_rounds
        {
            repair_rounds += 1;
            let failing: Vec<usize> = choices
                .iter()
                .filter(|c| !c.is_accepted())
                .map(|c| c.index)
                .collect();
            debug!(round = repair_rounds, failing = failing.len(), "Repair round");

            for &index in &failing {
                let record = self
                    .repair_choice(&draft.sentences, &mut choices[index], telemetry)
                    .await?;
                repairs.push(record);
            }

            // Only rewritten texts need fresh vectors.
            let repaired: Vec<Choice> = failing
                .iter()
                .map(|&i| choices[i].clone())
                .collect();
            self.embed_choices(&repaired, &mut cache, telemetry).await?;

            self.verify_round(
                &draft.sentences,
                &mut choices,
                &cache,
                Some(&failing),
                telemetry,
            )
            .await?;
        }

        Ok(AttemptOutcome {
            title: draft.title,
            question: draft.question,
            sentences: draft.sentences,
            all_accepted: choices.iter().all(|c| c.is_accepted()),
            choices,
            quality,
            repairs,
            repair_rounds,
        })
    }

    async fn embed_sentences(
        &self,
        sentences: &[Sentence],
        cache: &mut EmbeddingCache,
        telemetry: &mut Telemetry,
    ) -> Result<()> {
        let texts: Vec<String> = sentences.iter().map(|s| s.text.clone()).collect();
        let t = Instant::now();
        let vectors = self.embedder.embed(&texts).await?;
        telemetry.embed_ms_total += t.elapsed().as_secs_f64() * 1000.0;
        telemetry.api_calls.embed += 1;

        if vectors.len() == sentences.len() {
            for (sentence, vector) in sentences.iter().zip(vectors) {
                cache.put_sentence(sentence.id, vector);
            }
        } else if !vectors.is_empty() {
            warn!(
                expected = sentences.len(),
                got = vectors.len(),
                "Sentence embedding batch misaligned, ignoring"
            );
        }
        Ok(())
    }

    async fn embed_choices(
        &self,
        choices: &[Choice],
        cache: &mut EmbeddingCache,
        telemetry: &mut Telemetry,
    ) -> Result<()> {
        let texts: Vec<String> = choices.iter().map(|c| c.text.clone()).collect();
        let t = Instant::now();
        let vectors = self.embedder.embed(&texts).await?;
        telemetry.embed_ms_total += t.elapsed().as_secs_f64() * 1000.0;
        telemetry.api_calls.embed += 1;

        if vectors.len() == choices.len() {
            for (choice, vector) in choices.iter().zip(vectors) {
                cache.put_choice(choice.index, vector);
            }
        } else if !vectors.is_empty() {
            warn!(
                expected = choices.len(),
                got = vectors.len(),
                "Choice embedding batch misaligned, ignoring"
            );
        }
        Ok(())
    }

    /// Link evidence and verify; `only` restricts the batch to the given
    /// indices (repair rounds), otherwise every choice is judged.
    async fn verify_round(
        &self,
        sentences: &[Sentence],
        choices: &mut [Choice],
        cache: &EmbeddingCache,
        only: Option<&[usize]>,
        telemetry: &mut Telemetry,
    ) -> Result<()> {
        let pending: Vec<usize> = match only {
            Some(indices) => indices.to_vec(),
            None => choices.iter().map(|c| c.index).collect(),
        };

        let mut batch = Vec::with_capacity(pending.len());
        for &index in &pending {
            let choice = &mut choices[index];
            let diag = link_evidence(
                choice.index,
                &choice.text,
                &choice.declared_evidence_ids,
                sentences,
                cache,
                self.config.sim_threshold,
                self.config.max_keep,
            );
            if diag.picked.is_empty() {
                // None of the declared ids exist in the passage. There is
                // nothing to cite, so the choice fails straight into repair.
                warn!(choice_index = choice.index, "No usable evidence for choice");
                choice.evidence_sentence_ids.clear();
                choice.evidence_diagnostics = diag;
                choice.verify_label = Some(VerifyLabel::NoEvidence);
                choice.verify_notes = "declared evidence ids not in passage".to_string();
                continue;
            }
            choice.evidence_sentence_ids = diag.picked.clone();
            choice.evidence_diagnostics = diag;

            batch.push(VerifyRequest {
                index: choice.index,
                text: choice.text.clone(),
                evidence_ids: choice.evidence_sentence_ids.clone(),
                must_relation: choice.must_relation(),
            });
        }

        if batch.is_empty() {
            return Ok(());
        }

        let t = Instant::now();
        let outcomes = {
            let _permit = self.pool.acquire().await.map_err(|_| {
                TekmerionError::Internal("worker pool closed".to_string())
            })?;
            self.verifier.verify_batch(sentences, &batch).await?
        };
        telemetry.verify_ms_total += t.elapsed().as_secs_f64() * 1000.0;
        telemetry.api_calls.verify += 1;

        for (req, outcome) in batch.iter().zip(outcomes) {
            let choice = &mut choices[req.index];
            choice.verify_label = Some(outcome.label);
            choice.verify_notes = outcome.notes;
        }
        Ok(())
    }

    async fn repair_choice(
        &self,
        sentences: &[Sentence],
        choice: &mut Choice,
        telemetry: &mut Telemetry,
    ) -> Result<RepairRecord> {
        let evidence: Vec<(i64, String)> = sentences
            .iter()
            .filter(|s| choice.evidence_sentence_ids.contains(&s.id))
            .map(|s| (s.id, s.text.clone()))
            .collect();

        let rewrite_req = RewriteRequest {
            choice_text: choice.text.clone(),
            must_relation: choice.must_relation(),
            evidence,
        };

        let t = Instant::now();
        let rewritten = {
            let _permit = self.pool.acquire().await.map_err(|_| {
                TekmerionError::Internal("worker pool closed".to_string())
            })?;
            self.generator.rewrite_choice(&rewrite_req).await?
        };
        telemetry.rewrite_ms_total += t.elapsed().as_secs_f64() * 1000.0;
        telemetry.api_calls.rewrite += 1;

        let record = RepairRecord {
            choice_index: choice.index,
            must_relation: choice.must_relation(),
            before_text: choice.text.clone(),
            after_text: rewritten.clone(),
            reason: if choice.verify_notes.is_empty() {
                format!("label {:?}", choice.verify_label)
            } else {
                choice.verify_notes.clone()
            },
        };

        choice.text = rewritten;
        choice.verify_label = None;
        choice.verify_notes.clear();
        Ok(record)
    }
}

fn from_draft(index: usize, draft: &ChoiceDraft) -> Choice {
    Choice {
        index,
        text: draft.text.clone(),
        is_correct: draft.is_correct,
        relation: draft.relation,
        evidence_sentence_ids: Vec::new(),
        declared_evidence_ids: draft.evidence_sentence_ids.clone(),
        evidence_diagnostics: Default::default(),
        verify_label: None,
        verify_notes: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{PassageDraft, VerifyOutcome};
    use crate::models::{Relation, VerifyLabel};
    use std::sync::Mutex;

    struct ScriptedGenerator {
        rewrites: Mutex<u32>,
        passages: Mutex<u32>,
        second_evidence: Vec<i64>,
    }

    impl ScriptedGenerator {
        fn new() -> Self {
            Self {
                rewrites: Mutex::new(0),
                passages: Mutex::new(0),
                second_evidence: vec![1],
            }
        }

        /// Same fixed passage, but the second choice declares these ids.
        fn with_second_evidence(ids: Vec<i64>) -> Self {
            Self {
                second_evidence: ids,
                ..Self::new()
            }
        }
    }

    impl Generator for ScriptedGenerator {
        async fn draft_passage(&self, _req: &PassageRequest) -> Result<PassageDraft> {
            *self.passages.lock().unwrap() += 1;
            Ok(PassageDraft {
                title: "Tidal Forces".to_string(),
                question: "Which statement is consistent with the passage?".to_string(),
                sentences: vec![
                    Sentence {
                        id: 1,
                        text: "Tides rise twice a day.".to_string(),
                    },
                    Sentence {
                        id: 2,
                        text: "The moon drives the tides.".to_string(),
                    },
                ],
            })
        }

        async fn draft_choices(&self, _sentences: &[Sentence]) -> Result<Vec<ChoiceDraft>> {
            Ok(vec![
                ChoiceDraft {
                    text: "The moon drives the tides.".to_string(),
                    is_correct: true,
                    relation: Relation::Support,
                    evidence_sentence_ids: vec![2],
                },
                ChoiceDraft {
                    text: "Tides rise once a week.".to_string(),
                    is_correct: false,
                    relation: Relation::Contradict,
                    evidence_sentence_ids: self.second_evidence.clone(),
                },
            ])
        }

        async fn rewrite_choice(&self, req: &RewriteRequest) -> Result<String> {
            *self.rewrites.lock().unwrap() += 1;
            Ok(format!("{} (revised)", req.choice_text))
        }
    }

    struct FixedQuality;

    impl QualityScorer for FixedQuality {
        async fn score(&self, _p: &str, _t: &str, _k: &str) -> Result<QualityScore> {
            Ok(QualityScore {
                topic_alignment: 2,
                logic: 2,
                factuality: 2,
                groundedness: 2,
                clarity: 2,
                pass_fail: crate::models::PassFail::Pass,
                notes: String::new(),
            })
        }
    }

    /// Pops one scripted label set per call; repeats the last set when the
    /// script runs out.
    struct ScriptedVerifier {
        script: Mutex<Vec<Vec<VerifyLabel>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedVerifier {
        fn new(script: Vec<Vec<VerifyLabel>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }
    }

    impl Verifier for ScriptedVerifier {
        async fn verify_batch(
            &self,
            _sentences: &[Sentence],
            batch: &[VerifyRequest],
        ) -> Result<Vec<VerifyOutcome>> {
            *self.calls.lock().unwrap() += 1;
            let labels = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script[0].clone()
                }
            };
            Ok(batch
                .iter()
                .enumerate()
                .map(|(i, _)| VerifyOutcome {
                    label: labels.get(i).copied().unwrap_or(VerifyLabel::NoEvidence),
                    notes: "scripted".to_string(),
                })
                .collect())
        }
    }

    struct UnitEmbedder;

    impl Embedder for UnitEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct DownEmbedder;

    impl Embedder for DownEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            topic: "earth science".to_string(),
            difficulty: Difficulty::Standard,
            target_chars: None,
            seed_context: None,
            include_choices: true,
        }
    }

    fn orchestrator<V: Verifier, E: Embedder>(
        verifier: V,
        embedder: E,
    ) -> Orchestrator<ScriptedGenerator, FixedQuality, V, E> {
        Orchestrator::new(
            Arc::new(ScriptedGenerator::new()),
            Arc::new(FixedQuality),
            Arc::new(verifier),
            Arc::new(embedder),
            PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_clean_batch_accepted_without_repairs() {
        let orch = orchestrator(
            ScriptedVerifier::new(vec![vec![VerifyLabel::Support, VerifyLabel::Contradict]]),
            UnitEmbedder,
        );

        let result = orch.run(&request()).await.unwrap();
        assert!(!result.exhausted);
        assert!(result.repairs.is_empty());
        assert_eq!(result.telemetry.repair_rounds, 0);
        let eval = result.rag_eval.unwrap();
        assert!((eval.label_accuracy - 1.0).abs() < 1e-9);
        assert!(eval.faithfulness_error_rate.abs() < 1e-9);
        assert!(result.db_key.starts_with("tidal-forces-"));
    }

    #[tokio::test]
    async fn test_persistent_failure_is_bounded_and_exhausted() {
        // Second choice never verifies; rounds must stop at the bound.
        let orch = orchestrator(
            ScriptedVerifier::new(vec![vec![VerifyLabel::Support, VerifyLabel::Weak]]),
            UnitEmbedder,
        );

        let result = orch.run(&request()).await.unwrap();
        assert!(result.exhausted);
        assert_eq!(result.telemetry.repair_rounds, 2);
        assert_eq!(result.repairs.len(), 2);
        assert_eq!(result.repairs[0].choice_index, 1);
        assert!(result.repairs[1].after_text.contains("(revised)"));
        let eval = result.rag_eval.unwrap();
        assert!(eval.faithfulness_error_rate > 0.0);
    }

    #[tokio::test]
    async fn test_repair_succeeds_in_first_round() {
        let orch = orchestrator(
            ScriptedVerifier::new(vec![
                vec![VerifyLabel::Support, VerifyLabel::Weak],
                // repair round re-verifies only the failing choice
                vec![VerifyLabel::Contradict],
            ]),
            UnitEmbedder,
        );

        let result = orch.run(&request()).await.unwrap();
        assert!(!result.exhausted);
        assert_eq!(result.telemetry.repair_rounds, 1);
        assert_eq!(result.repairs.len(), 1);
        assert!(result.choices[1].is_accepted());
        assert!((result.rag_eval.unwrap().label_accuracy - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_embedder_outage_degrades_to_overlap() {
        let orch = orchestrator(
            ScriptedVerifier::new(vec![vec![VerifyLabel::Support, VerifyLabel::Contradict]]),
            DownEmbedder,
        );

        let result = orch.run(&request()).await.unwrap();
        assert!(!result.exhausted);
        assert_eq!(result.rag_eval.unwrap().method, "overlap_fallback");
        for choice in &result.choices {
            assert!(!choice.evidence_sentence_ids.is_empty());
        }
    }

    #[tokio::test]
    async fn test_passage_only_skips_choices_and_verification() {
        let orch = orchestrator(
            ScriptedVerifier::new(vec![vec![VerifyLabel::Support]]),
            UnitEmbedder,
        );

        let mut req = request();
        req.include_choices = false;
        let result = orch.run(&req).await.unwrap();
        assert!(!result.exhausted);
        assert!(result.choices.is_empty());
        assert!(result.rag_eval.is_none());
        assert_eq!(result.telemetry.api_calls.generate_choices, 0);
        assert_eq!(result.telemetry.api_calls.verify, 0);
        assert_eq!(result.telemetry.api_calls.quality, 1);
    }

    #[tokio::test]
    async fn test_dangling_evidence_ids_fail_choice_into_repair() {
        // The distractor cites sentence ids that do not exist in the passage.
        // That must not abort the request and must not silently link some
        // unrelated sentence: the choice fails and gets rewritten.
        let generator = Arc::new(ScriptedGenerator::with_second_evidence(vec![99, 100]));
        let orch = Orchestrator::new(
            Arc::clone(&generator),
            Arc::new(FixedQuality),
            Arc::new(ScriptedVerifier::new(vec![vec![VerifyLabel::Support]])),
            Arc::new(UnitEmbedder),
            PipelineConfig::default(),
        );

        let result = orch.run(&request()).await.unwrap();
        assert!(result.exhausted);
        assert_eq!(result.repairs.len(), 2);
        assert_eq!(result.repairs[0].choice_index, 1);
        assert_eq!(*generator.rewrites.lock().unwrap(), 2);

        let dangling = &result.choices[1];
        assert_eq!(dangling.verify_label, Some(VerifyLabel::NoEvidence));
        assert!(dangling.evidence_sentence_ids.is_empty());
        assert!(dangling.evidence_diagnostics.picked.is_empty());
        // The healthy choice still went through exactly one verify batch.
        assert_eq!(result.telemetry.api_calls.verify, 1);
        assert!(result.choices[0].is_accepted());
    }

    #[tokio::test]
    async fn test_regeneration_bound_restarts_once_then_exhausts() {
        let generator = Arc::new(ScriptedGenerator::new());
        let orch = Orchestrator::new(
            Arc::clone(&generator),
            Arc::new(FixedQuality),
            Arc::new(ScriptedVerifier::new(vec![vec![
                VerifyLabel::Support,
                VerifyLabel::Weak,
            ]])),
            Arc::new(UnitEmbedder),
            PipelineConfig {
                max_regenerate: 1,
                ..Default::default()
            },
        );

        let result = orch.run(&request()).await.unwrap();
        assert!(result.exhausted);
        assert_eq!(result.regen_count, 1);
        assert_eq!(*generator.passages.lock().unwrap(), 2);
        assert_eq!(result.telemetry.api_calls.generate_passage, 2);
        // Repairs and rounds describe the final attempt.
        assert_eq!(result.telemetry.repair_rounds, 2);
        assert_eq!(result.repairs.len(), 2);
        // Two attempts, two repair rounds each.
        assert_eq!(*generator.rewrites.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_telemetry_counts_capability_calls() {
        let orch = orchestrator(
            ScriptedVerifier::new(vec![vec![VerifyLabel::Support, VerifyLabel::Contradict]]),
            UnitEmbedder,
        );

        let result = orch.run(&request()).await.unwrap();
        let calls = &result.telemetry.api_calls;
        assert_eq!(calls.generate_passage, 1);
        assert_eq!(calls.generate_choices, 1);
        assert_eq!(calls.quality, 1);
        assert_eq!(calls.verify, 1);
        assert_eq!(calls.rewrite, 0);
        assert_eq!(calls.embed, 2);
    }
}
