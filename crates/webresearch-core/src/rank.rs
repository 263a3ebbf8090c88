//! Relevance ranking: score acquired documents against the question and keep a
//! bounded, ordered research context.
//!
//! Ordering policy: descending score with a stable sort, so equal scores keep
//! their acquisition order. Truncation admits at most `top_k` documents; the
//! best document is always admitted, and each following one only while the
//! running word total stays within `word_budget`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::acquire::{Document, SourceLocation};
use crate::answer::Degradation;
use crate::capability::{
    CapabilityError, DynCapability, ReasoningRequest, RetryPolicy, invoke_with_retry, signature,
};
use crate::config::RankingConfig;
use crate::text::truncate_chars;

const SCORE_INSTRUCTION: &str = "You judge how useful a web document is for answering a research \
question. Consider meaning, not keyword overlap. Return a relevance score between 0 and 1 and a \
one-sentence rationale.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSource {
    document: Document,
    score: f64,
    rank: usize,
    rationale: String,
}

impl RankedSource {
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn source(&self) -> &str {
        self.document.source()
    }

    /// Relevance in `[0.0, 1.0]`.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// 1-based position in the context.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }
}

/// A document with its relevance judgment, before ordering.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f64,
    pub rationale: String,
}

/// Ordered, bounded evidence set for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchContext {
    sources: Vec<RankedSource>,
}

impl ResearchContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Order `scored` by descending score and truncate to `top_k` and `word_budget`.
    pub fn assemble(mut scored: Vec<ScoredDocument>, top_k: usize, word_budget: usize) -> Self {
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut sources = Vec::new();
        let mut words = 0usize;
        for entry in scored.into_iter().take(top_k) {
            let next = words + entry.document.word_count();
            if !sources.is_empty() && next > word_budget {
                break;
            }
            words = next;
            sources.push(RankedSource {
                rank: sources.len() + 1,
                score: entry.score,
                rationale: entry.rationale,
                document: entry.document,
            });
        }
        Self { sources }
    }

    pub fn sources(&self) -> &[RankedSource] {
        &self.sources
    }

    /// Source at a 1-based rank.
    pub fn get(&self, rank: usize) -> Option<&RankedSource> {
        rank.checked_sub(1).and_then(|idx| self.sources.get(idx))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn locations(&self) -> Vec<SourceLocation> {
        self.sources
            .iter()
            .map(|source| source.source().to_string())
            .collect()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.sources.iter().any(|source| source.source() == location)
    }

    pub fn total_words(&self) -> usize {
        self.sources
            .iter()
            .map(|source| source.document.word_count())
            .sum()
    }
}

pub struct RelevanceRanker {
    capability: DynCapability,
    settings: RankingConfig,
    retry: RetryPolicy,
}

impl RelevanceRanker {
    pub fn new(capability: DynCapability, settings: RankingConfig, retry: RetryPolicy) -> Self {
        Self {
            capability,
            settings,
            retry,
        }
    }

    pub async fn rank(&self, question: &str, documents: &[Document]) -> ResearchContext {
        self.rank_detailed(question, documents).await.0
    }

    /// Rank and also return the documents dropped because scoring failed.
    #[instrument(name = "rank.documents", skip_all, fields(documents = documents.len()))]
    pub async fn rank_detailed(
        &self,
        question: &str,
        documents: &[Document],
    ) -> (ResearchContext, Vec<Degradation>) {
        let mut scored = Vec::new();
        let mut degradations = Vec::new();

        for document in documents.iter().filter(|doc| doc.is_success()) {
            match self.score_document(question, document).await {
                Ok((score, rationale)) => {
                    debug!(source = document.source(), score, "document scored");
                    scored.push(ScoredDocument {
                        document: document.clone(),
                        score,
                        rationale,
                    });
                }
                Err(error) => degradations.push(
                    Degradation::RankingFailure {
                        source: document.source().to_string(),
                        error,
                    }
                    .recorded(),
                ),
            }
        }

        let context =
            ResearchContext::assemble(scored, self.settings.top_k, self.settings.word_budget);
        info!(
            ranked = context.len(),
            words = context.total_words(),
            dropped = degradations.len(),
            "research context assembled"
        );
        (context, degradations)
    }

    async fn score_document(
        &self,
        question: &str,
        document: &Document,
    ) -> Result<(f64, String), CapabilityError> {
        let request = ReasoningRequest::new(signature::SCORE_RELEVANCE, SCORE_INSTRUCTION)
            .input("question", question)
            .input("document_title", document.title().unwrap_or_default())
            .input("document_headings", document.headings().join("; "))
            .input(
                "document_content",
                truncate_chars(document.body(), self.settings.excerpt_chars),
            )
            .output("relevance_score", "number between 0.0 and 1.0")
            .output("rationale", "one sentence explaining the score");

        let output = invoke_with_retry(self.capability.as_ref(), &request, &self.retry).await?;
        let score = output.number("relevance_score")?.clamp(0.0, 1.0);
        let rationale = output.text("rationale").unwrap_or_default();
        Ok((score, rationale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{OfflineCapability, ReasoningCapability, ReasoningOutput};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn doc(location: &str, words: usize) -> Document {
        let body = vec!["word"; words].join(" ");
        Document::from_parts(location, None, Vec::new(), &body)
    }

    fn scored(location: &str, score: f64, words: usize) -> ScoredDocument {
        ScoredDocument {
            document: doc(location, words),
            score,
            rationale: String::new(),
        }
    }

    #[test]
    fn ties_keep_input_order() {
        let context = ResearchContext::assemble(
            vec![
                scored("a", 0.5, 10),
                scored("b", 0.9, 10),
                scored("c", 0.5, 10),
                scored("d", 0.5, 10),
            ],
            10,
            1_000,
        );
        assert_eq!(context.locations(), vec!["b", "a", "c", "d"]);
        let ranks: Vec<usize> = context.sources().iter().map(RankedSource::rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn word_budget_stops_at_first_overflow() {
        let context = ResearchContext::assemble(
            vec![
                scored("big", 0.9, 80),
                scored("mid", 0.8, 30),
                scored("small", 0.7, 5),
            ],
            5,
            100,
        );
        assert_eq!(context.locations(), vec!["big"]);
    }

    #[test]
    fn best_document_is_admitted_even_over_budget() {
        let context = ResearchContext::assemble(vec![scored("huge", 0.4, 500)], 5, 100);
        assert_eq!(context.len(), 1);
        assert_eq!(context.get(1).map(RankedSource::source), Some("huge"));
        assert!(context.get(0).is_none());
        assert!(context.get(2).is_none());
    }

    /// Rejects scoring for documents whose content mentions `marker`.
    struct FailsOn {
        marker: &'static str,
    }

    #[async_trait]
    impl ReasoningCapability for FailsOn {
        fn name(&self) -> &str {
            "fails-on"
        }

        async fn invoke(
            &self,
            request: &ReasoningRequest,
        ) -> Result<ReasoningOutput, CapabilityError> {
            if request.input_text("document_content").contains(self.marker) {
                return Err(CapabilityError::Timeout);
            }
            OfflineCapability::new().invoke(request).await
        }
    }

    fn ranker(marker: &'static str) -> RelevanceRanker {
        RelevanceRanker::new(
            Arc::new(FailsOn { marker }),
            RankingConfig::default(),
            RetryPolicy::none(),
        )
    }

    fn page(location: &str, body: &str) -> Document {
        Document::from_parts(location, None, Vec::new(), body)
    }

    #[tokio::test]
    async fn failed_scoring_drops_only_that_document() {
        let documents = [
            page("https://a.test/", "Acme Corp sells anvils."),
            page("https://b.test/", "Acme Corp sells rockets."),
        ];
        let (context, degradations) = ranker("rockets")
            .rank_detailed("What does Acme sell?", &documents)
            .await;

        assert_eq!(context.locations(), vec!["https://a.test/"]);
        assert_eq!(degradations.len(), 1);
        match &degradations[0] {
            Degradation::RankingFailure { source, error } => {
                assert_eq!(source, "https://b.test/");
                assert_eq!(error, &CapabilityError::Timeout);
            }
            other => panic!("expected a ranking failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_scoring_failures_leave_an_empty_context() {
        let documents = [
            page("https://a.test/", "Acme Corp sells anvils."),
            page("https://b.test/", "Acme Corp sells rockets."),
        ];
        let (context, degradations) = ranker("Acme")
            .rank_detailed("What does Acme sell?", &documents)
            .await;

        assert!(context.is_empty());
        assert_eq!(degradations.len(), 2);
        assert!(degradations.iter().all(|d| d.kind() == "ranking"));
    }
}
