use tracing::debug;

use crate::answer::Degradation;
use crate::capability::{
    CapabilityError, DynCapability, ReasoningRequest, RetryPolicy, invoke_with_retry, signature,
};
use crate::config::ConfidenceConfig;
use crate::rank::{RankedSource, ResearchContext};
use crate::text::{content_terms, truncate_chars};

const COVERAGE_WEIGHT: f64 = 0.6;
const CORROBORATION_WEIGHT: f64 = 0.4;
/// Share of the answer's terms a source must contain to count as reflected.
const REFLECTION_THRESHOLD: f64 = 0.3;
const EVIDENCE_EXCERPT_CHARS: usize = 1_500;

const ASSESS_INSTRUCTION: &str = "Assess how well the evidence supports the answer. Return a \
confidence between 0.0 (unsupported) and 1.0 (fully supported).";

/// Blends source coverage and corroboration with a self-assessed confidence.
pub struct ConfidenceScorer {
    capability: DynCapability,
    settings: ConfidenceConfig,
    retry: RetryPolicy,
}

impl ConfidenceScorer {
    pub fn new(capability: DynCapability, settings: ConfidenceConfig, retry: RetryPolicy) -> Self {
        Self {
            capability,
            settings,
            retry,
        }
    }

    pub async fn score(&self, answer_text: &str, context: &ResearchContext) -> f64 {
        self.score_detailed(answer_text, context).await.0
    }

    /// Score, reporting a degradation when the self-assessment call failed.
    pub async fn score_detailed(
        &self,
        answer_text: &str,
        context: &ResearchContext,
    ) -> (f64, Option<Degradation>) {
        if context.is_empty() {
            return (0.0, None);
        }

        let heuristic = self.heuristic(answer_text, context);
        match self.self_assessment(answer_text, context).await {
            Ok(assessed) => {
                let weight = self.settings.self_assessment_weight;
                let blended = ((1.0 - weight) * heuristic + weight * assessed).clamp(0.0, 1.0);
                debug!(heuristic, assessed, blended, "confidence scored");
                (blended, None)
            }
            Err(error) => (
                heuristic,
                Some(Degradation::ScoringDegraded { error }.recorded()),
            ),
        }
    }

    /// Coverage and corroboration only, no capability call.
    pub fn heuristic(&self, answer_text: &str, context: &ResearchContext) -> f64 {
        if context.is_empty() {
            return 0.0;
        }
        let reflected = context
            .sources()
            .iter()
            .filter(|source| is_reflected(answer_text, source))
            .count();
        let coverage = reflected as f64 / context.len() as f64;

        let cap = self.settings.corroboration_cap.max(1);
        let corroboration = context.len().min(cap) as f64 / cap as f64;

        (COVERAGE_WEIGHT * coverage + CORROBORATION_WEIGHT * corroboration).clamp(0.0, 1.0)
    }

    async fn self_assessment(
        &self,
        answer_text: &str,
        context: &ResearchContext,
    ) -> Result<f64, CapabilityError> {
        let evidence = context
            .sources()
            .iter()
            .map(|source| {
                format!(
                    "[{}] {}",
                    source.source(),
                    truncate_chars(source.document().body(), EVIDENCE_EXCERPT_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let request = ReasoningRequest::new(signature::ASSESS_CONFIDENCE, ASSESS_INSTRUCTION)
            .input("answer", answer_text)
            .input("evidence", evidence)
            .output("confidence", "number between 0.0 and 1.0");

        let output = invoke_with_retry(self.capability.as_ref(), &request, &self.retry).await?;
        Ok(output.number("confidence")?.clamp(0.0, 1.0))
    }
}

/// Whether the answer explicitly reflects the source's content.
fn is_reflected(answer_text: &str, source: &RankedSource) -> bool {
    let answer_lower = answer_text.to_lowercase();
    if answer_text.contains(source.source()) {
        return true;
    }
    if let Some(title) = source.document().title() {
        if !title.is_empty() && answer_lower.contains(&title.to_lowercase()) {
            return true;
        }
    }

    let answer_terms = content_terms(answer_text);
    if answer_terms.is_empty() {
        return false;
    }
    let source_terms = content_terms(source.document().body());
    let shared = answer_terms.intersection(&source_terms).count();
    shared as f64 / answer_terms.len() as f64 >= REFLECTION_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::Document;
    use crate::capability::OfflineCapability;
    use crate::rank::ScoredDocument;
    use std::sync::Arc;

    fn context(bodies: &[&str]) -> ResearchContext {
        let scored = bodies
            .iter()
            .enumerate()
            .map(|(idx, body)| ScoredDocument {
                document: Document::from_parts(
                    format!("https://s{idx}.test/"),
                    None,
                    Vec::new(),
                    body,
                ),
                score: 0.5,
                rationale: String::new(),
            })
            .collect();
        ResearchContext::assemble(scored, 10, 100_000)
    }

    fn scorer() -> ConfidenceScorer {
        ConfidenceScorer::new(
            Arc::new(OfflineCapability::new()),
            ConfidenceConfig::default(),
            RetryPolicy::none(),
        )
    }

    #[tokio::test]
    async fn empty_context_scores_zero() {
        assert_eq!(scorer().score("anything", &ResearchContext::empty()).await, 0.0);
    }

    #[tokio::test]
    async fn more_corroborating_sources_never_lower_confidence() {
        let body = "Acme Corp sells anvils and rockets to coyotes.";
        let answer = "Acme Corp sells anvils and rockets.";
        let one = scorer().score(answer, &context(&[body])).await;
        let three = scorer().score(answer, &context(&[body, body, body])).await;
        assert!(three >= one, "{three} < {one}");
        assert!((0.0..=1.0).contains(&one));
    }

    struct Unavailable;

    #[async_trait::async_trait]
    impl crate::capability::ReasoningCapability for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }

        async fn invoke(
            &self,
            _request: &ReasoningRequest,
        ) -> Result<crate::capability::ReasoningOutput, CapabilityError> {
            Err(CapabilityError::Timeout)
        }
    }

    #[tokio::test]
    async fn failed_self_assessment_falls_back_to_heuristic() {
        let scorer = ConfidenceScorer::new(
            Arc::new(Unavailable),
            ConfidenceConfig::default(),
            RetryPolicy::none(),
        );
        let context = context(&["Acme Corp sells anvils."]);
        let answer = "Acme Corp sells anvils.";

        let (confidence, degradation) = scorer.score_detailed(answer, &context).await;
        assert_eq!(confidence, scorer.heuristic(answer, &context));
        match degradation {
            Some(Degradation::ScoringDegraded { error }) => {
                assert_eq!(error, CapabilityError::Timeout)
            }
            other => panic!("expected a scoring degradation, got {other:?}"),
        }
    }

    #[test]
    fn unreflected_sources_lower_coverage() {
        let scorer = scorer();
        let answer = "Acme Corp sells anvils.";
        let covered = scorer.heuristic(answer, &context(&["Acme Corp sells anvils."]));
        let uncovered = scorer.heuristic(answer, &context(&["Weather is rainy today."]));
        assert!(covered > uncovered);
    }
}
