use tracing::{debug, info, instrument};

use super::{
    Draft, EvidenceTrace, LinearTrace, QuestionAnalysis, ReasoningFailure, SourceExtraction,
    describe_sources,
};
use crate::capability::{
    CapabilityError, DynCapability, ReasoningOutput, ReasoningRequest, RetryPolicy,
    invoke_with_retry, signature,
};
use crate::config::ReasoningConfig;
use crate::rank::ResearchContext;

const ANALYZE_INSTRUCTION: &str = "Analyze the research question. Identify its type, the key \
concepts, the depth of answer required and the sub-aspects an answer must cover, given the \
available sources.";

const EXTRACT_INSTRUCTION: &str = "Extract from the source only the information relevant to the \
analyzed question, then return the running summary extended with that information, tagged with \
the source.";

const COMPOSE_INSTRUCTION: &str = "Compose a comprehensive answer to the question from the \
evidence summary. Do not use knowledge outside the evidence. Also list the key findings.";

/// Analyze, synthesize per source, compose. Any failed stage ends the run.
pub struct LinearReasoner {
    capability: DynCapability,
    retry: RetryPolicy,
}

impl LinearReasoner {
    pub fn new(capability: DynCapability, config: &ReasoningConfig) -> Self {
        Self {
            capability,
            retry: config.retry.clone(),
        }
    }

    async fn call(
        &self,
        request: &ReasoningRequest,
        trace: &LinearTrace,
    ) -> Result<ReasoningOutput, ReasoningFailure> {
        invoke_with_retry(self.capability.as_ref(), request, &self.retry)
            .await
            .map_err(|error| {
                ReasoningFailure::new(
                    request.signature.clone(),
                    error,
                    EvidenceTrace::Linear(trace.clone()),
                )
            })
    }

    #[instrument(name = "reason.linear", skip_all, fields(sources = context.len()))]
    pub async fn synthesize(
        &self,
        question: &str,
        context: &ResearchContext,
    ) -> Result<Draft, ReasoningFailure> {
        let mut trace = LinearTrace::default();

        let analysis = self.analyze(question, context, &trace).await?;
        let analysis_json = serde_json::to_string(&analysis).unwrap_or_default();
        debug!(
            question_type = %analysis.question_type,
            concepts = analysis.key_concepts.len(),
            "question analyzed"
        );
        trace.analysis = Some(analysis);

        for source in context.sources() {
            let request = ReasoningRequest::new(signature::EXTRACT_EVIDENCE, EXTRACT_INSTRUCTION)
                .input("question", question)
                .input("question_analysis", analysis_json.as_str())
                .input("source", source.source())
                .input("source_content", source.document().body())
                .input("running_summary", trace.evidence_summary.as_str())
                .output("relevant_information", "facts from this source that bear on the question")
                .output("running_summary", "the previous summary extended with those facts");
            let output = self.call(&request, &trace).await?;

            let relevant = output.text("relevant_information").unwrap_or_default();
            let summary = output.text("running_summary").unwrap_or_default();
            trace.evidence_summary = if summary.is_empty() && !relevant.is_empty() {
                let mut extended = trace.evidence_summary.clone();
                if !extended.is_empty() {
                    extended.push('\n');
                }
                extended.push_str(&format!("[{}] {relevant}", source.source()));
                extended
            } else if summary.is_empty() {
                trace.evidence_summary.clone()
            } else {
                summary
            };
            debug!(rank = source.rank(), chars = relevant.len(), "evidence extracted");
            trace.extractions.push(SourceExtraction {
                rank: source.rank(),
                source: source.source().to_string(),
                relevant_information: relevant,
            });
        }

        let request = ReasoningRequest::new(signature::COMPOSE_ANSWER, COMPOSE_INSTRUCTION)
            .input("question", question)
            .input("question_analysis", analysis_json.as_str())
            .input("evidence_summary", trace.evidence_summary.as_str())
            .output("answer", "the final answer text")
            .output("key_findings", "list of the most important findings");
        let output = self.call(&request, &trace).await?;

        let answer_text = output.text("answer").unwrap_or_default();
        if answer_text.is_empty() {
            return Err(ReasoningFailure::new(
                signature::COMPOSE_ANSWER,
                CapabilityError::MalformedOutput("empty answer".into()),
                EvidenceTrace::Linear(trace),
            ));
        }

        info!(
            findings = output.list("key_findings").len(),
            "linear synthesis complete"
        );
        Ok(Draft {
            answer_text,
            key_findings: output.list("key_findings"),
            trace: EvidenceTrace::Linear(trace),
        })
    }

    async fn analyze(
        &self,
        question: &str,
        context: &ResearchContext,
        trace: &LinearTrace,
    ) -> Result<QuestionAnalysis, ReasoningFailure> {
        let request = ReasoningRequest::new(signature::ANALYZE_QUESTION, ANALYZE_INSTRUCTION)
            .input("question", question)
            .input("available_sources", describe_sources(context))
            .output("question_type", "factual, descriptive, explanatory, causal or evaluative")
            .output("key_concepts", "list of the main concepts")
            .output("required_depth", "shallow, moderate or deep")
            .output("sub_aspects", "list of sub-questions the answer must cover");
        let output = self.call(&request, trace).await?;

        Ok(QuestionAnalysis {
            question_type: output.text("question_type").unwrap_or_default(),
            key_concepts: output.list("key_concepts"),
            required_depth: output.text("required_depth").unwrap_or_default(),
            sub_aspects: output.list("sub_aspects"),
        })
    }
}
