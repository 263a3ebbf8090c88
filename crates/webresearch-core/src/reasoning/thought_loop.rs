use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{
    Draft, EvidenceTrace, LoopAction, LoopState, LoopStep, LoopTrace, ReasoningFailure,
    describe_sources,
};
use crate::capability::{
    DynCapability, ReasoningOutput, ReasoningRequest, RetryPolicy, invoke_with_retry, signature,
};
use crate::config::ReasoningConfig;
use crate::rank::ResearchContext;
use crate::text::{sentences, truncate_chars};

const STEP_INSTRUCTION: &str = "You research a question by reading ranked sources one at a time. \
Think about what is still unknown, then choose exactly one action: `inspect_source` with the rank \
of a source to read as action_input, or `finish` with the complete answer as action_input. \
Finish once the observations answer the question.";

const FORCED_COMPOSE_INSTRUCTION: &str = "The research loop ran out of steps. Compose the best \
answer to the question using only the observations collected so far, and list the key findings.";

const FINDINGS_INSTRUCTION: &str = "List the key findings that support the answer, using only \
facts stated in the observations.";

const MAX_FALLBACK_FINDINGS: usize = 3;

/// Thought/action/observation loop bounded by `max_loop_iterations`.
pub struct LoopReasoner {
    capability: DynCapability,
    retry: RetryPolicy,
    max_iterations: usize,
    observation_chars: usize,
}

impl LoopReasoner {
    pub fn new(capability: DynCapability, config: &ReasoningConfig) -> Self {
        Self {
            capability,
            retry: config.retry.clone(),
            max_iterations: config.max_loop_iterations.max(1),
            observation_chars: config.observation_chars,
        }
    }

    async fn call(
        &self,
        request: &ReasoningRequest,
        trace: &LoopTrace,
    ) -> Result<ReasoningOutput, ReasoningFailure> {
        invoke_with_retry(self.capability.as_ref(), request, &self.retry)
            .await
            .map_err(|error| {
                ReasoningFailure::new(
                    request.signature.clone(),
                    error,
                    EvidenceTrace::Loop(trace.clone()),
                )
            })
    }

    #[instrument(
        name = "reason.loop",
        skip_all,
        fields(sources = context.len(), max_iterations = self.max_iterations)
    )]
    pub async fn synthesize(
        &self,
        question: &str,
        context: &ResearchContext,
    ) -> Result<Draft, ReasoningFailure> {
        let mut trace = LoopTrace {
            max_iterations: self.max_iterations,
            ..LoopTrace::default()
        };
        let mut transcript = String::new();
        let mut observations: Vec<String> = Vec::new();

        for iteration in 1..=self.max_iterations {
            trace.states.push(LoopState::Thinking);
            let request = ReasoningRequest::new(signature::NEXT_STEP, STEP_INSTRUCTION)
                .input("question", question)
                .input("available_sources", describe_sources(context))
                .input("source_count", context.len())
                .input("inspected_ranks", json!(trace.inspected_ranks(context.len())))
                .input("transcript", transcript.as_str())
                .input("observations", observations.join("\n"))
                .input("iteration", iteration)
                .input("max_iterations", self.max_iterations)
                .output("thought", "your reasoning about what to do next")
                .output("action", "`inspect_source` or `finish`")
                .output("action_input", "source rank for inspect_source, full answer for finish");
            let output = self.call(&request, &trace).await?;

            let thought = output.text("thought").unwrap_or_default();
            let action = parse_action(&output);
            trace.states.push(LoopState::Acting);
            debug!(iteration, action = %describe_action(&action), "loop action selected");

            if let LoopAction::Finish { answer } = &action {
                if !answer.is_empty() {
                    let answer_text = answer.clone();
                    trace.states.push(LoopState::Done);
                    trace.steps.push(LoopStep {
                        iteration,
                        thought,
                        action,
                        observation: None,
                    });
                    info!(iterations = iteration, "loop finished");
                    let key_findings = self
                        .findings_for(question, &answer_text, &observations)
                        .await;
                    return Ok(Draft {
                        answer_text,
                        key_findings,
                        trace: EvidenceTrace::Loop(trace),
                    });
                }
            }

            let observation = self.observe(&action, context, &mut observations);
            trace.states.push(LoopState::Observing);
            transcript.push_str(&format!(
                "Thought {iteration}: {thought}\nAction {iteration}: {}\nObservation {iteration}: {observation}\n",
                describe_action(&action)
            ));
            trace.steps.push(LoopStep {
                iteration,
                thought,
                action,
                observation: Some(observation),
            });
        }

        trace.states.push(LoopState::Done);
        trace.cap_reached = true;
        warn!(
            max_iterations = self.max_iterations,
            observations = observations.len(),
            "loop hit its iteration cap without finish; composing from observations"
        );

        let request = ReasoningRequest::new(signature::COMPOSE_ANSWER, FORCED_COMPOSE_INSTRUCTION)
            .input("question", question)
            .input("question_analysis", "")
            .input("evidence_summary", observations.join("\n"))
            .output("answer", "the final answer text")
            .output("key_findings", "list of the most important findings");
        let output = self.call(&request, &trace).await?;

        let mut answer_text = output.text("answer").unwrap_or_default();
        if answer_text.is_empty() {
            answer_text = format!(
                "No answer could be composed within {} reasoning steps for: {}",
                self.max_iterations,
                question.trim()
            );
        }

        Ok(Draft {
            answer_text,
            key_findings: output.list("key_findings"),
            trace: EvidenceTrace::Loop(trace),
        })
    }

    /// Key findings behind an answer the model finished with directly.
    ///
    /// A failed extraction falls back to the answer's own sentences.
    async fn findings_for(
        &self,
        question: &str,
        answer: &str,
        observations: &[String],
    ) -> Vec<String> {
        let request = ReasoningRequest::new(signature::EXTRACT_FINDINGS, FINDINGS_INSTRUCTION)
            .input("question", question)
            .input("answer", answer)
            .input("observations", observations.join("\n"))
            .output("key_findings", "list of the most important findings");
        match invoke_with_retry(self.capability.as_ref(), &request, &self.retry).await {
            Ok(output) => {
                let findings = output.list("key_findings");
                if !findings.is_empty() {
                    return findings;
                }
            }
            Err(error) => {
                warn!(error = %error, "key findings extraction failed; using answer sentences");
            }
        }
        sentences(answer)
            .into_iter()
            .take(MAX_FALLBACK_FINDINGS)
            .collect()
    }

    /// Observation text for one action; records inspected sources in `observations`.
    fn observe(
        &self,
        action: &LoopAction,
        context: &ResearchContext,
        observations: &mut Vec<String>,
    ) -> String {
        match action {
            LoopAction::InspectSource { rank } => {
                let source = usize::try_from(*rank).ok().and_then(|rank| context.get(rank));
                match source {
                    Some(source) => {
                        let excerpt =
                            truncate_chars(source.document().body(), self.observation_chars);
                        observations.push(format!("[{}] {excerpt}", source.source()));
                        format!("{}: {excerpt}", source.document().label())
                    }
                    None => format!(
                        "source unavailable: rank {rank} is not in 1..={}",
                        context.len()
                    ),
                }
            }
            LoopAction::Finish { .. } => {
                "finish needs a non-empty answer; nothing observed".to_string()
            }
            LoopAction::Unrecognized { raw } => {
                format!("unknown action `{raw}`; nothing observed")
            }
        }
    }
}

/// Interpret `action`/`action_input`; accepts inline forms like `inspect_source(2)`.
fn parse_action(output: &ReasoningOutput) -> LoopAction {
    let raw = output.text("action").unwrap_or_default();
    let (name, inline) = match raw.split_once('(') {
        Some((name, rest)) => (name, Some(rest.trim_end_matches(')').trim())),
        None => (raw.as_str(), None),
    };

    match name.trim().to_ascii_lowercase().as_str() {
        "inspect_source" | "inspect" => {
            let rank = output
                .number("action_input")
                .ok()
                .or_else(|| inline.and_then(|value| value.parse::<f64>().ok()));
            match rank {
                Some(rank) if rank.fract() == 0.0 => LoopAction::InspectSource {
                    rank: rank as i64,
                },
                _ => LoopAction::Unrecognized { raw: raw.clone() },
            }
        }
        "finish" => {
            let answer = output
                .text("action_input")
                .ok()
                .filter(|answer| !answer.is_empty())
                .or_else(|| inline.map(str::to_string))
                .unwrap_or_default();
            LoopAction::Finish { answer }
        }
        _ => LoopAction::Unrecognized { raw: raw.clone() },
    }
}

fn describe_action(action: &LoopAction) -> String {
    match action {
        LoopAction::InspectSource { rank } => format!("inspect_source({rank})"),
        LoopAction::Finish { .. } => "finish".to_string(),
        LoopAction::Unrecognized { raw } => raw.clone(),
    }
}
