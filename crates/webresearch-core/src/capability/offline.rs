use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::signature;
use super::{CapabilityError, ReasoningCapability, ReasoningOutput, ReasoningRequest};
use crate::text::{content_terms, sentences, truncate_chars};

const MAX_EVIDENCE_SENTENCES: usize = 3;

/// Deterministic, network-free capability built on lexical overlap.
///
/// Answers every signature the pipeline issues. Useful for offline runs and
/// reproducible tests; it does not understand anything.
#[derive(Debug, Clone, Default)]
pub struct OfflineCapability;

impl OfflineCapability {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReasoningCapability for OfflineCapability {
    fn name(&self) -> &str {
        "offline"
    }

    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, CapabilityError> {
        match request.signature.as_str() {
            signature::SCORE_RELEVANCE => Ok(score_relevance(request)),
            signature::ANALYZE_QUESTION => Ok(analyze_question(request)),
            signature::EXTRACT_EVIDENCE => Ok(extract_evidence(request)),
            signature::COMPOSE_ANSWER => Ok(compose_answer(request)),
            signature::NEXT_STEP => Ok(next_step(request)),
            signature::EXTRACT_FINDINGS => Ok(extract_findings(request)),
            signature::ASSESS_CONFIDENCE => Ok(assess_confidence(request)),
            signature::FOLLOW_UP_QUESTIONS => Ok(follow_up_questions(request)),
            other => Err(CapabilityError::Rejected(format!(
                "offline capability has no handler for `{other}`"
            ))),
        }
    }
}

fn overlap(question: &BTreeSet<String>, text: &BTreeSet<String>) -> (usize, Vec<String>) {
    let matched: Vec<String> = question.intersection(text).cloned().collect();
    (matched.len(), matched)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn score_relevance(request: &ReasoningRequest) -> ReasoningOutput {
    let question = content_terms(&request.input_text("question"));
    let document = content_terms(&format!(
        "{} {} {}",
        request.input_text("document_title"),
        request.input_text("document_headings"),
        request.input_text("document_content"),
    ));
    let (hits, matched) = overlap(&question, &document);
    let fraction = if question.is_empty() {
        0.0
    } else {
        hits as f64 / question.len() as f64
    };

    ReasoningOutput::new()
        .with("relevance_score", round2(0.1 + 0.9 * fraction))
        .with(
            "rationale",
            format!(
                "matched {hits} of {} question terms{}",
                question.len(),
                if matched.is_empty() {
                    String::new()
                } else {
                    format!(": {}", matched.join(", "))
                }
            ),
        )
}

fn analyze_question(request: &ReasoningRequest) -> ReasoningOutput {
    let question = request.input_text("question");
    let first_word = question
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    let question_type = match first_word.as_str() {
        "what" | "which" | "who" => "descriptive",
        "how" => "explanatory",
        "why" => "causal",
        "compare" | "should" => "evaluative",
        _ => "exploratory",
    };
    let concepts: Vec<String> = content_terms(&question).into_iter().collect();
    let depth = if concepts.len() > 6 { "deep" } else { "moderate" };
    let aspects: Vec<String> = concepts
        .iter()
        .map(|concept| format!("What the sources state about {concept}"))
        .collect();

    ReasoningOutput::new()
        .with("question_type", question_type)
        .with("key_concepts", concepts)
        .with("required_depth", depth)
        .with("sub_aspects", aspects)
}

/// Sentences of `text` sharing at least one term with `terms`, in order.
fn matching_sentences(text: &str, terms: &BTreeSet<String>, limit: usize) -> Vec<String> {
    sentences(text)
        .into_iter()
        .filter(|sentence| !content_terms(sentence).is_disjoint(terms))
        .take(limit)
        .collect()
}

fn extract_evidence(request: &ReasoningRequest) -> ReasoningOutput {
    let terms = content_terms(&request.input_text("question"));
    let found = matching_sentences(
        &request.input_text("source_content"),
        &terms,
        MAX_EVIDENCE_SENTENCES,
    );
    let relevant = found.join(" ");

    let mut summary = request.input_text("running_summary");
    if !relevant.is_empty() {
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str(&format!("[{}] {}", request.input_text("source"), relevant));
    }

    ReasoningOutput::new()
        .with("relevant_information", relevant)
        .with("running_summary", summary)
}

fn strip_source_tags(line: &str) -> &str {
    match line.strip_prefix('[').and_then(|rest| rest.split_once("] ")) {
        Some((_, text)) => text,
        None => line,
    }
}

fn compose_answer(request: &ReasoningRequest) -> ReasoningOutput {
    let question = request.input_text("question");
    let terms = content_terms(&question);
    let evidence: String = request
        .input_text("evidence_summary")
        .lines()
        .map(strip_source_tags)
        .collect::<Vec<_>>()
        .join(" ");
    let findings = matching_sentences(&evidence, &terms, MAX_EVIDENCE_SENTENCES);

    let answer = if findings.is_empty() {
        format!("The available sources do not directly address: {}", question.trim())
    } else {
        findings.join(" ")
    };

    ReasoningOutput::new()
        .with("answer", answer)
        .with("key_findings", findings)
}

fn inspected_ranks(request: &ReasoningRequest) -> BTreeSet<u64> {
    match request.input_value("inspected_ranks") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_u64).collect(),
        _ => BTreeSet::new(),
    }
}

fn next_step(request: &ReasoningRequest) -> ReasoningOutput {
    let source_count = request
        .input_value("source_count")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let inspected = inspected_ranks(request);

    match (1..=source_count).find(|rank| !inspected.contains(rank)) {
        Some(rank) => ReasoningOutput::new()
            .with(
                "thought",
                format!("Source {rank} has not been read yet; inspect it before answering."),
            )
            .with("action", "inspect_source")
            .with("action_input", json!(rank)),
        None => {
            let composed = compose_answer(
                &ReasoningRequest::new(signature::COMPOSE_ANSWER, "")
                    .input("question", request.input_text("question"))
                    .input("evidence_summary", request.input_text("observations")),
            );
            let answer = composed.text("answer").unwrap_or_default();
            ReasoningOutput::new()
                .with("thought", "Every source has been inspected; compose the answer.")
                .with("action", "finish")
                .with("action_input", answer)
        }
    }
}

fn extract_findings(request: &ReasoningRequest) -> ReasoningOutput {
    let mut terms = content_terms(&request.input_text("question"));
    terms.extend(content_terms(&request.input_text("answer")));
    let evidence: String = request
        .input_text("observations")
        .lines()
        .map(strip_source_tags)
        .collect::<Vec<_>>()
        .join(" ");
    ReasoningOutput::new().with(
        "key_findings",
        matching_sentences(&evidence, &terms, MAX_EVIDENCE_SENTENCES),
    )
}

fn assess_confidence(request: &ReasoningRequest) -> ReasoningOutput {
    let answer = content_terms(&request.input_text("answer"));
    let evidence = content_terms(&request.input_text("evidence"));
    let (hits, _) = overlap(&answer, &evidence);
    let fraction = if answer.is_empty() {
        0.0
    } else {
        hits as f64 / answer.len() as f64
    };
    ReasoningOutput::new().with("confidence", round2(0.3 + 0.6 * fraction))
}

fn follow_up_questions(request: &ReasoningRequest) -> ReasoningOutput {
    let answer = request.input_text("research_answer");
    let mut concepts: Vec<String> = content_terms(&request.input_text("original_question"))
        .into_iter()
        .collect();
    let extra: Vec<String> = content_terms(truncate_chars(&answer, 400))
        .into_iter()
        .filter(|term| !concepts.contains(term))
        .take(3)
        .collect();
    concepts.extend(extra);

    let templates = [
        "What are the main limitations of {}?",
        "How has {} changed recently?",
        "Which independent sources corroborate the claims about {}?",
    ];
    let questions: Vec<String> = concepts
        .iter()
        .zip(templates.iter())
        .map(|(concept, template)| template.replace("{}", concept))
        .collect();

    ReasoningOutput::new().with("follow_up_questions", questions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relevance_rewards_term_overlap() {
        let capability = OfflineCapability::new();
        let relevant = ReasoningRequest::new(signature::SCORE_RELEVANCE, "")
            .input("question", "What does Acme Corp sell?")
            .input("document_title", "Acme Corp")
            .input("document_content", "Acme Corp sells anvils and rockets.");
        let unrelated = ReasoningRequest::new(signature::SCORE_RELEVANCE, "")
            .input("question", "What does Acme Corp sell?")
            .input("document_title", "Weather")
            .input("document_content", "Rain expected tomorrow.");

        let high = capability.invoke(&relevant).await.unwrap();
        let low = capability.invoke(&unrelated).await.unwrap();
        assert!(high.number("relevance_score").unwrap() > low.number("relevance_score").unwrap());
        assert!((low.number("relevance_score").unwrap() - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn next_step_inspects_then_finishes() {
        let capability = OfflineCapability::new();
        let first = ReasoningRequest::new(signature::NEXT_STEP, "")
            .input("question", "What does Acme sell?")
            .input("source_count", 2)
            .input("inspected_ranks", json!([1]));
        let output = capability.invoke(&first).await.unwrap();
        assert_eq!(output.text("action").unwrap(), "inspect_source");
        assert_eq!(output.number("action_input").unwrap(), 2.0);

        let done = ReasoningRequest::new(signature::NEXT_STEP, "")
            .input("question", "What does Acme sell?")
            .input("source_count", 2)
            .input("inspected_ranks", json!([1, 2]))
            .input(
                "transcript",
                "Thought 1: read it\nAction 1: inspect_source(1)\n\
                 Observation 1: https://a.test/: Acme sells anvils to coyotes.\n",
            )
            .input("observations", "[https://a.test/] Acme sells anvils to coyotes.");
        let output = capability.invoke(&done).await.unwrap();
        assert_eq!(output.text("action").unwrap(), "finish");
        let answer = output.text("action_input").unwrap();
        assert!(answer.contains("anvils"));
        assert!(!answer.contains("Action"));
        assert!(!answer.contains("Observation"));
        assert!(!answer.contains("https://a.test/"));
    }

    #[tokio::test]
    async fn findings_come_from_observations() {
        let request = ReasoningRequest::new(signature::EXTRACT_FINDINGS, "")
            .input("question", "What does Acme sell?")
            .input("answer", "Acme sells anvils.")
            .input(
                "observations",
                "[https://a.test/] Acme sells anvils. The weather was mild.",
            );
        let output = OfflineCapability::new().invoke(&request).await.unwrap();
        assert_eq!(output.list("key_findings"), vec!["Acme sells anvils."]);
    }

    #[tokio::test]
    async fn unknown_signature_is_rejected() {
        let err = OfflineCapability::new()
            .invoke(&ReasoningRequest::new("translate", ""))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
