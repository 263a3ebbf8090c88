use std::collections::HashSet;

use tracing::debug;

use crate::answer::Degradation;
use crate::capability::{
    DynCapability, ReasoningRequest, RetryPolicy, invoke_with_retry, signature,
};
use crate::config::FollowUpConfig;
use crate::rank::ResearchContext;
use crate::text::normalized_key;

pub struct FollowUpGenerator {
    capability: DynCapability,
    settings: FollowUpConfig,
    retry: RetryPolicy,
}

impl FollowUpGenerator {
    pub fn new(capability: DynCapability, settings: FollowUpConfig, retry: RetryPolicy) -> Self {
        Self {
            capability,
            settings,
            retry,
        }
    }

    /// Related questions; empty when generation fails.
    pub async fn generate(
        &self,
        question: &str,
        answer_text: &str,
        context: &ResearchContext,
    ) -> Vec<String> {
        self.generate_detailed(question, answer_text, context).await.0
    }

    pub async fn generate_detailed(
        &self,
        question: &str,
        answer_text: &str,
        context: &ResearchContext,
    ) -> (Vec<String>, Option<Degradation>) {
        let titles: Vec<String> = context
            .sources()
            .iter()
            .map(|source| source.document().label().to_string())
            .collect();
        let instruction = format!(
            "Suggest up to {} follow-up research questions that explore what the answer leaves \
             open. Do not repeat the original question.",
            self.settings.max_questions
        );
        let request = ReasoningRequest::new(signature::FOLLOW_UP_QUESTIONS, instruction)
            .input("original_question", question)
            .input("research_answer", answer_text)
            .input("source_titles", titles)
            .output("follow_up_questions", "list of questions");

        match invoke_with_retry(self.capability.as_ref(), &request, &self.retry).await {
            Ok(output) => {
                let questions = normalize_questions(
                    question,
                    output.list("follow_up_questions"),
                    self.settings.max_questions,
                );
                debug!(count = questions.len(), "follow-up questions generated");
                (questions, None)
            }
            Err(error) => (
                Vec::new(),
                Some(Degradation::FollowUpFailure { error }.recorded()),
            ),
        }
    }
}

/// Deduplicate by normalized text, drop restatements of `question`, cap at `max`.
fn normalize_questions(question: &str, candidates: Vec<String>, max: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(normalized_key(question));
    candidates
        .into_iter()
        .filter(|candidate| {
            let key = normalized_key(candidate);
            !key.is_empty() && seen.insert(key)
        })
        .take(max)
        .collect()
}
