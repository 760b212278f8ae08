//! Summarization stage with a truncation fallback.
//!
//! The configured LLM turns the extracted text into a short, searchable
//! summary. Provider failures never fail the job: the stage falls back
//! to a word-boundary truncation and marks the summary as such.

use std::sync::Arc;

use crate::providers::{CompletionOptions, LlmProvider};

use super::{EnrichedEvent, Summary};

const SUMMARY_MAX_TOKENS: u32 = 200;
const SUMMARY_TEMPERATURE: f32 = 0.3;
const FALLBACK_MAX_CHARS: usize = 200;

/// Build the summarization prompt for one enriched event.
pub fn summarization_prompt(enriched: &EnrichedEvent) -> String {
    let entities = &enriched.entities;
    let mut prompt = String::with_capacity(enriched.extracted_text.len() + 512);
    prompt.push_str(
        "Summarize the following team event in at most 100 words. \
         Keep it searchable: preserve who was involved, what happened, \
         and why, and keep technical terms verbatim.\n\n",
    );
    prompt.push_str(&format!("Source: {}\n", enriched.event.source));
    prompt.push_str(&format!("Event type: {}\n", enriched.event.event_type));
    if !entities.users.is_empty() {
        prompt.push_str(&format!("Users: {}\n", entities.users.join(", ")));
    }
    if !entities.keywords.is_empty() {
        prompt.push_str(&format!("Keywords: {}\n", entities.keywords.join(", ")));
    }
    prompt.push_str("\nContent:\n");
    prompt.push_str(&enriched.extracted_text);
    prompt.push_str("\n\nSummary:");
    prompt
}

/// Summarize an enriched event, falling back to truncation on any
/// provider error.
pub async fn summarize(provider: &Arc<dyn LlmProvider>, enriched: &EnrichedEvent) -> Summary {
    let prompt = summarization_prompt(enriched);
    let opts = CompletionOptions {
        max_tokens: SUMMARY_MAX_TOKENS,
        temperature: SUMMARY_TEMPERATURE,
        stop_sequences: Vec::new(),
    };

    match provider.complete(&prompt, &opts).await {
        Ok(completion) if !completion.text.trim().is_empty() => Summary {
            text: completion.text.trim().to_string(),
            tokens_used: completion.usage.completion_tokens,
            fallback: false,
        },
        Ok(_) => {
            tracing::warn!(event_id = %enriched.event.id, "empty summary, using truncation fallback");
            fallback_summary(&enriched.extracted_text)
        }
        Err(e) => {
            tracing::warn!(
                event_id = %enriched.event.id,
                error = %e,
                "summarization failed, using truncation fallback"
            );
            fallback_summary(&enriched.extracted_text)
        }
    }
}

fn fallback_summary(text: &str) -> Summary {
    Summary {
        text: truncate_at_word_boundary(text, FALLBACK_MAX_CHARS),
        tokens_used: 0,
        fallback: true,
    }
}

/// First `max_chars` characters cut back to a word boundary, with an
/// ellipsis. Text that already fits is returned unchanged.
pub fn truncate_at_word_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let prefix: String = text.chars().take(max_chars).collect();
    let cut = match prefix.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => &prefix[..pos],
        _ => &prefix,
    };
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{NewRawEvent, RawEvent};
    use crate::pipeline::enrich;
    use crate::providers::MockProvider;
    use crate::types::{EventId, ProcessingStatus};
    use chrono::Utc;
    use serde_json::json;

    fn enriched_with_text(text: &str) -> EnrichedEvent {
        let draft = NewRawEvent::new("slack", "message", json!({"text": text}));
        let event = RawEvent {
            id: EventId::new(),
            source: draft.source,
            event_type: draft.event_type,
            external_id: None,
            payload: draft.payload,
            metadata: draft.metadata,
            ingested_at: Utc::now(),
            processed_at: None,
            status: ProcessingStatus::Pending,
        };
        enrich::enrich(&event)
    }

    #[test]
    fn prompt_carries_source_and_content() {
        let enriched = enriched_with_text("JWT over OAuth2 for simplicity");
        let prompt = summarization_prompt(&enriched);
        assert!(prompt.contains("Source: slack"));
        assert!(prompt.contains("JWT over OAuth2 for simplicity"));
        assert!(prompt.contains("at most 100 words"));
    }

    #[tokio::test]
    async fn uses_provider_summary() {
        let provider: Arc<dyn LlmProvider> = Arc::new(
            MockProvider::new(8).with_completions(vec!["Team picked JWT for API auth."]),
        );
        let enriched = enriched_with_text("long discussion about JWT and OAuth2");

        let summary = summarize(&provider, &enriched).await;
        assert_eq!(summary.text, "Team picked JWT for API auth.");
        assert!(!summary.fallback);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_truncation() {
        let provider: Arc<dyn LlmProvider> =
            Arc::new(MockProvider::new(8).failing_completions());
        let text = format!(
            "{} trailing words beyond the cut",
            "word ".repeat(50)
        );
        let enriched = enriched_with_text(&text);

        let summary = summarize(&provider, &enriched).await;
        assert!(summary.fallback);
        assert!(summary.text.ends_with("..."));
        assert!(summary.text.chars().count() <= 203);
        assert_eq!(summary.text, truncate_at_word_boundary(&text, 200));
    }

    #[test]
    fn truncation_respects_word_boundary() {
        let text = "alpha beta gamma delta";
        assert_eq!(truncate_at_word_boundary(text, 100), text);

        let long = "authentication ".repeat(20); // 300 chars
        let cut = truncate_at_word_boundary(&long, 200);
        assert!(cut.ends_with("..."));
        // No mid-word cut: stripping the ellipsis leaves whole words.
        let stripped = cut.trim_end_matches("...");
        assert!(stripped.split_whitespace().all(|w| w == "authentication"));
    }

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_at_word_boundary("short", 200), "short");
    }
}
