//! Enrichment stage: extract text, entities, and an importance score
//! from a raw event. Pure with respect to its input.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::event_log::RawEvent;

use super::{EnrichedEvent, Entities};

const BASE_IMPORTANCE: f32 = 0.5;
const KEYWORD_MIN_LEN: usize = 4;
const KEYWORD_MIN_COUNT: usize = 2;
const KEYWORD_LIMIT: usize = 10;

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@([A-Z0-9]+)>").unwrap())
}

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s>|]+").unwrap())
}

/// Run the enrichment stage over one raw event.
pub fn enrich(event: &RawEvent) -> EnrichedEvent {
    let extracted_text = extract_text(event);
    let entities = extract_entities(event, &extracted_text);
    let importance = score_importance(event, &extracted_text, &entities);

    EnrichedEvent {
        event: event.clone(),
        extracted_text,
        entities,
        importance,
    }
}

/// Source-specific text extraction; unknown sources get a deterministic
/// serialization of the payload.
pub fn extract_text(event: &RawEvent) -> String {
    let payload = &event.payload;
    match event.source.as_str() {
        "slack" => payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        "jira" => {
            let title = payload.get("title").and_then(|v| v.as_str()).unwrap_or_default();
            let description = payload
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            join_nonempty(title, description)
        }
        "git" => {
            let message = payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let body = payload.get("body").and_then(|v| v.as_str()).unwrap_or_default();
            join_nonempty(message, body)
        }
        _ => deterministic_json(payload),
    }
}

fn join_nonempty(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a}\n{b}"),
    }
}

/// Serialize a JSON value with object keys sorted, so equal payloads
/// always extract to equal text.
pub fn deterministic_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

fn extract_entities(event: &RawEvent, text: &str) -> Entities {
    let mut users = Vec::new();
    if let Some(user) = event.payload.get("user").and_then(|v| v.as_str()) {
        users.push(user.to_string());
    }
    if let Some(list) = event.payload.get("users").and_then(|v| v.as_array()) {
        for user in list.iter().filter_map(|v| v.as_str()) {
            if !users.iter().any(|u| u == user) {
                users.push(user.to_string());
            }
        }
    }

    let mentions: Vec<String> = mention_regex()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();

    let links: Vec<String> = link_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();

    Entities {
        users,
        mentions,
        links,
        keywords: extract_keywords(text),
    }
}

/// Lowercased alphanumeric tokens of length ≥ 4 occurring ≥ 2 times;
/// top 10 by frequency, ties broken by first occurrence.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut counts: Vec<(String, usize, usize)> = Vec::new(); // (token, count, first_pos)

    for (position, token) in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .enumerate()
    {
        let token = token.to_lowercase();
        if token.chars().count() < KEYWORD_MIN_LEN {
            continue;
        }
        if let Some(entry) = counts.iter_mut().find(|(t, _, _)| *t == token) {
            entry.1 += 1;
        } else {
            counts.push((token, 1, position));
        }
    }

    counts.retain(|(_, count, _)| *count >= KEYWORD_MIN_COUNT);
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
    counts.truncate(KEYWORD_LIMIT);
    counts.into_iter().map(|(token, _, _)| token).collect()
}

/// Importance heuristic: 0.5 base adjusted by signals, clamped to [0, 1].
pub fn score_importance(event: &RawEvent, text: &str, entities: &Entities) -> f32 {
    let payload = &event.payload;
    let mut importance = BASE_IMPORTANCE;

    if event.source == "slack" {
        if payload.get("thread_ts").and_then(|v| v.as_str()).is_some() {
            importance -= 0.1;
        }
        let has_reactions = payload
            .get("reactions")
            .and_then(|v| v.as_array())
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if has_reactions {
            importance += 0.2;
        }
    }

    if event.source == "jira" {
        let priority = payload.get("priority").and_then(|v| v.as_str()).unwrap_or("");
        if priority == "High" || priority == "Critical" {
            importance += 0.3;
        }
    }

    if !entities.links.is_empty() {
        importance += 0.1;
    }
    if !entities.mentions.is_empty() {
        importance += 0.15;
    }
    if text.chars().count() > 200 {
        importance += 0.1;
    }

    importance.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::NewRawEvent;
    use crate::types::{EventId, ProcessingStatus};
    use chrono::Utc;
    use serde_json::json;

    fn raw_event(source: &str, payload: Value) -> RawEvent {
        let draft = NewRawEvent::new(source, "message", payload);
        RawEvent {
            id: EventId::new(),
            source: draft.source,
            event_type: draft.event_type,
            external_id: None,
            payload: draft.payload,
            metadata: draft.metadata,
            ingested_at: Utc::now(),
            processed_at: None,
            status: ProcessingStatus::Pending,
        }
    }

    #[test]
    fn extracts_per_source_text() {
        let slack = raw_event("slack", json!({"text": "deploy is done"}));
        assert_eq!(extract_text(&slack), "deploy is done");

        let jira = raw_event(
            "jira",
            json!({"title": "Login broken", "description": "500 on POST /login"}),
        );
        assert_eq!(extract_text(&jira), "Login broken\n500 on POST /login");

        let git = raw_event("git", json!({"message": "fix: race", "body": "details"}));
        assert_eq!(extract_text(&git), "fix: race\ndetails");
    }

    #[test]
    fn unknown_source_serializes_deterministically() {
        let a = raw_event("pagerduty", json!({"b": 2, "a": 1}));
        let b = raw_event("pagerduty", json!({"a": 1, "b": 2}));
        assert_eq!(extract_text(&a), extract_text(&b));
        assert_eq!(extract_text(&a), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn mentions_are_stripped_of_delimiters() {
        let event = raw_event("slack", json!({"text": "ask <@U123ABC> or <@W999>"}));
        let enriched = enrich(&event);
        assert_eq!(enriched.entities.mentions, vec!["U123ABC", "W999"]);
    }

    #[test]
    fn links_are_collected() {
        let event = raw_event(
            "slack",
            json!({"text": "see https://docs.example.com/auth and http://wiki.local/page"}),
        );
        let enriched = enrich(&event);
        assert_eq!(enriched.entities.links.len(), 2);
        assert_eq!(enriched.entities.links[0], "https://docs.example.com/auth");
    }

    #[test]
    fn users_come_from_payload() {
        let event = raw_event(
            "slack",
            json!({"text": "hi", "user": "U1", "users": ["U1", "U2"]}),
        );
        let enriched = enrich(&event);
        assert_eq!(enriched.entities.users, vec!["U1", "U2"]);
    }

    #[test]
    fn keywords_require_length_and_repetition() {
        let text = "auth tokens expire fast; auth tokens rotate; the cat sat";
        let keywords = extract_keywords(text);
        assert_eq!(keywords, vec!["auth", "tokens"]);
    }

    #[test]
    fn keywords_rank_by_frequency_then_first_seen() {
        let text = "redis redis redis cache cache queue queue";
        let keywords = extract_keywords(text);
        assert_eq!(keywords, vec!["redis", "cache", "queue"]);
    }

    #[test]
    fn keywords_cap_at_ten() {
        let mut text = String::new();
        for i in 0..15 {
            let word = format!("word{i:02}");
            text.push_str(&format!("{word} {word} "));
        }
        assert_eq!(extract_keywords(&text).len(), 10);
    }

    #[test]
    fn importance_signals_accumulate() {
        // Plain short slack message: base only.
        let plain = raw_event("slack", json!({"text": "ok"}));
        assert!((enrich(&plain).importance - 0.5).abs() < f32::EPSILON);

        // Thread reply loses 0.1.
        let reply = raw_event("slack", json!({"text": "ok", "thread_ts": "123.456"}));
        assert!((enrich(&reply).importance - 0.4).abs() < f32::EPSILON);

        // Reactions, mention, and link add up: 0.5 + 0.2 + 0.15 + 0.1.
        let rich = raw_event(
            "slack",
            json!({
                "text": "see https://ex.com <@U1>",
                "reactions": [{"name": "+1"}]
            }),
        );
        assert!((enrich(&rich).importance - 0.95).abs() < 1e-6);
    }

    #[test]
    fn jira_priority_boost() {
        let critical = raw_event(
            "jira",
            json!({"title": "Outage", "description": "prod down", "priority": "Critical"}),
        );
        assert!((enrich(&critical).importance - 0.8).abs() < 1e-6);

        let low = raw_event(
            "jira",
            json!({"title": "Typo", "description": "readme", "priority": "Low"}),
        );
        assert!((enrich(&low).importance - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn importance_clamps_to_unit_interval() {
        let long_text = format!("{} https://a.io <@U1>", "x".repeat(300));
        let maxed = raw_event(
            "jira",
            json!({"title": long_text, "description": "", "priority": "Critical"}),
        );
        let enriched = enrich(&maxed);
        // 0.5 + 0.3 + 0.1 + 0.15 + 0.1 would exceed 1.0
        assert!((enriched.importance - 1.0).abs() < f32::EPSILON);
        assert!(enriched.importance <= 1.0);
    }

    #[test]
    fn long_text_bonus_uses_char_count() {
        let event = raw_event("slack", json!({"text": "y".repeat(201)}));
        assert!((enrich(&event).importance - 0.6).abs() < 1e-6);
    }
}
