//! Interaction detection.
//!
//! The backend signals "the agent needs a human answer" in several loosely
//! structured ways: a dedicated `interaction` event, a `waiting` status
//! record, an explicit `INTERACTION_REQUIRED:` marker inside ordinary text,
//! or tool traffic involving the `ask_human` tool. [`detect`] inspects each
//! event against a fixed, prioritized rule list and updates the pending
//! [`InteractionState`]; the first matching rule wins and later rules are
//! not consulted. Only the payload's `result` string is examined; other
//! fields never trigger detection.
//!
//! Extraction is best effort: when a rule matches but the question text
//! cannot be recovered, a generic prompt is used rather than dropping the
//! signal.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{EventKind, RawEvent, TaskIdentity};

/// Fallback prompt when a rule fires but extraction comes up empty.
pub const GENERIC_QUESTION: &str = "The agent is waiting for your input.";

static RE_INTERACTION_REQUIRED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"INTERACTION_REQUIRED:\s*(.+)").unwrap());

static RE_TOOL_ARGUMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tool arguments: (\{[^}]+\})").unwrap());

static RE_INQUIRE_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"inquire["\s]*:["\s]*([^,\n}]+)"#).unwrap());

static RE_WAITING_FOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Waiting for human response to: (.+)").unwrap());

// ============================================
// State
// ============================================

/// A detected request for human input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionSignal {
    pub question: String,
}

/// Pending-interaction state for one session.
///
/// At most one interaction is pending at a time; repeated signals for the
/// same task are absorbed, and signals from any other task are ignored
/// until the pending one is answered or the session resets.
#[derive(Debug, Clone, Default)]
pub struct InteractionState {
    pending: bool,
    question: Option<String>,
    owner: Option<TaskIdentity>,
}

impl InteractionState {
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn question(&self) -> Option<&str> {
        self.question.as_deref()
    }

    pub fn owner(&self) -> Option<&TaskIdentity> {
        self.owner.as_ref()
    }

    /// Clear the pending interaction after the answer was submitted.
    pub fn resolve(&mut self) {
        self.pending = false;
        self.question = None;
        self.owner = None;
    }

    /// Drop any pending interaction on session reset or terminal close.
    pub fn reset(&mut self) {
        self.resolve();
    }
}

// ============================================
// Detection rules
// ============================================

/// Names for the detection rules, in priority order. Used only for logging.
const RULE_NAMES: [&str; 5] = [
    "ask_human_completed",
    "interaction_marker",
    "tool_ask_human",
    "waiting_status",
    "interaction_event",
];

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'')
}

/// Rule 1: a completed `ask_human` tool reports its mission in the result
/// text, with the question behind the `INTERACTION_REQUIRED:` marker.
fn rule_ask_human_completed(event: &RawEvent) -> Option<Option<String>> {
    let text = event.result_text().unwrap_or("");
    if !text.contains("Tool 'ask_human' completed its mission!") {
        return None;
    }
    let question = RE_INTERACTION_REQUIRED
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    Some(question)
}

/// Rule 2: a bare `INTERACTION_REQUIRED:` marker anywhere in the text.
fn rule_interaction_marker(event: &RawEvent) -> Option<Option<String>> {
    let text = event.result_text().unwrap_or("");
    if !text.contains("INTERACTION_REQUIRED:") {
        return None;
    }
    let question = text
        .split("INTERACTION_REQUIRED:")
        .last()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(question)
}

/// Rule 3: `tool` traffic mentioning `ask_human`. The question lives in the
/// tool arguments, either as parseable JSON or as loose `inquire: ...` text.
fn rule_tool_ask_human(event: &RawEvent) -> Option<Option<String>> {
    if event.kind != EventKind::Tool {
        return None;
    }
    let text = event.result_text().unwrap_or("");
    if !text.contains("ask_human") {
        return None;
    }

    let from_json = RE_TOOL_ARGUMENTS
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .and_then(|args| {
            args.get("inquire")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        });

    let question = from_json.or_else(|| {
        RE_INQUIRE_FIELD
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| strip_quotes(m.as_str()).to_string())
    });
    Some(question.filter(|q| !q.is_empty()))
}

/// Rule 4: a `waiting` status record naming the outstanding question.
fn rule_waiting_status(event: &RawEvent) -> Option<Option<String>> {
    if event.kind.as_str() != "waiting" {
        return None;
    }
    let text = event.result_text().unwrap_or("");
    if !text.contains("Waiting for human response") {
        return None;
    }
    let question = RE_WAITING_FOR
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    Some(question)
}

/// Rule 5: a dedicated `interaction` event with the marker prefix.
fn rule_interaction_event(event: &RawEvent) -> Option<Option<String>> {
    if event.kind != EventKind::Interaction {
        return None;
    }
    let text = event.result_text().unwrap_or("");
    if !text.contains("Human interaction required:") {
        return None;
    }
    let question = text
        .split("Human interaction required:")
        .last()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(question)
}

// ============================================
// Detector
// ============================================

/// Run the rule list against one event and update the pending state.
///
/// Returns a signal only when a new interaction was opened. A signal for
/// the task that already owns the pending interaction refreshes the stored
/// question but does not re-fire; a signal from any other task while one is
/// pending is ignored.
pub fn detect(
    event: &RawEvent,
    identity: &TaskIdentity,
    state: &mut InteractionState,
) -> Option<InteractionSignal> {
    let rules: [fn(&RawEvent) -> Option<Option<String>>; 5] = [
        rule_ask_human_completed,
        rule_interaction_marker,
        rule_tool_ask_human,
        rule_waiting_status,
        rule_interaction_event,
    ];

    let (index, extracted) = rules
        .iter()
        .enumerate()
        .find_map(|(i, rule)| rule(event).map(|q| (i, q)))?;

    let question = extracted.unwrap_or_else(|| GENERIC_QUESTION.to_string());

    if state.pending {
        match &state.owner {
            Some(owner) if owner == identity => {
                // Duplicate signal for the same task: keep the freshest text
                debug!(
                    rule = RULE_NAMES[index],
                    task = %identity,
                    "interaction already pending, refreshing question"
                );
                state.question = Some(question);
            }
            _ => {
                warn!(
                    rule = RULE_NAMES[index],
                    task = %identity,
                    "ignoring interaction signal while another is pending"
                );
            }
        }
        return None;
    }

    debug!(rule = RULE_NAMES[index], task = %identity, "interaction detected");
    state.pending = true;
    state.question = Some(question.clone());
    state.owner = Some(identity.clone());
    Some(InteractionSignal { question })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::decode;

    fn event(kind: &str, result: &str) -> RawEvent {
        let data = serde_json::json!({ "result": result }).to_string();
        decode(kind, &data, 0).unwrap()
    }

    fn detect_fresh(ev: &RawEvent) -> Option<InteractionSignal> {
        let mut state = InteractionState::default();
        detect(ev, &TaskIdentity::task("t1"), &mut state)
    }

    #[test]
    fn test_ask_human_completed_rule() {
        let ev = event(
            "act",
            "Tool 'ask_human' completed its mission! Result: INTERACTION_REQUIRED: What city?",
        );
        let signal = detect_fresh(&ev).unwrap();
        assert_eq!(signal.question, "What city?");
    }

    #[test]
    fn test_bare_marker_rule() {
        let ev = event("log", "step output... INTERACTION_REQUIRED: Pick a color.");
        let signal = detect_fresh(&ev).unwrap();
        assert_eq!(signal.question, "Pick a color.");
    }

    #[test]
    fn test_marker_without_text_uses_generic_question() {
        let ev = event("log", "INTERACTION_REQUIRED:   ");
        let signal = detect_fresh(&ev).unwrap();
        assert_eq!(signal.question, GENERIC_QUESTION);
    }

    #[test]
    fn test_tool_rule_parses_json_arguments() {
        let ev = event(
            "tool",
            r#"Executing ask_human. Tool arguments: {"inquire": "Your budget?"}"#,
        );
        let signal = detect_fresh(&ev).unwrap();
        assert_eq!(signal.question, "Your budget?");
    }

    #[test]
    fn test_tool_rule_falls_back_to_loose_extraction() {
        // Single quotes defeat the JSON parse; the loose pattern recovers it
        let ev = event("tool", r#"Executing ask_human with inquire: 'Preferred dates?'"#);
        let signal = detect_fresh(&ev).unwrap();
        assert_eq!(signal.question, "Preferred dates?");
    }

    #[test]
    fn test_tool_rule_requires_tool_kind() {
        let ev = event("log", r#"ask_human Tool arguments: {"inquire": "x"}"#);
        assert!(detect_fresh(&ev).is_none());
    }

    #[test]
    fn test_waiting_status_rule() {
        let ev = event(
            "waiting",
            "Waiting for human response to: Confirm the plan?",
        );
        let signal = detect_fresh(&ev).unwrap();
        assert_eq!(signal.question, "Confirm the plan?");
    }

    #[test]
    fn test_interaction_event_rule() {
        let ev = event("interaction", "Human interaction required: Approve?");
        let signal = detect_fresh(&ev).unwrap();
        assert_eq!(signal.question, "Approve?");
    }

    #[test]
    fn test_rule_priority_first_match_wins() {
        // Both rule 1 and rule 3 patterns present on a tool event; rule 1
        // extracts via the marker
        let ev = event(
            "tool",
            r#"Tool 'ask_human' completed its mission! INTERACTION_REQUIRED: A? Tool arguments: {"inquire": "B?"}"#,
        );
        let signal = detect_fresh(&ev).unwrap();
        assert!(signal.question.starts_with("A?"));
    }

    #[test]
    fn test_duplicate_signal_same_owner_does_not_refire() {
        let mut state = InteractionState::default();
        let id = TaskIdentity::task("t1");
        let ev = event("log", "INTERACTION_REQUIRED: First?");
        assert!(detect(&ev, &id, &mut state).is_some());

        let ev2 = event("log", "INTERACTION_REQUIRED: Second?");
        assert!(detect(&ev2, &id, &mut state).is_none());
        // Question text still refreshed
        assert_eq!(state.question(), Some("Second?"));
        assert!(state.is_pending());
    }

    #[test]
    fn test_signal_from_other_task_ignored_while_pending() {
        let mut state = InteractionState::default();
        let ev = event("log", "INTERACTION_REQUIRED: First?");
        assert!(detect(&ev, &TaskIdentity::task("t1"), &mut state).is_some());

        let ev2 = event("log", "INTERACTION_REQUIRED: Other?");
        assert!(detect(&ev2, &TaskIdentity::flow("f9"), &mut state).is_none());
        assert_eq!(state.question(), Some("First?"));
        assert_eq!(state.owner(), Some(&TaskIdentity::task("t1")));
    }

    #[test]
    fn test_resolve_allows_next_interaction() {
        let mut state = InteractionState::default();
        let id = TaskIdentity::task("t1");
        let ev = event("log", "INTERACTION_REQUIRED: First?");
        detect(&ev, &id, &mut state);
        state.resolve();
        assert!(!state.is_pending());

        let ev2 = event("log", "INTERACTION_REQUIRED: Second?");
        assert!(detect(&ev2, &id, &mut state).is_some());
    }

    #[test]
    fn test_marker_outside_result_field_does_not_match() {
        let data = serde_json::json!({ "message": "INTERACTION_REQUIRED: hidden?" }).to_string();
        let ev = decode("log", &data, 0).unwrap();
        assert!(detect_fresh(&ev).is_none());
    }

    #[test]
    fn test_plain_text_does_not_match() {
        let ev = event("log", "just a normal log line about tools and humans");
        assert!(detect_fresh(&ev).is_none());
    }
}
