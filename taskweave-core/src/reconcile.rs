//! Timeline reconciliation.
//!
//! [`SessionViewState`] is the single writer of the timeline: it takes
//! decoded events in queue order and folds each one into the block list.
//! Interaction detection runs before kind handling, so an event that opens
//! an interaction is consumed by the prompt and never also rendered as
//! ordinary output. Terminal events close the state; a closed state ignores
//! everything that arrives after it.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::{EventKind, IdentitySpace, RawEvent, TaskIdentity};
use crate::interaction::{self, InteractionSignal, InteractionState};
use crate::timeline::{
    Block, ChatMessage, ChatRole, FlowPhase, StepDetailKind, ThinkingBlock,
};

static RE_STEP_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Start executing step:\s*(.+)").unwrap());

const STEP_START_MARKER: &str = "Start executing step:";
const STEP_FINISH_MARKER: &str = "Finish executing step:";

// ============================================
// Notices
// ============================================

/// Severity of an out-of-band notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Info,
    Error,
    /// Transport trouble; the session may need a fresh subscription
    Connectivity,
}

/// An out-of-band line shown alongside the timeline (server log output,
/// errors, reconnect advice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Notice {
    fn new(kind: NoticeKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

// ============================================
// Apply outcome
// ============================================

/// Why a session stopped receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    Terminated,
    Errored,
}

/// What folding one event into the state amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Nothing changed (unrecognized kind, or the state is closed)
    Ignored,
    /// The timeline or a notice changed
    Updated,
    /// A new interaction was opened; the caller should prompt the user
    InteractionOpened(InteractionSignal),
    /// A terminal event closed the session
    Closed(CloseReason),
}

// ============================================
// Session view state
// ============================================

/// Reconciled view of one streaming session.
pub struct SessionViewState {
    identity: TaskIdentity,
    long_thought: bool,
    timeline: Vec<Block>,
    notices: Vec<Notice>,
    interaction: InteractionState,
    /// Index of the thinking block currently accepting lines
    open_thinking: Option<usize>,
    /// Index of the flow phase currently receiving events. Chat blocks can
    /// land after it (interaction questions, user answers), so the open
    /// phase is not necessarily the last timeline block.
    open_phase: Option<usize>,
    closed: Option<CloseReason>,
}

impl SessionViewState {
    pub fn new(identity: TaskIdentity, long_thought: bool) -> Self {
        Self {
            identity,
            long_thought,
            timeline: Vec::new(),
            notices: Vec::new(),
            interaction: InteractionState::default(),
            open_thinking: None,
            open_phase: None,
            closed: None,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn timeline(&self) -> &[Block] {
        &self.timeline
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn interaction(&self) -> &InteractionState {
        &self.interaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    /// Record the prompt that started (or continued) this session.
    pub fn push_user_message(&mut self, content: impl Into<String>) {
        self.collapse_thinking();
        self.timeline
            .push(Block::Chat(ChatMessage::new(ChatRole::User, content)));
    }

    /// Record the user's answer to the pending interaction and clear it.
    pub fn answer_interaction(&mut self, answer: impl Into<String>) {
        self.interaction.resolve();
        self.timeline
            .push(Block::Chat(ChatMessage::new(ChatRole::User, answer)));
    }

    /// Reopen a closed or paused session under the same identity.
    ///
    /// Keeps the timeline and appends a fresh flow phase marker, so output
    /// from the continuation never interleaves with the earlier phases.
    pub fn continue_session(&mut self) {
        self.closed = None;
        self.open_thinking = None;
        if self.identity.space == IdentitySpace::Flow {
            let next = self.phase_count() + 1;
            self.timeline.push(Block::Flow(FlowPhase::new(next)));
            self.open_phase = Some(self.timeline.len() - 1);
        }
    }

    pub fn push_notice(&mut self, kind: NoticeKind, text: impl Into<String>) {
        self.notices.push(Notice::new(kind, text));
    }

    /// Close the session from outside the event stream, e.g. after a status
    /// poll reported a terminal state. No-op when already closed.
    pub fn close(&mut self, reason: CloseReason) {
        if self.closed.is_none() {
            self.finalize(reason);
        }
    }

    /// Fold one decoded event into the view.
    pub fn apply(&mut self, event: &RawEvent) -> Applied {
        if self.closed.is_some() {
            debug!(kind = %event.kind, "event after close, ignoring");
            return Applied::Ignored;
        }

        // Interaction detection runs first and consumes the event: the
        // question renders as an assistant turn, nothing else does
        if let Some(signal) = interaction::detect(event, &self.identity, &mut self.interaction) {
            self.collapse_thinking();
            self.timeline.push(Block::Chat(ChatMessage::new(
                ChatRole::Assistant,
                signal.question.clone(),
            )));
            return Applied::InteractionOpened(signal);
        }

        match &event.kind {
            EventKind::Think => self.apply_think(event.text()),
            EventKind::StepStart => self.apply_step_start(event.text()),
            EventKind::Step | EventKind::Log => self.apply_step_or_log(&event.kind, event.text()),
            EventKind::StepFinish => self.apply_step_finish(),
            EventKind::Act | EventKind::Tool | EventKind::Run => self.apply_act(event.text()),
            EventKind::Message => self.apply_chat(ChatRole::Assistant, event.text()),
            EventKind::Interaction => self.apply_chat(ChatRole::System, event.text()),
            EventKind::Plan => self.apply_plan(event.text()),
            EventKind::Summary => self.apply_summary(event.text()),
            EventKind::Complete => self.apply_close(CloseReason::Completed, event.text()),
            EventKind::Terminated => {
                self.push_notice(NoticeKind::Info, "Session terminated.");
                self.finalize(CloseReason::Terminated)
            }
            EventKind::Error => {
                let text = event.text();
                let text = if text.is_empty() { "unknown error" } else { text };
                self.push_notice(NoticeKind::Error, text);
                self.finalize(CloseReason::Errored)
            }
            EventKind::Unknown(label) => {
                debug!(kind = %label, "unrecognized event kind, ignoring");
                Applied::Ignored
            }
        }
    }

    // ============================================
    // Per-kind handlers
    // ============================================

    fn apply_think(&mut self, text: &str) -> Applied {
        if self.identity.space == IdentitySpace::Flow {
            return self.apply_detail(StepDetailKind::Think, text);
        }
        if !self.long_thought {
            // Raw chain-of-thought is hidden unless asked for
            return Applied::Ignored;
        }
        match self.open_thinking {
            Some(index) => {
                if let Some(Block::Thinking(block)) = self.timeline.get_mut(index) {
                    block.messages.push(text.to_string());
                }
            }
            None => {
                self.timeline
                    .push(Block::Thinking(ThinkingBlock::with_message(text)));
                self.open_thinking = Some(self.timeline.len() - 1);
            }
        }
        Applied::Updated
    }

    fn apply_step_start(&mut self, text: &str) -> Applied {
        self.collapse_thinking();
        let title = RE_STEP_START
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| text.trim().to_string());
        let phase = self.current_phase_mut();
        phase.start_step(title);
        Applied::Updated
    }

    /// `step` and `log` records carry the step lifecycle as text markers.
    /// Unmarked step text belongs to the step that is running; unmarked log
    /// text is surfaced as an info notice.
    fn apply_step_or_log(&mut self, kind: &EventKind, text: &str) -> Applied {
        if text.contains(STEP_START_MARKER) {
            return self.apply_step_start(text);
        }
        if text.contains(STEP_FINISH_MARKER) {
            return self.apply_step_finish();
        }
        if text.is_empty() {
            return Applied::Ignored;
        }
        if *kind == EventKind::Log {
            self.push_notice(NoticeKind::Info, text);
            return Applied::Updated;
        }
        debug!(task = %self.identity, "step event without a lifecycle marker");
        self.apply_detail(StepDetailKind::Act, text)
    }

    fn apply_step_finish(&mut self) -> Applied {
        self.collapse_thinking();
        let phase = self.current_phase_mut();
        if phase.finish_current_step() {
            Applied::Updated
        } else {
            Applied::Ignored
        }
    }

    fn apply_act(&mut self, text: &str) -> Applied {
        if self.identity.space == IdentitySpace::Flow {
            return self.apply_detail(StepDetailKind::Act, text);
        }
        if self.long_thought {
            // With thinking visible, tool output is a diagnostic, not a turn
            if text.is_empty() {
                return Applied::Ignored;
            }
            self.push_notice(NoticeKind::Info, text);
            return Applied::Updated;
        }
        self.apply_chat(ChatRole::Assistant, text)
    }

    fn apply_detail(&mut self, kind: StepDetailKind, text: &str) -> Applied {
        if text.is_empty() {
            return Applied::Ignored;
        }
        let phase = self.current_phase_mut();
        if phase.add_detail(kind, text) {
            Applied::Updated
        } else {
            // Detail before any step started; keep it visible as a notice
            self.push_notice(NoticeKind::Info, text);
            Applied::Updated
        }
    }

    fn apply_chat(&mut self, role: ChatRole, text: &str) -> Applied {
        if text.is_empty() {
            return Applied::Ignored;
        }
        self.collapse_thinking();
        self.timeline.push(Block::Chat(ChatMessage::new(role, text)));
        Applied::Updated
    }

    fn apply_plan(&mut self, text: &str) -> Applied {
        if text.is_empty() {
            return Applied::Ignored;
        }
        self.collapse_thinking();
        self.current_phase_mut().plan = Some(text.to_string());
        Applied::Updated
    }

    fn apply_summary(&mut self, text: &str) -> Applied {
        if text.is_empty() {
            return Applied::Ignored;
        }
        self.collapse_thinking();
        self.current_phase_mut().summary = Some(text.to_string());
        Applied::Updated
    }

    fn apply_close(&mut self, reason: CloseReason, text: &str) -> Applied {
        if !text.is_empty() {
            self.collapse_thinking();
            self.timeline
                .push(Block::Chat(ChatMessage::new(ChatRole::Assistant, text)));
        }
        self.finalize(reason)
    }

    fn finalize(&mut self, reason: CloseReason) -> Applied {
        self.collapse_thinking();
        for block in &mut self.timeline {
            if let Block::Flow(phase) = block {
                if !phase.completed {
                    phase.finish_current_step();
                    phase.completed = true;
                }
            }
        }
        self.interaction.reset();
        self.open_phase = None;
        self.closed = Some(reason);
        Applied::Closed(reason)
    }

    // ============================================
    // Helpers
    // ============================================

    /// The flow phase currently receiving events, created on first use.
    /// Tracked by index so chat turns appended after it (an interaction
    /// question and its answer) do not split the phase.
    fn current_phase_mut(&mut self) -> &mut FlowPhase {
        let open = self
            .open_phase
            .filter(|&i| matches!(self.timeline.get(i), Some(Block::Flow(p)) if !p.completed));
        let index = match open {
            Some(index) => index,
            None => {
                let next = self.phase_count() + 1;
                self.timeline.push(Block::Flow(FlowPhase::new(next)));
                self.timeline.len() - 1
            }
        };
        self.open_phase = Some(index);
        match &mut self.timeline[index] {
            Block::Flow(phase) => phase,
            // unreachable: the index was just checked or just pushed
            _ => unreachable!("open phase index points at a flow phase"),
        }
    }

    fn phase_count(&self) -> u32 {
        self.timeline
            .iter()
            .filter(|b| matches!(b, Block::Flow(_)))
            .count() as u32
    }

    /// Close the thinking block currently accepting lines, if any.
    fn collapse_thinking(&mut self) {
        if let Some(index) = self.open_thinking.take() {
            if let Some(Block::Thinking(block)) = self.timeline.get_mut(index) {
                block.completed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::decode;
    use crate::timeline::StepStatus;

    fn event(kind: &str, result: &str) -> RawEvent {
        let data = serde_json::json!({ "result": result }).to_string();
        decode(kind, &data, 0).unwrap()
    }

    fn task_state(long_thought: bool) -> SessionViewState {
        SessionViewState::new(TaskIdentity::task("t1"), long_thought)
    }

    fn flow_state() -> SessionViewState {
        SessionViewState::new(TaskIdentity::flow("f1"), false)
    }

    #[test]
    fn test_think_ignored_without_long_thought() {
        let mut state = task_state(false);
        assert_eq!(state.apply(&event("think", "hmm")), Applied::Ignored);
        assert!(state.timeline().is_empty());
    }

    #[test]
    fn test_think_groups_and_collapses() {
        let mut state = task_state(true);
        state.apply(&event("think", "first"));
        state.apply(&event("think", "second"));
        assert_eq!(state.timeline().len(), 1);

        // A non-think event closes the group
        state.apply(&event("message", "answer"));
        match &state.timeline()[0] {
            Block::Thinking(block) => {
                assert_eq!(block.messages, vec!["first", "second"]);
                assert!(block.completed);
            }
            other => panic!("expected thinking block, got {:?}", other),
        }

        // The next think line opens a fresh group
        state.apply(&event("think", "third"));
        assert_eq!(state.timeline().len(), 3);
    }

    #[test]
    fn test_message_appends_assistant_chat() {
        let mut state = task_state(false);
        state.apply(&event("message", "hello"));
        match &state.timeline()[0] {
            Block::Chat(msg) => {
                assert_eq!(msg.role, ChatRole::Assistant);
                assert_eq!(msg.content, "hello");
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn test_flow_step_lifecycle() {
        let mut state = flow_state();
        state.apply(&event("plan", "1. fetch 2. summarize"));
        state.apply(&event("step_start", "Start executing step: fetch"));
        state.apply(&event("act", "fetched 3 pages"));
        state.apply(&event("think", "now summarize"));
        state.apply(&event("step_finish", ""));

        let phase = match &state.timeline()[0] {
            Block::Flow(p) => p,
            other => panic!("expected flow phase, got {:?}", other),
        };
        assert_eq!(phase.plan.as_deref(), Some("1. fetch 2. summarize"));
        assert_eq!(phase.steps.len(), 1);
        let step = &phase.steps[0];
        assert_eq!(step.title, "fetch");
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.details.len(), 2);
        assert_eq!(step.details[0].kind, StepDetailKind::Act);
        assert_eq!(step.details[1].kind, StepDetailKind::Think);
    }

    #[test]
    fn test_step_markers_in_log_events() {
        let mut state = flow_state();
        state.apply(&event("log", "Start executing step: analyze"));
        state.apply(&event("log", "Finish executing step: analyze"));

        let phase = match &state.timeline()[0] {
            Block::Flow(p) => p,
            other => panic!("expected flow phase, got {:?}", other),
        };
        assert_eq!(phase.steps[0].title, "analyze");
        assert_eq!(phase.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn test_plain_log_becomes_notice() {
        let mut state = task_state(false);
        state.apply(&event("log", "browser started"));
        assert_eq!(state.notices().len(), 1);
        assert_eq!(state.notices()[0].kind, NoticeKind::Info);
        assert!(state.timeline().is_empty());
    }

    #[test]
    fn test_complete_closes_and_renders_result() {
        let mut state = task_state(false);
        let outcome = state.apply(&event("complete", "all done"));
        assert_eq!(outcome, Applied::Closed(CloseReason::Completed));
        assert!(state.is_closed());
        assert_eq!(state.timeline().len(), 1);

        // Everything after close is ignored
        assert_eq!(state.apply(&event("message", "late")), Applied::Ignored);
        assert_eq!(state.apply(&event("complete", "again")), Applied::Ignored);
        assert_eq!(state.timeline().len(), 1);
    }

    #[test]
    fn test_error_event_closes_with_notice() {
        let mut state = task_state(false);
        let outcome = state.apply(&event("error", "model unavailable"));
        assert_eq!(outcome, Applied::Closed(CloseReason::Errored));
        assert_eq!(state.notices()[0].kind, NoticeKind::Error);
        assert_eq!(state.notices()[0].text, "model unavailable");
    }

    #[test]
    fn test_close_finalizes_open_flow_phase() {
        let mut state = flow_state();
        state.apply(&event("step_start", "Start executing step: work"));
        state.apply(&event("complete", ""));

        let phase = match &state.timeline()[0] {
            Block::Flow(p) => p,
            other => panic!("expected flow phase, got {:?}", other),
        };
        assert!(phase.completed);
        assert_eq!(phase.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn test_interaction_consumes_event() {
        let mut state = task_state(false);
        let outcome = state.apply(&event("log", "INTERACTION_REQUIRED: Which repo?"));
        match outcome {
            Applied::InteractionOpened(signal) => assert_eq!(signal.question, "Which repo?"),
            other => panic!("expected interaction, got {:?}", other),
        }
        assert!(state.interaction().is_pending());
        // The question renders as an assistant turn; the raw marker line
        // does not additionally show up anywhere
        assert_eq!(state.timeline().len(), 1);
        match &state.timeline()[0] {
            Block::Chat(msg) => {
                assert_eq!(msg.role, ChatRole::Assistant);
                assert_eq!(msg.content, "Which repo?");
            }
            other => panic!("expected chat, got {:?}", other),
        }
        assert!(state.notices().is_empty());
    }

    #[test]
    fn test_answer_interaction_records_user_turn() {
        let mut state = task_state(false);
        state.apply(&event("log", "INTERACTION_REQUIRED: Which repo?"));
        state.answer_interaction("the blue one");
        assert!(!state.interaction().is_pending());
        // question turn, then the user's answer
        match &state.timeline()[1] {
            Block::Chat(msg) => {
                assert_eq!(msg.role, ChatRole::User);
                assert_eq!(msg.content, "the blue one");
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn test_act_is_diagnostic_in_long_thought_mode() {
        let mut state = task_state(true);
        state.apply(&event("act", "ran a search"));
        assert!(state.timeline().is_empty());
        assert_eq!(state.notices().len(), 1);
        assert_eq!(state.notices()[0].kind, NoticeKind::Info);
    }

    #[test]
    fn test_phase_survives_interaction_pause() {
        // The stream is not torn down while an answer is pending, so events
        // after the pause must land on the same phase and step
        let mut state = flow_state();
        state.apply(&event("step_start", "Start executing step: gather"));
        state.apply(&event("log", "INTERACTION_REQUIRED: Which source?"));
        state.answer_interaction("the public one");
        state.apply(&event("act", "fetched 3 pages"));
        state.apply(&event("step_finish", ""));

        let phases: Vec<&FlowPhase> = state
            .timeline()
            .iter()
            .filter_map(|b| match b {
                Block::Flow(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(phases.len(), 1);
        let step = &phases[0].steps[0];
        assert_eq!(step.title, "gather");
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.details.len(), 1);
        assert_eq!(step.details[0].content, "fetched 3 pages");
    }

    #[test]
    fn test_unmarked_step_text_joins_current_step() {
        let mut state = flow_state();
        state.apply(&event("plan", "do X"));
        state.apply(&event("step_start", "Step 1"));
        state.apply(&event("step", "note"));
        state.apply(&event("step_finish", ""));
        state.apply(&event("complete", "done"));

        let phase = match &state.timeline()[0] {
            Block::Flow(p) => p,
            other => panic!("expected flow phase, got {:?}", other),
        };
        assert_eq!(phase.plan.as_deref(), Some("do X"));
        assert_eq!(phase.steps.len(), 1);
        assert_eq!(phase.steps[0].title, "Step 1");
        assert_eq!(phase.steps[0].status, StepStatus::Completed);
        assert_eq!(phase.steps[0].details.len(), 1);
        assert_eq!(phase.steps[0].details[0].content, "note");
        match state.timeline().last() {
            Some(Block::Chat(msg)) => assert_eq!(msg.content, "done"),
            other => panic!("expected terminal chat, got {:?}", other),
        }
    }

    #[test]
    fn test_continuation_appends_new_phase() {
        let mut state = flow_state();
        state.apply(&event("step_start", "Start executing step: one"));
        state.apply(&event("complete", ""));
        assert!(state.is_closed());

        state.continue_session();
        assert!(!state.is_closed());
        state.apply(&event("step_start", "Start executing step: two"));

        let phases: Vec<&FlowPhase> = state
            .timeline()
            .iter()
            .filter_map(|b| match b {
                Block::Flow(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].phase, 1);
        assert_eq!(phases[1].phase, 2);
        assert_eq!(phases[1].steps[0].title, "two");
        // Earlier phase untouched
        assert!(phases[0].completed);
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let mut state = task_state(false);
        assert_eq!(state.apply(&event("banana", "x")), Applied::Ignored);
        assert!(state.timeline().is_empty());
    }
}
