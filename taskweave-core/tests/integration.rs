//! Integration tests for the event pipeline
//!
//! These tests drive scripted event vectors through the ordering queue and
//! the reconciler, the same path the subscription manager uses, and check
//! the resulting timelines. No network is involved.

use taskweave_core::event::{decode, RawEvent, TaskIdentity};
use taskweave_core::history::{restore_start, HistoryStore, SessionSnapshot, SqliteHistory};
use taskweave_core::queue::OrderingQueue;
use taskweave_core::reconcile::{Applied, CloseReason, SessionViewState};
use taskweave_core::timeline::{Block, ChatRole, FlowPhase, StepStatus};

/// Build an event with an explicit server timestamp.
fn ev(kind: &str, result: &str, timestamp: i64, arrival: u64) -> RawEvent {
    let data = serde_json::json!({ "result": result, "timestamp": timestamp }).to_string();
    decode(kind, &data, arrival).expect("fixture event decodes")
}

/// Push a vector of events through the queue into the state, one arrival at
/// a time, like the stream loop does.
fn run(state: &mut SessionViewState, events: Vec<RawEvent>) -> Vec<Applied> {
    let mut queue = OrderingQueue::new();
    let mut outcomes = Vec::new();
    for event in events {
        queue.push(event);
        queue.drain(|e| {
            outcomes.push(state.apply(&e));
            Ok(())
        });
    }
    outcomes
}

fn flow_phases(state: &SessionViewState) -> Vec<&FlowPhase> {
    state
        .timeline()
        .iter()
        .filter_map(|b| match b {
            Block::Flow(p) => Some(p),
            _ => None,
        })
        .collect()
}

// ============================================
// End-to-end session shapes
// ============================================

#[test]
fn test_task_session_happy_path() {
    let mut state = SessionViewState::new(TaskIdentity::task("t1"), false);
    state.push_user_message("summarize this repo");

    run(
        &mut state,
        vec![
            ev("think", "reading files", 10, 0),
            ev("act", "ran tree", 20, 1),
            ev("message", "It is a parser.", 30, 2),
            ev("complete", "Summary: a parser.", 40, 3),
        ],
    );

    assert!(state.is_closed());
    assert_eq!(state.close_reason(), Some(CloseReason::Completed));

    // user turn, act output, message, completion result; think hidden
    let roles: Vec<_> = state
        .timeline()
        .iter()
        .filter_map(Block::chat_role)
        .collect();
    assert_eq!(
        roles,
        vec![
            ChatRole::User,
            ChatRole::Assistant,
            ChatRole::Assistant,
            ChatRole::Assistant
        ]
    );
}

#[test]
fn test_flow_session_builds_phase() {
    let mut state = SessionViewState::new(TaskIdentity::flow("f1"), false);
    state.push_user_message("book a trip");

    run(
        &mut state,
        vec![
            ev("plan", "1. search 2. book", 10, 0),
            ev("step_start", "Start executing step: search", 20, 1),
            ev("act", "found 3 options", 30, 2),
            ev("step_finish", "", 40, 3),
            ev("step_start", "Start executing step: book", 50, 4),
            ev("summary", "Booked option two.", 60, 5),
            ev("complete", "", 70, 6),
        ],
    );

    let phases = flow_phases(&state);
    assert_eq!(phases.len(), 1);
    let phase = phases[0];
    assert_eq!(phase.plan.as_deref(), Some("1. search 2. book"));
    assert_eq!(phase.summary.as_deref(), Some("Booked option two."));
    assert!(phase.completed);
    assert_eq!(phase.steps.len(), 2);
    assert_eq!(phase.steps[0].title, "search");
    assert_eq!(phase.steps[0].details.len(), 1);
    // The close finished the still-running second step
    assert!(phase.steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[test]
fn test_interaction_pause_and_continuation() {
    let identity = TaskIdentity::flow("f1");
    let mut state = SessionViewState::new(identity, false);
    state.push_user_message("research topic");

    let outcomes = run(
        &mut state,
        vec![
            ev("step_start", "Start executing step: gather", 10, 0),
            ev("log", "INTERACTION_REQUIRED: Which subtopic?", 20, 1),
        ],
    );

    let question = match outcomes.last() {
        Some(Applied::InteractionOpened(signal)) => signal.question.clone(),
        other => panic!("expected interaction, got {:?}", other),
    };
    assert_eq!(question, "Which subtopic?");
    assert!(state.interaction().is_pending());

    // The user answers and the same identity resumes as a new phase
    state.answer_interaction("the rust one");
    state.continue_session();

    run(
        &mut state,
        vec![
            ev("step_start", "Start executing step: write", 30, 0),
            ev("complete", "done", 40, 1),
        ],
    );

    let phases = flow_phases(&state);
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[0].steps[0].title, "gather");
    assert_eq!(phases[1].steps[0].title, "write");
    assert!(state.is_closed());
    assert!(!state.interaction().is_pending());
}

// ============================================
// Ordering properties
// ============================================

#[test]
fn test_arrival_order_does_not_change_timeline() {
    let script = [
        ("message", "one", 10i64),
        ("message", "two", 20),
        ("message", "three", 30),
        ("complete", "", 40),
    ];

    let render = |arrivals: &[usize]| {
        let mut state = SessionViewState::new(TaskIdentity::task("t1"), false);
        // One queue across the whole delivery, drained only at the end, so
        // late arrivals can still sort ahead
        let mut queue = OrderingQueue::new();
        for (n, &i) in arrivals.iter().enumerate() {
            let (kind, text, ts) = script[i];
            queue.push(ev(kind, text, ts, n as u64));
        }
        queue.drain(|e| {
            state.apply(&e);
            Ok(())
        });
        state
            .timeline()
            .iter()
            .filter_map(|b| match b {
                Block::Chat(m) => Some(m.content.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
    };

    let expected = render(&[0, 1, 2, 3]);
    assert_eq!(expected, vec!["one", "two", "three"]);
    assert_eq!(render(&[3, 2, 1, 0]), expected);
    assert_eq!(render(&[1, 3, 0, 2]), expected);
}

#[test]
fn test_step_status_stays_monotonic_under_reordering() {
    // The start arrived after the finish but carries the earlier timestamp,
    // so the queue replays them in logical order
    let mut state = SessionViewState::new(TaskIdentity::flow("f1"), false);
    let mut queue = OrderingQueue::new();
    queue.push(ev("step_finish", "", 20, 0));
    queue.push(ev("step_start", "Start executing step: work", 10, 1));
    queue.drain(|e| {
        state.apply(&e);
        Ok(())
    });

    let phases = flow_phases(&state);
    assert_eq!(phases[0].steps.len(), 1);
    assert_eq!(phases[0].steps[0].status, StepStatus::Completed);
}

#[test]
fn test_events_after_terminal_are_dropped() {
    let mut state = SessionViewState::new(TaskIdentity::task("t1"), false);
    let outcomes = run(
        &mut state,
        vec![
            ev("complete", "done", 10, 0),
            ev("message", "straggler", 20, 1),
        ],
    );

    assert_eq!(outcomes[0], Applied::Closed(CloseReason::Completed));
    assert_eq!(outcomes[1], Applied::Ignored);
    assert_eq!(state.timeline().len(), 1);
}

// ============================================
// History restore
// ============================================

#[test]
fn test_session_snapshot_round_trip_through_cache() {
    let store = SqliteHistory::open_in_memory(Default::default()).unwrap();

    let mut state = SessionViewState::new(TaskIdentity::flow("f1"), false);
    state.push_user_message("plan dinner");
    run(
        &mut state,
        vec![
            ev("step_start", "Start executing step: choose recipe", 10, 0),
            ev("complete", "Pasta it is.", 20, 1),
        ],
    );

    let mut snapshot = SessionSnapshot::new("session-9");
    snapshot.identity = Some(state.identity().clone());
    for block in state.timeline() {
        match block {
            Block::Chat(msg) => snapshot.turns.push(msg.clone()),
            Block::Flow(phase) => snapshot.phases.push(phase.clone()),
            Block::Thinking(_) => {}
        }
    }
    store.save(&snapshot).unwrap();
    store.set_last_active("session-9").unwrap();

    assert_eq!(store.last_active().unwrap().as_deref(), Some("session-9"));
    let restored = store.load("session-9").unwrap().unwrap();
    assert_eq!(restored.identity, Some(TaskIdentity::flow("f1")));
    assert_eq!(restored.turns.len(), 2);
    assert_eq!(restored.phases.len(), 1);
    assert_eq!(restored.phases[0].steps[0].title, "choose recipe");

    // Replay keeps everything here; the cap only bites long histories
    assert_eq!(restore_start(&restored.turns), 0);
}
