//! Incremental timeline printing.
//!
//! Chat blocks are immutable once pushed and a thinking block grows only
//! while it is the last block, but a flow phase keeps growing until it is
//! completed, even after chat turns (an interaction question and its
//! answer) land behind it. The printer walks the timeline from a cursor,
//! revisits the open phase on each sync, and emits just the lines that
//! appeared since the previous one, so the terminal reads like a live
//! transcript.

use taskweave_core::reconcile::{Notice, NoticeKind, SessionViewState};
use taskweave_core::timeline::{Block, ChatRole, FlowPhase, StepStatus, ThinkingBlock};

#[derive(Default)]
struct FlowCursor {
    plan: bool,
    steps_started: usize,
    steps_finished: usize,
    /// Details printed from the most recently started step
    details: usize,
    summary: bool,
}

/// Prints timeline changes since the last call.
pub struct Printer {
    block_index: usize,
    thinking_lines: usize,
    /// Which flow block the cursor belongs to; the open phase is revisited
    /// on every sync because it can grow behind later chat turns
    flow_index: Option<usize>,
    flow: FlowCursor,
    notices_seen: usize,
}

impl Printer {
    pub fn new() -> Self {
        Self {
            block_index: 0,
            thinking_lines: 0,
            flow_index: None,
            flow: FlowCursor::default(),
            notices_seen: 0,
        }
    }

    /// Emit everything new since the previous sync.
    pub fn sync(&mut self, state: &SessionViewState) {
        let timeline = state.timeline();

        // Catch up the phase the cursor already passed; once it completes
        // nothing more can land there
        if let Some(index) = self.flow_index {
            if index < self.block_index {
                if let Some(Block::Flow(phase)) = timeline.get(index) {
                    self.print_flow(index, phase);
                    if phase.completed {
                        self.flow_index = None;
                    }
                }
            }
        }

        while self.block_index < timeline.len() {
            let is_last = self.block_index == timeline.len() - 1;
            match &timeline[self.block_index] {
                Block::Chat(msg) => {
                    let prefix = match msg.role {
                        ChatRole::User => "you",
                        ChatRole::Assistant => "agent",
                        ChatRole::System => "system",
                    };
                    println!("{}> {}", prefix, msg.content);
                }
                Block::Thinking(block) => {
                    self.print_thinking(block);
                    if is_last && !block.completed {
                        // Still open; stay on this block
                        return self.print_notices(state.notices());
                    }
                    self.thinking_lines = 0;
                }
                Block::Flow(phase) => {
                    self.print_flow(self.block_index, phase);
                    if is_last && !phase.completed {
                        return self.print_notices(state.notices());
                    }
                }
            }
            self.block_index += 1;
        }

        self.print_notices(state.notices());
    }

    fn print_thinking(&mut self, block: &ThinkingBlock) {
        for line in &block.messages[self.thinking_lines..] {
            println!("  (thinking) {}", line);
        }
        self.thinking_lines = block.messages.len();
    }

    fn print_flow(&mut self, index: usize, phase: &FlowPhase) {
        if self.flow_index != Some(index) {
            self.flow_index = Some(index);
            self.flow = FlowCursor::default();
        }

        if !self.flow.plan {
            if let Some(plan) = &phase.plan {
                println!("plan: {}", plan);
                self.flow.plan = true;
            }
        }

        for step in &phase.steps[self.flow.steps_started..] {
            println!("-> {}", step.title);
            self.flow.steps_started += 1;
            self.flow.details = 0;
        }

        if let Some(step) = phase.steps.last() {
            for detail in &step.details[self.flow.details..] {
                println!("   {}: {}", detail.kind.as_str(), detail.content);
            }
            self.flow.details = step.details.len();
        }

        // Steps finish strictly in order, so a count is enough
        let finished = phase
            .steps
            .iter()
            .filter(|s| s.status.is_terminal())
            .count();
        for step in &phase.steps[self.flow.steps_finished..finished] {
            let mark = if step.status == StepStatus::Failed {
                "x"
            } else {
                "ok"
            };
            println!("   [{}] {}", mark, step.title);
        }
        self.flow.steps_finished = finished;

        if !self.flow.summary {
            if let Some(summary) = &phase.summary {
                println!("summary: {}", summary);
                self.flow.summary = true;
            }
        }
    }

    fn print_notices(&mut self, notices: &[Notice]) {
        for notice in &notices[self.notices_seen..] {
            match notice.kind {
                NoticeKind::Info => println!("[info] {}", notice.text),
                NoticeKind::Error => eprintln!("[error] {}", notice.text),
                NoticeKind::Connectivity => eprintln!("[connection] {}", notice.text),
            }
        }
        self.notices_seen = notices.len();
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}
