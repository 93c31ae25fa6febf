//! Timeline view model.
//!
//! The timeline is the ordered sequence of blocks the rendering surface
//! draws: plain chat messages, collapsible thinking groups, and flow phases
//! (plan / steps / summary). Blocks are created and mutated only by the
//! reconciler, and are retired — marked completed — rather than deleted, so
//! scroll-back always survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Chat messages
// ============================================

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        }
    }
}

impl std::str::FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ChatRole::User),
            // Some backends label assistant turns "ai"
            "assistant" | "ai" => Ok(ChatRole::Assistant),
            "system" => Ok(ChatRole::System),
            _ => Err(format!("unknown chat role: {}", s)),
        }
    }
}

/// A single rendered chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

// ============================================
// Thinking groups
// ============================================

/// A collapsible group of consecutive `think` lines (long-thought mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub messages: Vec<String>,
    pub completed: bool,
}

impl ThinkingBlock {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
            completed: false,
        }
    }
}

// ============================================
// Flow steps
// ============================================

/// Lifecycle of a step within a flow phase.
///
/// Transitions are monotonic: `completed` and `failed` are terminal, and a
/// step never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            _ => Err(format!("unknown step status: {}", s)),
        }
    }
}

/// Kind of a step sub-event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDetailKind {
    Think,
    Act,
}

impl StepDetailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepDetailKind::Think => "think",
            StepDetailKind::Act => "act",
        }
    }
}

/// A think/act sub-event attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDetail {
    pub kind: StepDetailKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One step of a flow phase's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub title: String,
    pub status: StepStatus,
    pub details: Vec<StepDetail>,
}

impl StepRecord {
    pub fn new(index: usize, title: impl Into<String>) -> Self {
        Self {
            id: format!("step_{}", index + 1),
            title: title.into(),
            status: StepStatus::Running,
            details: Vec::new(),
        }
    }

    /// Apply a status transition, enforcing monotonicity.
    ///
    /// Returns false (and leaves the status untouched) when the transition
    /// would regress, e.g. `completed` back to `running`.
    pub fn transition(&mut self, next: StepStatus) -> bool {
        let allowed = match (self.status, next) {
            (a, b) if a == b => false,
            (StepStatus::Pending, _) => true,
            (StepStatus::Running, StepStatus::Completed | StepStatus::Failed) => true,
            _ => false,
        };
        if allowed {
            self.status = next;
        }
        allowed
    }

    pub fn push_detail(&mut self, kind: StepDetailKind, content: impl Into<String>) {
        self.details.push(StepDetail {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }
}

// ============================================
// Flow phases
// ============================================

/// One execution phase of a flow: plan, steps, and summary.
///
/// A continuation after an interaction pause appends a fresh phase rather
/// than clearing the previous one, so earlier phases stay visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPhase {
    /// 1-based phase counter within the session
    pub phase: u32,
    pub plan: Option<String>,
    pub steps: Vec<StepRecord>,
    pub summary: Option<String>,
    pub completed: bool,
}

impl FlowPhase {
    pub fn new(phase: u32) -> Self {
        Self {
            phase,
            plan: None,
            steps: Vec::new(),
            summary: None,
            completed: false,
        }
    }

    /// The highest-index step, if any.
    pub fn current_step(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn current_step_mut(&mut self) -> Option<&mut StepRecord> {
        self.steps.last_mut()
    }

    /// Start a new step. Any step still running is retired first, keeping
    /// the at-most-one-running invariant.
    pub fn start_step(&mut self, title: impl Into<String>) -> &mut StepRecord {
        for step in &mut self.steps {
            if step.status == StepStatus::Running {
                step.transition(StepStatus::Completed);
            }
        }
        let index = self.steps.len();
        self.steps.push(StepRecord::new(index, title));
        &mut self.steps[index]
    }

    /// Complete the current step. Returns false when there is no step to
    /// complete or the transition would regress.
    pub fn finish_current_step(&mut self) -> bool {
        match self.current_step_mut() {
            Some(step) => step.transition(StepStatus::Completed),
            None => false,
        }
    }

    /// Append a think/act detail to the current step.
    ///
    /// When the current step has already finished, a synthetic placeholder
    /// step is created first so late details are never lost.
    pub fn add_detail(&mut self, kind: StepDetailKind, content: impl Into<String>) -> bool {
        let needs_placeholder = match self.current_step() {
            Some(step) => step.status.is_terminal(),
            None => false,
        };
        if needs_placeholder {
            let index = self.steps.len();
            let title = format!("Step {}", index + 1);
            self.steps.push(StepRecord::new(index, title));
        }
        match self.current_step_mut() {
            Some(step) => {
                step.push_detail(kind, content);
                true
            }
            None => false,
        }
    }
}

// ============================================
// Blocks
// ============================================

/// One entry of the rendered timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Thinking(ThinkingBlock),
    Chat(ChatMessage),
    Flow(FlowPhase),
}

impl Block {
    /// The chat role this block renders under, if it renders as a turn.
    pub fn chat_role(&self) -> Option<ChatRole> {
        match self {
            Block::Chat(msg) => Some(msg.role),
            _ => None,
        }
    }
}
