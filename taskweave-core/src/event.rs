//! Event envelope decoding for the backend's SSE streams.
//!
//! Each stream record arrives as a named SSE event whose `data:` line carries
//! a JSON object. [`decode`] turns one record into a typed [`RawEvent`]; the
//! kind label becomes a closed [`EventKind`] so the reconciler can match on it
//! exhaustively. Unknown labels are preserved (not rejected) and ignored
//! downstream.

use chrono::Utc;
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================
// Event kinds
// ============================================

/// The kind label carried by a stream record.
///
/// Labels outside the known set are kept verbatim in [`EventKind::Unknown`];
/// the reconciler logs and ignores them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Think,
    StepStart,
    Step,
    StepFinish,
    Act,
    Log,
    Tool,
    Run,
    Message,
    Plan,
    Summary,
    Interaction,
    Complete,
    Terminated,
    Error,
    /// Any label we do not recognize, preserved as received
    Unknown(String),
}

impl EventKind {
    /// Parse an SSE event label. Never fails; unknown labels are preserved.
    pub fn from_label(label: &str) -> Self {
        match label {
            "think" => EventKind::Think,
            "step_start" => EventKind::StepStart,
            "step" => EventKind::Step,
            "step_finish" => EventKind::StepFinish,
            "act" => EventKind::Act,
            "log" => EventKind::Log,
            "tool" => EventKind::Tool,
            "run" => EventKind::Run,
            "message" => EventKind::Message,
            "plan" => EventKind::Plan,
            "summary" => EventKind::Summary,
            "interaction" => EventKind::Interaction,
            "complete" => EventKind::Complete,
            "terminated" => EventKind::Terminated,
            "error" => EventKind::Error,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Think => "think",
            EventKind::StepStart => "step_start",
            EventKind::Step => "step",
            EventKind::StepFinish => "step_finish",
            EventKind::Act => "act",
            EventKind::Log => "log",
            EventKind::Tool => "tool",
            EventKind::Run => "run",
            EventKind::Message => "message",
            EventKind::Plan => "plan",
            EventKind::Summary => "summary",
            EventKind::Interaction => "interaction",
            EventKind::Complete => "complete",
            EventKind::Terminated => "terminated",
            EventKind::Error => "error",
            EventKind::Unknown(label) => label,
        }
    }

    /// Terminal kinds close the subscription once processed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Complete | EventKind::Terminated | EventKind::Error
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Task identity
// ============================================

/// The two identity spaces the backend schedules work in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySpace {
    /// Direct agent task (`/tasks/...` endpoints)
    Task,
    /// Plan-driven flow (`/flows/...` endpoints)
    Flow,
}

impl IdentitySpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySpace::Task => "task",
            IdentitySpace::Flow => "flow",
        }
    }

    /// URL path segment for this space's endpoints.
    pub fn path_segment(&self) -> &'static str {
        match self {
            IdentitySpace::Task => "tasks",
            IdentitySpace::Flow => "flows",
        }
    }
}

impl std::str::FromStr for IdentitySpace {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "task" => Ok(IdentitySpace::Task),
            "flow" => Ok(IdentitySpace::Flow),
            _ => Err(format!("unknown identity space: {}", s)),
        }
    }
}

/// One subscription's identity: an opaque id scoped to a space.
///
/// Re-subscribing with the same identity is a continuation (state retained);
/// any other id in the same session is a reset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskIdentity {
    pub space: IdentitySpace,
    pub id: String,
}

impl TaskIdentity {
    pub fn task(id: impl Into<String>) -> Self {
        Self {
            space: IdentitySpace::Task,
            id: id.into(),
        }
    }

    pub fn flow(id: impl Into<String>) -> Self {
        Self {
            space: IdentitySpace::Flow,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.space.as_str(), self.id)
    }
}

// ============================================
// Raw events
// ============================================

/// A decoded stream record, ready for the ordering queue.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Kind label from the SSE `event:` field
    pub kind: EventKind,
    /// Opaque JSON payload from the `data:` field
    pub payload: Value,
    /// Server timestamp in milliseconds, if the payload carried one
    pub timestamp: Option<i64>,
    /// Local receive time in milliseconds (ordering fallback)
    pub received_at: i64,
    /// Monotonic arrival counter (ordering tie-break)
    pub arrival: u64,
}

impl RawEvent {
    /// The payload's `result` string, if present.
    pub fn result_text(&self) -> Option<&str> {
        self.payload.get("result").and_then(Value::as_str)
    }

    /// The payload's `message` string, if present.
    pub fn message_text(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }

    /// Display text: `result`, falling back to `message`, falling back to "".
    pub fn text(&self) -> &str {
        self.result_text().or_else(|| self.message_text()).unwrap_or("")
    }

    /// Ordering key: server timestamp when present, local receive time
    /// otherwise, with arrival order as the tie-break. Equal keys are never
    /// reordered.
    pub fn ordering_key(&self) -> (i64, u64) {
        (self.timestamp.unwrap_or(self.received_at), self.arrival)
    }
}

/// Decode one stream record into a [`RawEvent`].
///
/// Fails with [`Error::Decode`] when the payload is not valid JSON. Callers
/// log and drop the record; a decode failure never blocks the pipeline.
pub fn decode(kind_label: &str, data: &str, arrival: u64) -> Result<RawEvent> {
    let payload: Value = serde_json::from_str(data).map_err(|e| Error::Decode {
        kind: kind_label.to_string(),
        message: e.to_string(),
    })?;

    let timestamp = payload.get("timestamp").and_then(|v| {
        // Backends vary between integral and fractional millis
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    });

    Ok(RawEvent {
        kind: EventKind::from_label(kind_label),
        payload,
        timestamp,
        received_at: Utc::now().timestamp_millis(),
        arrival,
    })
}
