//! HTTP client for the agent backend
//!
//! Covers the full session surface: scheduling work in either identity
//! space, subscribing to the per-task SSE event stream, answering
//! interactions, terminating, polling status, and fetching server-side
//! history.
//!
//! Two underlying reqwest clients are kept: one with a request timeout for
//! the JSON endpoints, and one without for the event stream, which stays
//! open for the lifetime of a task.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event::{self, IdentitySpace, RawEvent, TaskIdentity};

/// Response from POST /tasks and POST /flows
#[derive(Debug, Deserialize)]
pub struct CreateResponse {
    /// Identifier of the scheduled task or flow
    pub task_id: String,
}

/// One persisted chat turn, as the backend stores and replays it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// Response from GET /sessions/{session_id}/history
#[derive(Debug, Deserialize)]
pub struct SessionHistory {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub chat_history: Vec<HistoryTurn>,
}

/// One scheduled task or flow in the aggregate history listing
#[derive(Debug, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Response from GET /sessions/history
#[derive(Debug, Deserialize)]
pub struct AggregateHistory {
    #[serde(default)]
    pub chat_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub flow_history: Vec<HistoryEntry>,
}

// ============================================
// Task status
// ============================================

/// Server-side status of a task or flow.
///
/// A failure arrives as the string `failed: {reason}`, so parsing goes by
/// prefix rather than exact match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Terminated,
    Failed(Option<String>),
    Other(String),
}

impl TaskStatus {
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "terminated" => TaskStatus::Terminated,
            _ if trimmed.starts_with("failed") => {
                let reason = trimmed
                    .strip_prefix("failed")
                    .map(|r| r.trim_start_matches(':').trim())
                    .filter(|r| !r.is_empty())
                    .map(str::to_string);
                TaskStatus::Failed(reason)
            }
            other => TaskStatus::Other(other.to_string()),
        }
    }

    /// Terminal statuses mean no more events will ever arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Terminated | TaskStatus::Failed(_)
        )
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    prompt: &'a str,
    session_id: &'a str,
    chat_history: &'a [HistoryTurn],
}

#[derive(Debug, Serialize)]
struct InteractRequest<'a> {
    response: &'a str,
}

fn build_endpoint(base_url: &str, space: IdentitySpace, id: &str, suffix: &str) -> String {
    let mut url = format!(
        "{}/{}/{}",
        base_url.trim_end_matches('/'),
        space.path_segment(),
        urlencoding::encode(id)
    );
    if !suffix.is_empty() {
        url.push('/');
        url.push_str(suffix);
    }
    url
}

// ============================================
// Client
// ============================================

/// HTTP client for the agent backend API
pub struct ApiClient {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new client from server configuration.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config.base_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers.clone())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        // No overall timeout here: the event stream lives as long as the task
        let stream_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            stream_http,
            base_url,
        })
    }

    /// Schedule a new task or flow. Returns its identity.
    pub async fn create(
        &self,
        space: IdentitySpace,
        prompt: &str,
        session_id: &str,
        chat_history: &[HistoryTurn],
    ) -> Result<TaskIdentity> {
        let url = format!("{}/{}", self.base_url, space.path_segment());
        let request = CreateRequest {
            prompt,
            session_id,
            chat_history,
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Request(format!("HTTP request failed: {}", e)))?;

        let created: CreateResponse = Self::parse_response(response).await?;
        debug!(space = space.as_str(), task_id = %created.task_id, "scheduled");
        Ok(TaskIdentity {
            space,
            id: created.task_id,
        })
    }

    /// Open the SSE event stream for a task.
    pub fn events(&self, identity: &TaskIdentity) -> Result<EventStream> {
        let url = build_endpoint(&self.base_url, identity.space, &identity.id, "events");
        let source = EventSource::new(self.stream_http.get(&url))
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(EventStream {
            source: Some(source),
            arrival: 0,
        })
    }

    /// Submit the user's answer to a pending interaction.
    pub async fn interact(&self, identity: &TaskIdentity, answer: &str) -> Result<()> {
        let url = build_endpoint(&self.base_url, identity.space, &identity.id, "interact");
        let response = self
            .http
            .post(&url)
            .json(&InteractRequest { response: answer })
            .send()
            .await
            .map_err(|e| Error::Request(format!("HTTP request failed: {}", e)))?;

        let _: serde_json::Value = Self::parse_response(response).await?;
        Ok(())
    }

    /// Ask the backend to terminate a running task.
    pub async fn terminate(&self, identity: &TaskIdentity) -> Result<()> {
        let url = build_endpoint(&self.base_url, identity.space, &identity.id, "terminate");
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Request(format!("HTTP request failed: {}", e)))?;

        let _: serde_json::Value = Self::parse_response(response).await?;
        Ok(())
    }

    /// Poll the current status of a task. Used after a stream drop to decide
    /// whether reconnecting is worth it.
    pub async fn status(&self, identity: &TaskIdentity) -> Result<TaskStatus> {
        let url = build_endpoint(&self.base_url, identity.space, &identity.id, "");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Request(format!("HTTP request failed: {}", e)))?;

        let status: StatusResponse = Self::parse_response(response).await?;
        Ok(TaskStatus::parse(&status.status))
    }

    /// Fetch the replayable chat history of one session.
    pub async fn session_history(&self, session_id: &str) -> Result<SessionHistory> {
        let url = format!(
            "{}/sessions/{}/history",
            self.base_url,
            urlencoding::encode(session_id)
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Request(format!("HTTP request failed: {}", e)))?;

        Self::parse_response(response).await
    }

    /// Fetch the server-wide task and flow listing.
    pub async fn aggregate_history(&self) -> Result<AggregateHistory> {
        let url = format!("{}/sessions/history", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Request(format!("HTTP request failed: {}", e)))?;

        Self::parse_response(response).await
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Request(format!("failed to parse response: {}", e)))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Request(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }
}

// ============================================
// Event stream
// ============================================

/// One task's SSE stream, yielding decoded [`RawEvent`]s.
///
/// The arrival counter lives here, so it resets with each new stream and
/// events from one connection never tie-break against another's.
pub struct EventStream {
    source: Option<EventSource>,
    arrival: u64,
}

impl EventStream {
    /// Next decoded event.
    ///
    /// `None` means the server closed the stream. A decode failure is
    /// returned as `Error::Decode`; a connection failure as
    /// `Error::Transport`, after which the stream is done.
    pub async fn next_event(&mut self) -> Option<Result<RawEvent>> {
        use futures::StreamExt;

        loop {
            let item = self.source.as_mut()?.next().await?;
            match item {
                Ok(SseEvent::Open) => continue,
                Ok(SseEvent::Message(msg)) => {
                    let arrival = self.arrival;
                    self.arrival += 1;
                    return Some(event::decode(&msg.event, &msg.data, arrival));
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    self.close();
                    return None;
                }
                Err(e) => {
                    self.close();
                    return Some(Err(Error::Transport(e.to_string())));
                }
            }
        }
    }

    /// Drop the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_building() {
        assert_eq!(
            build_endpoint("http://localhost:5172", IdentitySpace::Task, "abc", "events"),
            "http://localhost:5172/tasks/abc/events"
        );
        assert_eq!(
            build_endpoint("http://localhost:5172/", IdentitySpace::Flow, "f1", "terminate"),
            "http://localhost:5172/flows/f1/terminate"
        );
        // Status polls hit the bare resource
        assert_eq!(
            build_endpoint("http://h", IdentitySpace::Task, "t1", ""),
            "http://h/tasks/t1"
        );
    }

    #[test]
    fn test_endpoint_encodes_id() {
        assert_eq!(
            build_endpoint("http://h", IdentitySpace::Task, "a/b c", "events"),
            "http://h/tasks/a%2Fb%20c/events"
        );
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(TaskStatus::parse("running"), TaskStatus::Running);
        assert_eq!(TaskStatus::parse("completed"), TaskStatus::Completed);
        assert_eq!(TaskStatus::parse("terminated"), TaskStatus::Terminated);
        assert_eq!(
            TaskStatus::parse("failed: model unavailable"),
            TaskStatus::Failed(Some("model unavailable".to_string()))
        );
        assert_eq!(TaskStatus::parse("failed"), TaskStatus::Failed(None));
        assert_eq!(
            TaskStatus::parse("pending"),
            TaskStatus::Pending
        );
    }

    #[test]
    fn test_status_terminality() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Terminated.is_terminal());
        assert!(TaskStatus::Failed(None).is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Other("queued".to_string()).is_terminal());
    }

    #[test]
    fn test_parse_session_history() {
        let json = r#"{
            "session_id": "s1",
            "chat_history": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }"#;
        let history: SessionHistory = serde_json::from_str(json).unwrap();
        assert_eq!(history.session_id.as_deref(), Some("s1"));
        assert_eq!(history.chat_history.len(), 2);
        assert_eq!(history.chat_history[0].role, "user");
    }

    #[test]
    fn test_parse_aggregate_history() {
        let json = r#"{
            "chat_history": [{"id": "t1", "prompt": "plan a trip"}],
            "flow_history": []
        }"#;
        let history: AggregateHistory = serde_json::from_str(json).unwrap();
        assert_eq!(history.chat_history.len(), 1);
        assert_eq!(history.chat_history[0].id, "t1");
        assert!(history.flow_history.is_empty());
    }
}
