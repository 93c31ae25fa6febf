//! Subscription management.
//!
//! One session follows one event stream at a time. The manager owns the
//! active stream, its ordering queue, and the reconciled view state, and
//! enforces the continuation rule: re-subscribing under the identity already
//! being followed keeps the view and appends a new phase, while any other
//! identity starts a fresh view.
//!
//! When the transport drops mid-stream, the manager retries a bounded number
//! of times with a fixed delay. Before each reconnect it polls the task's
//! status; a terminal status closes the session gracefully instead of
//! reconnecting into a stream that will never speak again. Once the retries
//! are spent, a connectivity notice is recorded and the session is left for
//! the user to re-subscribe manually.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::client::{ApiClient, EventStream, TaskStatus};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::event::{RawEvent, TaskIdentity};
use crate::interaction::InteractionSignal;
use crate::queue::OrderingQueue;
use crate::reconcile::{Applied, CloseReason, NoticeKind, SessionViewState};

/// Advice recorded when reconnecting is abandoned.
pub const RECONNECT_ADVICE: &str =
    "Connection lost. Re-subscribe to this session to resume following it.";

/// What [`SubscriptionManager::next_turn`] resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    /// The timeline or a notice changed; re-render
    Updated,
    /// An interaction is pending; prompt the user and answer it
    InteractionPending(InteractionSignal),
    /// The session reached a terminal state
    Closed(CloseReason),
    /// Reconnect attempts were exhausted; the session is stalled
    ConnectionLost,
}

enum Recovery {
    Reconnected,
    Closed(CloseReason),
    GaveUp,
}

struct ActiveSession {
    state: SessionViewState,
    stream: EventStream,
    queue: OrderingQueue,
}

/// Folds one arrived event through the queue into the view state.
///
/// Returns the strongest outcome observed during the drain: a close beats
/// an interaction, which beats a plain update. `None` means nothing
/// render-worthy happened and the caller should keep waiting.
fn pump(queue: &mut OrderingQueue, state: &mut SessionViewState, event: RawEvent) -> Option<Turn> {
    queue.push(event);

    let mut updated = false;
    let mut interaction: Option<InteractionSignal> = None;
    let mut closed: Option<CloseReason> = None;

    queue.drain(|ev| {
        match state.apply(&ev) {
            Applied::Ignored => {}
            Applied::Updated => updated = true,
            Applied::InteractionOpened(signal) => interaction = Some(signal),
            Applied::Closed(reason) => closed = Some(reason),
        }
        Ok(())
    });

    if let Some(reason) = closed {
        Some(Turn::Closed(reason))
    } else if let Some(signal) = interaction {
        Some(Turn::InteractionPending(signal))
    } else if updated {
        Some(Turn::Updated)
    } else {
        None
    }
}

/// Owns the single active subscription of a session.
pub struct SubscriptionManager {
    config: StreamConfig,
    session: Option<ActiveSession>,
}

impl SubscriptionManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Subscribe to a task's event stream.
    ///
    /// The identity currently being followed is continued: the timeline is
    /// kept and a fresh phase begins. Any other identity replaces the view.
    /// The previous stream, and anything still queued on it, is dropped.
    pub fn subscribe(&mut self, client: &ApiClient, identity: TaskIdentity) -> Result<()> {
        let stream = client.events(&identity)?;

        let state = match self.session.take() {
            Some(mut previous) if *previous.state.identity() == identity => {
                previous.stream.close();
                previous.queue.clear();
                previous.state.continue_session();
                info!(task = %identity, "continuing session");
                previous.state
            }
            other => {
                if let Some(mut previous) = other {
                    previous.stream.close();
                    info!(task = %previous.state.identity(), "replacing active subscription");
                }
                SessionViewState::new(identity.clone(), self.config.long_thought)
            }
        };

        self.session = Some(ActiveSession {
            state,
            stream,
            queue: OrderingQueue::new(),
        });
        Ok(())
    }

    /// The reconciled view of the active session, if any.
    pub fn state(&self) -> Option<&SessionViewState> {
        self.session.as_ref().map(|s| &s.state)
    }

    pub fn state_mut(&mut self) -> Option<&mut SessionViewState> {
        self.session.as_mut().map(|s| &mut s.state)
    }

    /// Drop the active subscription, keeping nothing queued.
    pub fn unsubscribe(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stream.close();
            let dropped = session.queue.clear();
            if dropped > 0 {
                warn!(dropped, "dropped undrained events on unsubscribe");
            }
        }
    }

    /// Wait for the next render-worthy change on the active stream.
    ///
    /// Decode failures are logged and skipped. Transport failures go through
    /// the bounded reconnect path before this returns `ConnectionLost`.
    pub async fn next_turn(&mut self, client: &ApiClient) -> Result<Turn> {
        if self.session.is_none() {
            return Err(Error::Protocol("no active subscription".to_string()));
        }

        loop {
            let session = match self.session.as_mut() {
                Some(s) => s,
                None => return Err(Error::Protocol("no active subscription".to_string())),
            };

            match session.stream.next_event().await {
                Some(Ok(event)) => {
                    match pump(&mut session.queue, &mut session.state, event) {
                        Some(Turn::Closed(reason)) => {
                            session.stream.close();
                            session.queue.clear();
                            return Ok(Turn::Closed(reason));
                        }
                        Some(turn) => return Ok(turn),
                        // Nothing changed; wait for the next event
                        None => continue,
                    }
                }
                Some(Err(Error::Decode { kind, message })) => {
                    warn!(kind = %kind, error = %message, "undecodable event, skipping");
                    continue;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "event stream failed");
                    match self.recover(client).await {
                        Recovery::Reconnected => continue,
                        Recovery::Closed(reason) => return Ok(Turn::Closed(reason)),
                        Recovery::GaveUp => return Ok(Turn::ConnectionLost),
                    }
                }
                None => {
                    // Stream ended without a terminal event; ask the server
                    info!("event stream ended without terminal event");
                    match self.recover(client).await {
                        Recovery::Reconnected => continue,
                        Recovery::Closed(reason) => return Ok(Turn::Closed(reason)),
                        Recovery::GaveUp => return Ok(Turn::ConnectionLost),
                    }
                }
            }
        }
    }

    /// Bounded reconnect: poll status, reconnect if the task still runs.
    async fn recover(&mut self, client: &ApiClient) -> Recovery {
        let Some(session) = self.session.as_mut() else {
            return Recovery::GaveUp;
        };
        let identity = session.state.identity().clone();

        for attempt in 1..=self.config.max_retries {
            sleep(Duration::from_secs(self.config.retry_delay_secs)).await;

            match client.status(&identity).await {
                Ok(status) if status.is_terminal() => {
                    let reason = match status {
                        TaskStatus::Completed => CloseReason::Completed,
                        TaskStatus::Terminated => CloseReason::Terminated,
                        TaskStatus::Failed(reason) => {
                            let text =
                                reason.unwrap_or_else(|| "task failed".to_string());
                            session.state.push_notice(NoticeKind::Error, text);
                            CloseReason::Errored
                        }
                        // is_terminal() only matches the three above
                        _ => CloseReason::Errored,
                    };
                    info!(task = %identity, "task finished while disconnected");
                    session.state.close(reason);
                    session.queue.clear();
                    return Recovery::Closed(reason);
                }
                Ok(_) => match client.events(&identity) {
                    Ok(stream) => {
                        info!(task = %identity, attempt, "reconnected to event stream");
                        session.stream = stream;
                        return Recovery::Reconnected;
                    }
                    Err(e) => {
                        warn!(task = %identity, attempt, error = %e, "reconnect failed");
                    }
                },
                Err(e) => {
                    warn!(task = %identity, attempt, error = %e, "status poll failed");
                }
            }
        }

        warn!(task = %identity, retries = self.config.max_retries, "giving up on reconnect");
        session
            .state
            .push_notice(NoticeKind::Connectivity, RECONNECT_ADVICE);
        session.queue.clear();
        Recovery::GaveUp
    }
}
