//! # taskweave-core
//!
//! Core library for taskweave - a terminal client for asynchronous agent
//! backends.
//!
//! This library provides:
//! - Event decoding for the backend's per-task SSE streams
//! - An ordering queue and timeline reconciler turning events into a view
//! - Interaction detection for agent questions that need a human answer
//! - Subscription management with bounded reconnect
//! - A local SQLite history cache for session restore
//!
//! ## Architecture
//!
//! Events flow through a single pipeline:
//! - **Decode:** SSE records become typed [`event::RawEvent`]s
//! - **Order:** the [`queue::OrderingQueue`] sorts them by timestamp
//! - **Reconcile:** [`reconcile::SessionViewState`] folds them into blocks
//! - **Drive:** the [`subscription::SubscriptionManager`] owns the stream,
//!   retries transport drops, and surfaces interactions
//!
//! ## Example
//!
//! ```rust,no_run
//! use taskweave_core::{ApiClient, Config, SubscriptionManager};
//! use taskweave_core::event::IdentitySpace;
//!
//! # async fn demo() -> taskweave_core::Result<()> {
//! let config = Config::load()?;
//! let client = ApiClient::new(&config.server)?;
//! let mut manager = SubscriptionManager::new(config.stream.clone());
//!
//! let identity = client
//!     .create(IdentitySpace::Task, "plan my week", "session-1", &[])
//!     .await?;
//! manager.subscribe(&client, identity)?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use client::{ApiClient, TaskStatus};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventKind, IdentitySpace, RawEvent, TaskIdentity};
pub use history::{HistoryStore, SessionSnapshot, SessionSummary, SqliteHistory};
pub use reconcile::{Applied, CloseReason, SessionViewState};
pub use subscription::{SubscriptionManager, Turn};

// Public modules
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod history;
pub mod interaction;
pub mod logging;
pub mod queue;
pub mod reconcile;
pub mod subscription;
pub mod timeline;
