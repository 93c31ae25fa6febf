//! Error types for taskweave-core

use thiserror::Error;

/// Main error type for the taskweave-core library
#[derive(Error, Debug)]
pub enum Error {
    /// A stream record could not be decoded (dropped and logged, never fatal)
    #[error("decode error in {kind} record: {message}")]
    Decode { kind: String, message: String },

    /// The event stream connection was lost
    #[error("transport error: {0}")]
    Transport(String),

    /// A REST call to the backend failed
    #[error("request error: {0}")]
    Request(String),

    /// An event referenced a step or identity that does not exist
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// History cache error
    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for taskweave-core
pub type Result<T> = std::result::Result<T, Error>;
