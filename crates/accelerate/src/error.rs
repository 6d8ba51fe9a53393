//! Error types for the analytics client.

/// Errors that can occur when using the analytics client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The ingest endpoint answered with a non-success status.
    #[error("Transport error: HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A deferred attribute or metric resolver failed.
    #[error("Failed to resolve value for {name}: {message}")]
    Resolve { name: String, message: String },

    /// Client has been shutdown.
    #[error("Client has been shutdown")]
    Shutdown,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
