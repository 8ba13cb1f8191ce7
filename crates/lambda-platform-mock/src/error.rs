//! Error types for the mock platform.

use thiserror::Error;

/// Errors that can occur while running the mock platform.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Error binding the listener.
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),

    /// A wait helper gave up.
    #[error("Timeout occurred: {0}")]
    Timeout(String),

    /// No extension has subscribed to a stream yet.
    #[error("No stream subscription recorded")]
    NoSubscription,

    /// Pushing a batch to the subscribed destination failed.
    #[error("Failed to push batch: {0}")]
    Push(#[from] reqwest::Error),
}

/// Result type alias for mock platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;
