//! Error types for batch decoding and the receiver.

use lambda_extensions_api::{BoxError, ClientError, ContextError};
use thiserror::Error;

/// Errors from decoding one pushed batch.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The body is not a JSON array.
    #[error("malformed json array: {0}")]
    MalformedArray(String),

    /// Reading the request body failed.
    #[error("could not read batch body")]
    Body(#[source] BoxError),

    /// An array element is not a `{type, time, record}` object.
    #[error("could not decode event from json array")]
    Element(#[source] serde_json::Error),

    /// An element carries a `type` this crate does not know.
    #[error("could not decode unknown event type {0:?}")]
    UnknownType(String),

    /// The `record` of an element does not match its `type`.
    #[error("could not decode record for event type {kind}")]
    Record {
        /// The element's `type`.
        kind: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Decoding was cancelled because the receiver is shutting down.
    #[error("decoding was interrupted")]
    Interrupted,

    /// The event channel is closed.
    #[error("event channel closed")]
    ChannelClosed,
}

/// Errors raised by the push-stream receiver.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// The processor's `init` failed.
    #[error("processor init failed")]
    ProcessorInit(#[source] BoxError),

    /// The processor's `process` failed. Later events are discarded.
    #[error("processor failed to process event")]
    Process(#[source] BoxError),

    /// The processor's `shutdown` failed.
    #[error("processor shutdown failed")]
    ProcessorShutdown(#[source] BoxError),

    /// The processing task panicked; the processor is lost.
    #[error("event processing task failed")]
    Worker(#[source] tokio::task::JoinError),

    /// The destination address could not be bound.
    #[error("could not bind event receiving HTTP server to {addr}")]
    Bind {
        /// Configured destination address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The destination address is not `host:port`.
    #[error("invalid destination address {0:?}, want host:port")]
    InvalidAddress(String),

    /// The HTTP server stopped with an error.
    #[error("event receiving HTTP server failed")]
    Server(#[source] std::io::Error),

    /// The HTTP server task panicked.
    #[error("event receiving HTTP server task failed")]
    ServerTask(#[source] tokio::task::JoinError),

    /// The HTTP server did not stop before the shutdown context ended.
    #[error("could not gracefully shut down event receiving HTTP server")]
    ServerShutdown(#[source] ContextError),

    /// Subscribing to the stream failed.
    #[error("could not subscribe to event stream")]
    Subscribe(#[source] ClientError),

    /// A batch arrived with a method other than `POST`.
    #[error("got unexpected HTTP request method {0}, want POST")]
    MethodNotAllowed(String),

    /// A batch failed to decode or was interrupted.
    #[error("decoding failed or interrupted")]
    Decode(#[from] DecodeError),

    /// An invoke event reached a receiver registered for shutdown only.
    #[error("unexpected invoke event, the receiver only registers for SHUTDOWN")]
    UnexpectedInvoke,

    /// `init` was called twice, or after `shutdown`.
    #[error("receiver already started")]
    AlreadyStarted,

    /// `shutdown` was called twice.
    #[error("receiver already shut down")]
    AlreadyShutDown,
}
