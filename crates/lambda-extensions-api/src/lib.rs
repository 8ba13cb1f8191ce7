//! Client and run loop for the AWS Lambda Extensions API.
//!
//! An extension registers with the platform, then long-polls for lifecycle
//! events until the execution environment shuts down. [`run`] drives that
//! protocol and turns it into [`Extension`] callbacks with deadline
//! propagation and first-error-wins failure handling.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod event;
pub mod run;
pub mod signal;
pub mod subscribe;

pub use client::{
    Client, ClientBuilder, EXTENSION_ID_HEADER, EXTENSION_NAME_HEADER, FUNCTION_ERROR_TYPE_HEADER,
};
pub use config::{BufferingSettings, ConfigBuilder, DEFAULT_DESTINATION_ADDR, ExtensionConfig};
pub use context::{ContextError, ExtensionContext};
pub use error::{ApiError, BoxError, ClientError, RunError};
pub use event::{
    ErrorResponse, EventType, InvokeEvent, NextEvent, Registration, ShutdownEvent, ShutdownReason,
    Tracing,
};
pub use run::{EXIT_ERROR_TYPE, Extension, INIT_ERROR_TYPE, run};
pub use signal::{ErrorReporter, ErrorSignal, error_signal};
pub use subscribe::{
    BufferingConfig, DestinationProtocol, HttpEncoding, HttpMethod, LogsDestination,
    LogsSubscribeRequest, SubscriptionType, TelemetryDestination, TelemetrySubscribeRequest,
};
