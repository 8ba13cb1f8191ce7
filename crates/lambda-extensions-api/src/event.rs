//! Extensions API wire types: registration metadata and lifecycle events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle event types an extension can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Function invocation.
    Invoke,
    /// Execution environment teardown.
    Shutdown,
}

/// Body of the register request.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RegisterRequest<'a> {
    pub events: &'a [EventType],
}

/// Function metadata returned by a successful registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Name of the function the extension is attached to.
    pub function_name: String,

    /// Function version, e.g. `$LATEST`.
    pub function_version: String,

    /// Function handler.
    pub handler: String,

    /// Account owning the function. Only present when the account id feature
    /// was requested at registration.
    #[serde(default)]
    pub account_id: String,
}

/// Event returned by the next event call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum NextEvent {
    /// A function invocation started.
    #[serde(rename = "INVOKE")]
    Invoke(InvokeEvent),

    /// The execution environment is shutting down.
    #[serde(rename = "SHUTDOWN")]
    Shutdown(ShutdownEvent),
}

impl NextEvent {
    /// Returns the absolute deadline of the event in epoch milliseconds.
    pub fn deadline_ms(&self) -> i64 {
        match self {
            NextEvent::Invoke(event) => event.deadline_ms,
            NextEvent::Shutdown(event) => event.deadline_ms,
        }
    }
}

/// Invocation details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeEvent {
    /// Epoch milliseconds by which the invocation must finish.
    pub deadline_ms: i64,

    /// Invocation request id.
    pub request_id: String,

    /// ARN the function was invoked through.
    pub invoked_function_arn: String,

    /// X-Ray tracing header.
    pub tracing: Tracing,
}

/// X-Ray tracing information attached to an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracing {
    /// Header type, always `X-Amzn-Trace-Id`.
    #[serde(rename = "type")]
    pub trace_type: String,

    /// Header value.
    pub value: String,
}

/// Shutdown details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownEvent {
    /// Why the environment is shutting down.
    pub shutdown_reason: ShutdownReason,

    /// Epoch milliseconds by which shutdown work must finish.
    pub deadline_ms: i64,
}

/// Reason carried by a shutdown event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownReason {
    /// Normal spindown of the environment.
    #[serde(rename = "spindown")]
    Spindown,

    /// The function timed out.
    #[serde(rename = "timeout")]
    Timeout,

    /// The function or runtime failed.
    #[serde(rename = "failure")]
    Failure,

    /// The extension itself failed. Never sent by the platform.
    #[serde(rename = "extension_error")]
    ExtensionError,
}

impl ShutdownReason {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Spindown => "spindown",
            ShutdownReason::Timeout => "timeout",
            ShutdownReason::Failure => "failure",
            ShutdownReason::ExtensionError => "extension_error",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ShutdownReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "spindown" => Ok(ShutdownReason::Spindown),
            "timeout" => Ok(ShutdownReason::Timeout),
            "failure" => Ok(ShutdownReason::Failure),
            "extension_error" => Ok(ShutdownReason::ExtensionError),
            _ => Err(serde::de::Error::unknown_variant(
                &s,
                &["spindown", "timeout", "failure", "extension_error"],
            )),
        }
    }
}

/// Acknowledgement returned by the init and exit error calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Status string, `OK` on success.
    pub status: String,
}
