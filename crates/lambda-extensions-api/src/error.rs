//! Error types for the Extensions API client and run loop.

use crate::context::ContextError;
use serde::Deserialize;
use thiserror::Error;

/// Boxed error returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error body returned by the platform with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Error)]
#[error("Lambda API returned status {status}: type={error_type}, message={message}")]
pub struct ApiError {
    /// HTTP status code of the response.
    #[serde(skip)]
    pub status: u16,

    /// Platform error type, e.g. `ValidationError`.
    #[serde(rename = "errorType")]
    pub error_type: String,

    /// Human readable description.
    #[serde(rename = "errorMessage")]
    pub message: String,
}

/// Errors from a single Extensions API call.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ClientError {
    /// `AWS_LAMBDA_RUNTIME_API` is unset and no address was configured.
    #[error("could not find environment variable AWS_LAMBDA_RUNTIME_API")]
    MissingRuntimeApi,

    /// Transport failure.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// The platform rejected the call with a structured error.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The platform rejected the call and the body was not a structured error.
    #[error("HTTP request failed with status {status} and body: {body}")]
    UnexpectedStatus {
        /// HTTP status code returned by the platform.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// A successful response carried a body that could not be decoded.
    #[error("could not decode response body: {body}")]
    Decode {
        /// Raw response body.
        body: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A request body could not be encoded.
    #[error("could not encode request body")]
    Encode(#[source] serde_json::Error),

    /// Registration succeeded but the identifier header was absent.
    #[error("could not find extension ID in register response header Lambda-Extension-Identifier")]
    MissingExtensionId,

    /// The call was abandoned because its context stopped.
    #[error("request interrupted")]
    Context(#[from] ContextError),
}

impl ClientError {
    /// Returns the structured platform error, if this is one.
    pub fn as_api_error(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors that end [`run`](crate::run::run).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RunError {
    /// Registration failed; nothing else was started.
    #[error("could not register extension")]
    Register(#[source] ClientError),

    /// The extension's `init` callback failed.
    #[error("extension init failed")]
    Init(#[source] BoxError),

    /// Polling for the next lifecycle event failed.
    #[error("next event call failed")]
    NextEvent(#[source] ClientError),

    /// The background task polling for the next event panicked.
    #[error("next event task failed")]
    Task(#[source] tokio::task::JoinError),

    /// The extension's `handle_invoke` callback failed.
    #[error("extension failed to handle invoke event")]
    Invoke(#[source] BoxError),

    /// The extension reported an error through its error signal.
    #[error("extension signaled an error")]
    Signaled(#[source] BoxError),

    /// The parent context stopped before a shutdown event arrived.
    #[error("context stopped before shutdown event")]
    Cancelled(#[source] ContextError),

    /// The extension's `shutdown` callback failed.
    #[error("extension shutdown failed")]
    Shutdown(#[source] BoxError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_api_error_decodes_platform_body() {
        let body = r#"{"errorType": "ValidationError", "errorMessage": "URI port is not provided"}"#;
        let mut err: ApiError = serde_json::from_str(body).unwrap();
        err.status = 400;

        assert_eq!(
            err,
            ApiError {
                status: 400,
                error_type: "ValidationError".to_string(),
                message: "URI port is not provided".to_string(),
            }
        );
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("ValidationError"));
    }

    #[test]
    fn test_run_error_keeps_source() {
        let err = RunError::Init("boom".into());

        assert_eq!(err.to_string(), "extension init failed");
        assert_eq!(err.source().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_as_api_error() {
        let api = ApiError {
            status: 403,
            error_type: "Forbidden".to_string(),
            message: "nope".to_string(),
        };
        let err = ClientError::from(api.clone());

        assert_eq!(err.as_api_error(), Some(&api));
        assert!(ClientError::MissingExtensionId.as_api_error().is_none());
    }
}
