//! Accessors for the environment variables Lambda sets for extensions.

use std::env;

/// Address of the runtime API, `host:port`.
pub const AWS_LAMBDA_RUNTIME_API: &str = "AWS_LAMBDA_RUNTIME_API";

/// Returns the runtime API address, or `None` when unset or empty.
pub fn runtime_api() -> Option<String> {
    non_empty(AWS_LAMBDA_RUNTIME_API)
}

/// Returns the X-Ray tracing header of the current invocation.
pub fn x_amzn_trace_id() -> Option<String> {
    non_empty("_X_AMZN_TRACE_ID")
}

/// Returns the region the function runs in.
pub fn aws_region() -> Option<String> {
    non_empty("AWS_REGION")
}

/// Returns the function name.
pub fn function_name() -> Option<String> {
    non_empty("AWS_LAMBDA_FUNCTION_NAME")
}

/// Returns the configured memory size in MB, or 0 when unset or invalid.
pub fn function_memory_size_mb() -> u32 {
    non_empty("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Returns the function version.
pub fn function_version() -> Option<String> {
    non_empty("AWS_LAMBDA_FUNCTION_VERSION")
}

/// Returns the initialization type, e.g. `on-demand` or `provisioned-concurrency`.
pub fn initialization_type() -> Option<String> {
    non_empty("AWS_LAMBDA_INITIALIZATION_TYPE")
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}
