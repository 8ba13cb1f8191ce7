//! Workspace package for the Lambda extensions client and telemetry receiver.
//!
//! It holds the end-to-end tests under `tests/`, which drive the receivers
//! against an in-process mock of the platform API. The functionality lives in
//! the member crates:
//!
//! - [`lambda_extensions_api`]: Extensions API client, lifecycle run loop,
//!   subscription requests and configuration
//! - [`lambda_telemetry_receiver`]: push-based receivers for the Logs and
//!   Telemetry APIs

pub use lambda_extensions_api;
pub use lambda_telemetry_receiver;
