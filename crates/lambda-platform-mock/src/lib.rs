//! In-process mock of the AWS Lambda platform APIs an extension talks to.
//!
//! The mock serves the Extensions API (register, next event, init and exit
//! errors) and the Logs and Telemetry subscription endpoints on a free port of
//! 127.0.0.1. Lifecycle events are queued by the test; subscriptions and error
//! reports are recorded for inspection; batches can be pushed to whatever
//! destination an extension subscribed with.
//!
//! ```no_run
//! use lambda_platform_mock::MockPlatform;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let platform = MockPlatform::start().await?;
//! platform.enqueue_shutdown("spindown", i64::MAX).await;
//! // Point the extension at platform.runtime_api() and run it.
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
mod extensions_api;
pub mod platform;
pub mod state;
mod subscription_api;

pub use error::{PlatformError, PlatformResult};
pub use platform::{MockPlatform, MockPlatformBuilder};
pub use state::{
    CannedFailure, ErrorKind, ErrorReport, RecordedRegistration, RecordedSubscription, StreamKind,
};
