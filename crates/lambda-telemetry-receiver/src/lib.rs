//! Push-based receiver for the AWS Lambda Telemetry and Logs APIs.
//!
//! Both APIs deliver records by POSTing JSON array batches to an HTTP server
//! the extension runs itself. This crate runs that server, decodes each batch
//! incrementally, and hands the records to a [`Processor`] one at a time and
//! in order, all driven through the lifecycle loop of
//! [`lambda_extensions_api::run`].
//!
//! - [`telemetry::run`] subscribes to the Telemetry API.
//! - [`logs::run`] subscribes to the older Logs API.
//!
//! On shutdown the receiver stops accepting batches, processes every record
//! it already accepted, and only then calls [`Processor::shutdown`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod decode;
pub mod error;
pub mod logs;
mod receiver;
pub mod telemetry;

pub use decode::{ArrayScanner, DecodeFn, decode_batch};
pub use error::{DecodeError, ReceiverError};
pub use receiver::Processor;
