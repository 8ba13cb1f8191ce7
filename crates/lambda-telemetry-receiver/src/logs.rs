//! Logs API receiver.
//!
//! The Logs API is the predecessor of the Telemetry API. A process may
//! subscribe to one of the two, not both. [`run`] works like
//! [`telemetry::run`](crate::telemetry::run) but delivers [`Log`] records.

use crate::error::DecodeError;
use crate::receiver::{Processor, PushStream, StreamReceiver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lambda_extensions_api::{
    BufferingConfig, Client, ClientBuilder, ClientError, DEFAULT_DESTINATION_ADDR, EventType,
    ExtensionConfig, ExtensionContext, LogsSubscribeRequest, RunError, SubscriptionType, Tracing,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record pushed by the Logs API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Log {
    /// When the record was generated.
    pub time: DateTime<Utc>,
    /// The typed payload.
    pub record: LogRecord,
}

/// Logs API payload, selected by the element's `type`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "record")]
pub enum LogRecord {
    /// Invocation started.
    #[serde(rename = "platform.start")]
    Start(StartRecord),
    /// Invocation ended.
    #[serde(rename = "platform.end")]
    End(EndRecord),
    /// Report of an invocation.
    #[serde(rename = "platform.report")]
    Report(ReportRecord),
    /// An extension registered.
    #[serde(rename = "platform.extension")]
    Extension(ExtensionRecord),
    /// An extension subscribed to the Logs API.
    #[serde(rename = "platform.logsSubscription")]
    LogsSubscription(LogsSubscriptionRecord),
    /// The platform dropped records.
    #[serde(rename = "platform.logsDropped")]
    LogsDropped(LogsDroppedRecord),
    /// A runtime or environment fault.
    #[serde(rename = "platform.fault")]
    Fault(String),
    /// The runtime finished handling an invocation.
    #[serde(rename = "platform.runtimeDone")]
    RuntimeDone(RuntimeDoneRecord),
    /// A log line from function code.
    #[serde(rename = "function")]
    Function(String),
    /// A log line from extension code.
    #[serde(rename = "extension")]
    ExtensionLog(String),
}

impl LogRecord {
    /// Returns the wire `type` of this record.
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Start(_) => "platform.start",
            LogRecord::End(_) => "platform.end",
            LogRecord::Report(_) => "platform.report",
            LogRecord::Extension(_) => "platform.extension",
            LogRecord::LogsSubscription(_) => "platform.logsSubscription",
            LogRecord::LogsDropped(_) => "platform.logsDropped",
            LogRecord::Fault(_) => "platform.fault",
            LogRecord::RuntimeDone(_) => "platform.runtimeDone",
            LogRecord::Function(_) => "function",
            LogRecord::ExtensionLog(_) => "extension",
        }
    }
}

/// Record for `platform.start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRecord {
    /// Invocation request id.
    pub request_id: String,
    /// Function version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Record for `platform.end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRecord {
    /// Invocation request id.
    pub request_id: String,
}

/// Record for `platform.report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    /// Invocation request id.
    pub request_id: String,
    /// Invocation metrics.
    pub metrics: ReportMetrics,
    /// X-Ray trace header, when tracing is active.
    #[serde(default)]
    pub tracing: Option<Tracing>,
}

/// Metrics of a completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetrics {
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// Billed duration in milliseconds.
    pub billed_duration_ms: f64,
    /// Configured memory in MB.
    #[serde(rename = "memorySizeMB")]
    pub memory_size_mb: u64,
    /// Peak memory used in MB.
    #[serde(rename = "maxMemoryUsedMB")]
    pub max_memory_used_mb: u64,
    /// Init duration, cold starts only.
    #[serde(default)]
    pub init_duration_ms: Option<f64>,
}

/// Record for `platform.extension`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    /// Extension name.
    pub name: String,
    /// Registration state.
    pub state: String,
    /// Lifecycle events the extension registered for.
    #[serde(default)]
    pub events: Vec<EventType>,
}

/// Record for `platform.logsSubscription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsSubscriptionRecord {
    /// Extension name.
    pub name: String,
    /// Subscription state.
    pub state: String,
    /// Subscribed record kinds.
    #[serde(default)]
    pub types: Vec<SubscriptionType>,
}

/// Record for `platform.logsDropped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsDroppedRecord {
    /// Bytes dropped.
    pub dropped_bytes: u64,
    /// Records dropped.
    pub dropped_records: u64,
    /// Why they were dropped.
    pub reason: String,
}

/// Record for `platform.runtimeDone`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDoneRecord {
    /// Invocation request id.
    pub request_id: String,
    /// `success`, `failure` or `timeout`.
    pub status: String,
}

#[derive(Deserialize)]
struct RawLog {
    #[serde(rename = "type")]
    kind: String,
    time: DateTime<Utc>,
    #[serde(default)]
    record: Value,
}

/// Decodes one element of a Logs API batch.
///
/// # Errors
///
/// Returns [`DecodeError::UnknownType`] for an unknown `type`, or
/// [`DecodeError::Record`] when `record` does not match it.
pub fn decode_log(raw: &[u8]) -> Result<Log, DecodeError> {
    let RawLog { kind, time, record } =
        serde_json::from_slice(raw).map_err(DecodeError::Element)?;

    let record = match kind.as_str() {
        "platform.start" => parse(&kind, record).map(LogRecord::Start),
        "platform.end" => parse(&kind, record).map(LogRecord::End),
        "platform.report" => parse(&kind, record).map(LogRecord::Report),
        "platform.extension" => parse(&kind, record).map(LogRecord::Extension),
        "platform.logsSubscription" => parse(&kind, record).map(LogRecord::LogsSubscription),
        "platform.logsDropped" => parse(&kind, record).map(LogRecord::LogsDropped),
        "platform.fault" => parse(&kind, record).map(LogRecord::Fault),
        "platform.runtimeDone" => parse(&kind, record).map(LogRecord::RuntimeDone),
        "function" => parse(&kind, record).map(LogRecord::Function),
        "extension" => parse(&kind, record).map(LogRecord::ExtensionLog),
        _ => Err(DecodeError::UnknownType(kind.clone())),
    }?;

    Ok(Log { time, record })
}

fn parse<T: serde::de::DeserializeOwned>(kind: &str, record: Value) -> Result<T, DecodeError> {
    serde_json::from_value(record).map_err(|source| DecodeError::Record {
        kind: kind.to_string(),
        source,
    })
}

/// Options for [`run`].
#[must_use = "options do nothing unless passed to run()"]
#[derive(Debug, Clone)]
pub struct LogsOptions {
    destination_addr: String,
    types: Vec<SubscriptionType>,
    buffering: Option<BufferingConfig>,
    client: ClientBuilder,
}

impl Default for LogsOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl LogsOptions {
    /// Creates options that subscribe to platform, function and extension
    /// records on `sandbox.localdomain` with a free port.
    pub fn new() -> Self {
        Self {
            destination_addr: DEFAULT_DESTINATION_ADDR.to_string(),
            types: Vec::new(),
            buffering: None,
            client: ClientBuilder::new(),
        }
    }

    /// Builds options from loaded configuration.
    pub fn from_config(config: &ExtensionConfig) -> Self {
        Self {
            destination_addr: config.destination_addr.clone(),
            types: config.log_types.clone(),
            buffering: config.buffering_config(),
            client: ClientBuilder::new().from_config(config),
        }
    }

    /// Sets the `host:port` the receiver listens on.
    pub fn destination_addr(mut self, addr: impl Into<String>) -> Self {
        self.destination_addr = addr.into();
        self
    }

    /// Sets the record kinds to subscribe to.
    pub fn types(mut self, types: impl Into<Vec<SubscriptionType>>) -> Self {
        self.types = types.into();
        self
    }

    /// Sets buffering thresholds for the subscription.
    pub fn buffering(mut self, buffering: BufferingConfig) -> Self {
        self.buffering = Some(buffering);
        self
    }

    /// Sets the client used to talk to the Extensions API.
    pub fn client(mut self, client: ClientBuilder) -> Self {
        self.client = client;
        self
    }
}

struct LogsStream {
    types: Vec<SubscriptionType>,
    buffering: Option<BufferingConfig>,
}

#[async_trait]
impl PushStream for LogsStream {
    type Event = Log;

    fn decode(raw: &[u8]) -> Result<Log, DecodeError> {
        decode_log(raw)
    }

    async fn subscribe(
        &self,
        ctx: &ExtensionContext,
        client: &Client,
        destination_url: String,
    ) -> Result<(), ClientError> {
        let request =
            LogsSubscribeRequest::new(destination_url, self.types.clone(), self.buffering);
        client.logs_subscribe(ctx, &request).await
    }
}

/// Runs `processor` against the Logs API until shutdown.
///
/// # Errors
///
/// Returns the [`RunError`] that ended the run.
pub async fn run<P>(
    ctx: &ExtensionContext,
    processor: P,
    options: LogsOptions,
) -> Result<(), RunError>
where
    P: Processor<Log>,
{
    let LogsOptions {
        destination_addr,
        types,
        buffering,
        client,
    } = options;

    tracing::debug!(%destination_addr, ?types, "Starting Logs API receiver");

    let mut receiver = StreamReceiver::new(
        LogsStream { types, buffering },
        processor,
        destination_addr,
    );

    lambda_extensions_api::run(
        ctx,
        &mut receiver,
        client.event_types([EventType::Shutdown]),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_report_with_tracing() {
        let log = decode_log(
            br#"{
                "time": "2020-08-20T12:31:32.123Z",
                "type": "platform.report",
                "record": {
                    "requestId": "6f7f0961f83442118a7af6fe80b88d56",
                    "metrics": {
                        "durationMs": 101.51,
                        "billedDurationMs": 300,
                        "memorySizeMB": 512,
                        "maxMemoryUsedMB": 33,
                        "initDurationMs": 116.67
                    },
                    "tracing": {
                        "type": "X-Amzn-Trace-Id",
                        "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2;Parent=2be948a625588e32;Sampled=1"
                    }
                }
            }"#,
        )
        .unwrap();

        match log.record {
            LogRecord::Report(record) => {
                assert_eq!(record.request_id, "6f7f0961f83442118a7af6fe80b88d56");
                assert_eq!(record.metrics.billed_duration_ms, 300.0);
                assert_eq!(record.metrics.memory_size_mb, 512);
                assert_eq!(record.metrics.init_duration_ms, Some(116.67));
                assert_eq!(record.tracing.unwrap().trace_type, "X-Amzn-Trace-Id");
            }
            other => panic!("expected report record, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_fault_and_runtime_done() {
        let fault = decode_log(
            br#"{"time": "2020-08-20T12:31:32.123Z", "type": "platform.fault",
                "record": "RequestId: d783b35e-a91d-4251-af17-035953428a2c Process exited before completing request"}"#,
        )
        .unwrap();
        assert_eq!(fault.record.kind(), "platform.fault");

        let done = decode_log(
            br#"{"time": "2021-02-04T20:00:05.123Z", "type": "platform.runtimeDone",
                "record": {"requestId": "6f7f0961f83442118a7af6fe80b88d56", "status": "timeout"}}"#,
        )
        .unwrap();
        assert_eq!(
            done.record,
            LogRecord::RuntimeDone(RuntimeDoneRecord {
                request_id: "6f7f0961f83442118a7af6fe80b88d56".to_string(),
                status: "timeout".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_logs_subscription() {
        let log = decode_log(
            br#"{"time": "2020-08-20T12:31:32.123Z", "type": "platform.logsSubscription",
                "record": {"name": "Foo.bar", "state": "Subscribed", "types": ["function", "platform"]}}"#,
        )
        .unwrap();

        assert_eq!(
            log.record,
            LogRecord::LogsSubscription(LogsSubscriptionRecord {
                name: "Foo.bar".to_string(),
                state: "Subscribed".to_string(),
                types: vec![SubscriptionType::Function, SubscriptionType::Platform],
            })
        );
    }

    #[test]
    fn test_decode_rejects_telemetry_only_type() {
        let err = decode_log(
            br#"{"time": "2020-08-20T12:31:32.123Z", "type": "platform.initStart",
                "record": {"initializationType": "on-demand"}}"#,
        )
        .unwrap_err();

        assert!(matches!(err, DecodeError::UnknownType(kind) if kind == "platform.initStart"));
    }

    #[test]
    fn test_decode_end_requires_request_id() {
        let err = decode_log(
            br#"{"time": "2020-08-20T12:31:32.123Z", "type": "platform.end", "record": {}}"#,
        )
        .unwrap_err();

        assert!(matches!(err, DecodeError::Record { ref kind, .. } if kind == "platform.end"));
    }

    #[test]
    fn test_options_builder() {
        let options = LogsOptions::new()
            .destination_addr("localhost:0")
            .types(vec![SubscriptionType::Function])
            .buffering(BufferingConfig::default());

        assert_eq!(options.destination_addr, "localhost:0");
        assert_eq!(options.types, vec![SubscriptionType::Function]);
        assert_eq!(options.buffering, Some(BufferingConfig::default()));
    }
}
