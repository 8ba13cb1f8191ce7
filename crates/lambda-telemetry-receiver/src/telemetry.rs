//! Telemetry API receiver.
//!
//! [`run`] subscribes to the Lambda Telemetry API and feeds every pushed
//! [`Event`] to a [`Processor`], one at a time, until the execution
//! environment shuts down.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use lambda_extensions_api::{BoxError, ExtensionContext, Registration, RunError, ShutdownReason};
//! use lambda_telemetry_receiver::Processor;
//! use lambda_telemetry_receiver::telemetry::{self, Event, TelemetryOptions};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl Processor<Event> for Printer {
//!     async fn init(&mut self, _: &ExtensionContext, _: &Registration) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//!
//!     async fn process(&mut self, _: &ExtensionContext, event: Event) -> Result<(), BoxError> {
//!         println!("{} {:?}", event.time, event.record);
//!         Ok(())
//!     }
//!
//!     async fn shutdown(
//!         &mut self,
//!         _: &ExtensionContext,
//!         _: ShutdownReason,
//!         _: Option<&RunError>,
//!     ) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), RunError> {
//! telemetry::run(&ExtensionContext::new(), Printer, TelemetryOptions::new()).await
//! # }
//! ```

use crate::error::DecodeError;
use crate::receiver::{Processor, PushStream, StreamReceiver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lambda_extensions_api::{
    BufferingConfig, Client, ClientBuilder, ClientError, DEFAULT_DESTINATION_ADDR, EventType,
    ExtensionConfig, ExtensionContext, RunError, SubscriptionType, TelemetrySubscribeRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record pushed by the Telemetry API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// When the platform generated the record, which is not always when the
    /// reported activity happened.
    pub time: DateTime<Utc>,
    /// The typed payload.
    pub record: Record,
}

/// Telemetry payload, selected by the element's `type`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "record")]
pub enum Record {
    /// Function initialization started.
    #[serde(rename = "platform.initStart")]
    InitStart(InitStartRecord),
    /// Function initialization finished.
    #[serde(rename = "platform.initRuntimeDone")]
    InitRuntimeDone(InitRuntimeDoneRecord),
    /// Report of the initialization phase.
    #[serde(rename = "platform.initReport")]
    InitReport(InitReportRecord),
    /// Invocation started.
    #[serde(rename = "platform.start")]
    Start(StartRecord),
    /// The runtime finished handling an invocation.
    #[serde(rename = "platform.runtimeDone")]
    RuntimeDone(RuntimeDoneRecord),
    /// Report of an invocation.
    #[serde(rename = "platform.report")]
    Report(ReportRecord),
    /// An extension registered.
    #[serde(rename = "platform.extension")]
    Extension(ExtensionRecord),
    /// An extension subscribed to the Telemetry API.
    #[serde(rename = "platform.telemetrySubscription")]
    TelemetrySubscription(TelemetrySubscriptionRecord),
    /// The platform dropped records.
    #[serde(rename = "platform.logsDropped")]
    LogsDropped(LogsDroppedRecord),
    /// A log line from function code.
    #[serde(rename = "function")]
    Function(String),
    /// A log line from extension code.
    #[serde(rename = "extension")]
    ExtensionLog(String),
}

impl Record {
    /// Returns the wire `type` of this record.
    pub fn kind(&self) -> &'static str {
        match self {
            Record::InitStart(_) => "platform.initStart",
            Record::InitRuntimeDone(_) => "platform.initRuntimeDone",
            Record::InitReport(_) => "platform.initReport",
            Record::Start(_) => "platform.start",
            Record::RuntimeDone(_) => "platform.runtimeDone",
            Record::Report(_) => "platform.report",
            Record::Extension(_) => "platform.extension",
            Record::TelemetrySubscription(_) => "platform.telemetrySubscription",
            Record::LogsDropped(_) => "platform.logsDropped",
            Record::Function(_) => "function",
            Record::ExtensionLog(_) => "extension",
        }
    }
}

/// Record for `platform.initStart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitStartRecord {
    /// `on-demand`, `provisioned-concurrency` or `snap-start`.
    pub initialization_type: String,
    /// `init`, or `invoke` for a suppressed init.
    #[serde(default)]
    pub phase: String,
    /// Runtime version.
    #[serde(default)]
    pub runtime_version: Option<String>,
    /// Runtime version ARN.
    #[serde(default)]
    pub runtime_version_arn: Option<String>,
}

/// Record for `platform.initRuntimeDone`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRuntimeDoneRecord {
    /// Initialization type.
    pub initialization_type: String,
    /// Initialization phase.
    #[serde(default)]
    pub phase: String,
    /// `success`, `failure` or `error`.
    pub status: String,
    /// Spans produced during initialization.
    #[serde(default)]
    pub spans: Vec<Span>,
}

/// Record for `platform.initReport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReportRecord {
    /// Initialization type.
    pub initialization_type: String,
    /// Initialization phase.
    #[serde(default)]
    pub phase: String,
    /// Initialization metrics.
    pub metrics: InitReportMetrics,
    /// Spans produced during initialization.
    #[serde(default)]
    pub spans: Vec<Span>,
}

/// Metrics of an initialization phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReportMetrics {
    /// Duration in milliseconds.
    pub duration_ms: f64,
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
    /// Trace context.
    #[serde(default)]
    pub tracing: Option<TraceContext>,
}

/// Record for `platform.runtimeDone`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDoneRecord {
    /// Invocation request id.
    pub request_id: String,
    /// `success`, `failure`, `error` or `timeout`.
    pub status: String,
    /// Invocation metrics.
    #[serde(default)]
    pub metrics: Option<RuntimeDoneMetrics>,
    /// Trace context.
    #[serde(default)]
    pub tracing: Option<TraceContext>,
    /// Spans produced during the invocation.
    #[serde(default)]
    pub spans: Vec<Span>,
}

/// Metrics of an invocation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDoneMetrics {
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// Bytes of response produced.
    #[serde(default)]
    pub produced_bytes: Option<u64>,
}

/// Record for `platform.report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    /// Invocation request id.
    pub request_id: String,
    /// Invocation status.
    pub status: String,
    /// Invocation metrics.
    pub metrics: ReportMetrics,
    /// Trace context.
    #[serde(default)]
    pub tracing: Option<TraceContext>,
    /// Spans produced during the invocation.
    #[serde(default)]
    pub spans: Vec<Span>,
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
    /// Restore duration, SnapStart only.
    #[serde(default)]
    pub restore_duration_ms: Option<f64>,
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

/// Record for `platform.telemetrySubscription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySubscriptionRecord {
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

/// A unit of work inside a phase, e.g. `responseLatency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// Span name.
    pub name: String,
    /// Start time.
    pub start: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: f64,
}

/// Trace context attached to invocation records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    /// Span id.
    #[serde(default)]
    pub span_id: Option<String>,
    /// Trace header type, `X-Amzn-Trace-Id`.
    #[serde(rename = "type")]
    pub trace_type: String,
    /// Trace header value.
    pub value: String,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    time: DateTime<Utc>,
    #[serde(default)]
    record: Value,
}

/// Decodes one element of a Telemetry API batch.
///
/// # Errors
///
/// Returns [`DecodeError::UnknownType`] for an unknown `type`, or
/// [`DecodeError::Record`] when `record` does not match it.
pub fn decode_event(raw: &[u8]) -> Result<Event, DecodeError> {
    let RawEvent { kind, time, record } =
        serde_json::from_slice(raw).map_err(DecodeError::Element)?;

    let record = match kind.as_str() {
        "platform.initStart" => record_of(&kind, record).map(Record::InitStart),
        "platform.initRuntimeDone" => record_of(&kind, record).map(Record::InitRuntimeDone),
        "platform.initReport" => record_of(&kind, record).map(Record::InitReport),
        "platform.start" => record_of(&kind, record).map(Record::Start),
        "platform.runtimeDone" => record_of(&kind, record).map(Record::RuntimeDone),
        "platform.report" => record_of(&kind, record).map(Record::Report),
        "platform.extension" => record_of(&kind, record).map(Record::Extension),
        "platform.telemetrySubscription" => {
            record_of(&kind, record).map(Record::TelemetrySubscription)
        }
        "platform.logsDropped" => record_of(&kind, record).map(Record::LogsDropped),
        "function" => record_of(&kind, record).map(Record::Function),
        "extension" => record_of(&kind, record).map(Record::ExtensionLog),
        _ => Err(DecodeError::UnknownType(kind.clone())),
    }?;

    Ok(Event { time, record })
}

fn record_of<T>(kind: &str, record: Value) -> Result<T, DecodeError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(record).map_err(|source| DecodeError::Record {
        kind: kind.to_string(),
        source,
    })
}

/// Options for [`run`].
#[must_use = "options do nothing unless passed to run()"]
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    destination_addr: String,
    types: Vec<SubscriptionType>,
    buffering: Option<BufferingConfig>,
    client: ClientBuilder,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryOptions {
    /// Creates options that subscribe to platform and function records on
    /// `sandbox.localdomain` with a free port.
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
            types: config.telemetry_types.clone(),
            buffering: config.buffering_config(),
            client: ClientBuilder::new().from_config(config),
        }
    }

    /// Sets the `host:port` the receiver listens on. The platform only
    /// accepts the `sandbox.localdomain` host; port 0 picks a free port.
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

struct TelemetryStream {
    types: Vec<SubscriptionType>,
    buffering: Option<BufferingConfig>,
}

#[async_trait]
impl PushStream for TelemetryStream {
    type Event = Event;

    fn decode(raw: &[u8]) -> Result<Event, DecodeError> {
        decode_event(raw)
    }

    async fn subscribe(
        &self,
        ctx: &ExtensionContext,
        client: &Client,
        destination_url: String,
    ) -> Result<(), ClientError> {
        let request = TelemetrySubscribeRequest::new(
            destination_url,
            self.types.clone(),
            self.buffering,
        );
        client.telemetry_subscribe(ctx, &request).await
    }
}

/// Runs `processor` against the Telemetry API until shutdown.
///
/// The extension registers for `SHUTDOWN` events only.
///
/// # Errors
///
/// Returns the [`RunError`] that ended the run.
pub async fn run<P>(
    ctx: &ExtensionContext,
    processor: P,
    options: TelemetryOptions,
) -> Result<(), RunError>
where
    P: Processor<Event>,
{
    let TelemetryOptions {
        destination_addr,
        types,
        buffering,
        client,
    } = options;

    tracing::debug!(%destination_addr, ?types, "Starting Telemetry API receiver");

    let mut receiver = StreamReceiver::new(
        TelemetryStream { types, buffering },
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
    use chrono::TimeZone;

    #[test]
    fn test_decode_start_event() {
        let event = decode_event(
            br#"{
                "time": "2022-10-12T00:00:00.000Z",
                "type": "platform.start",
                "record": {
                    "requestId": "6d68ca91-49c9-448d-89b8-7ca3e6dc66aa",
                    "version": "$LATEST",
                    "tracing": {
                        "spanId": "54565fb41ac79632",
                        "type": "X-Amzn-Trace-Id",
                        "value": "Root=1-62e900b2-710d76f009d6e7785905449a;Parent=0efbd19962d95b05;Sampled=1"
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(
            event.time,
            Utc.with_ymd_and_hms(2022, 10, 12, 0, 0, 0).unwrap()
        );
        match event.record {
            Record::Start(record) => {
                assert_eq!(record.request_id, "6d68ca91-49c9-448d-89b8-7ca3e6dc66aa");
                assert_eq!(record.version.as_deref(), Some("$LATEST"));
                let trace = record.tracing.unwrap();
                assert_eq!(trace.span_id.as_deref(), Some("54565fb41ac79632"));
                assert_eq!(trace.trace_type, "X-Amzn-Trace-Id");
            }
            other => panic!("expected start record, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_report_event() {
        let event = decode_event(
            br#"{
                "time": "2022-10-12T00:01:00.000Z",
                "type": "platform.report",
                "record": {
                    "requestId": "6d68ca91-49c9-448d-89b8-7ca3e6dc66aa",
                    "status": "success",
                    "metrics": {
                        "durationMs": 101.51,
                        "billedDurationMs": 102,
                        "memorySizeMB": 128,
                        "maxMemoryUsedMB": 54,
                        "initDurationMs": 151.01
                    },
                    "spans": [
                        {"name": "responseLatency", "start": "2022-10-12T00:00:00.100Z", "durationMs": 10.2}
                    ]
                }
            }"#,
        )
        .unwrap();

        match event.record {
            Record::Report(record) => {
                assert_eq!(record.status, "success");
                assert_eq!(record.metrics.memory_size_mb, 128);
                assert_eq!(record.metrics.max_memory_used_mb, 54);
                assert_eq!(record.metrics.init_duration_ms, Some(151.01));
                assert_eq!(record.metrics.restore_duration_ms, None);
                assert_eq!(record.spans.len(), 1);
                assert_eq!(record.spans[0].name, "responseLatency");
            }
            other => panic!("expected report record, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_extension_and_subscription_events() {
        let extension = decode_event(
            br#"{"time": "2022-10-12T00:00:00.000Z", "type": "platform.extension",
                "record": {"name": "my-extension", "state": "Ready", "events": ["INVOKE", "SHUTDOWN"]}}"#,
        )
        .unwrap();
        assert_eq!(
            extension.record,
            Record::Extension(ExtensionRecord {
                name: "my-extension".to_string(),
                state: "Ready".to_string(),
                events: vec![EventType::Invoke, EventType::Shutdown],
            })
        );

        let subscription = decode_event(
            br#"{"time": "2022-10-12T00:00:00.000Z", "type": "platform.telemetrySubscription",
                "record": {"name": "my-extension", "state": "Subscribed", "types": ["platform", "function"]}}"#,
        )
        .unwrap();
        assert_eq!(
            subscription.record,
            Record::TelemetrySubscription(TelemetrySubscriptionRecord {
                name: "my-extension".to_string(),
                state: "Subscribed".to_string(),
                types: vec![SubscriptionType::Platform, SubscriptionType::Function],
            })
        );
    }

    #[test]
    fn test_decode_function_log_line() {
        let event = decode_event(
            br#"{"time": "2022-10-12T00:03:50.000Z", "type": "function", "record": "[INFO] Hello world"}"#,
        )
        .unwrap();

        assert_eq!(event.record, Record::Function("[INFO] Hello world".to_string()));
        assert_eq!(event.record.kind(), "function");
    }

    #[test]
    fn test_decode_logs_dropped() {
        let event = decode_event(
            br#"{"time": "2022-10-12T00:03:50.000Z", "type": "platform.logsDropped",
                "record": {"droppedBytes": 1024, "droppedRecords": 3, "reason": "Consumer seems to have fallen behind"}}"#,
        )
        .unwrap();

        match event.record {
            Record::LogsDropped(record) => {
                assert_eq!(record.dropped_bytes, 1024);
                assert_eq!(record.dropped_records, 3);
            }
            other => panic!("expected logs dropped record, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = decode_event(
            br#"{"time": "2022-10-12T00:00:00.000Z", "type": "platform.bogus", "record": {}}"#,
        )
        .unwrap_err();

        assert!(matches!(err, DecodeError::UnknownType(kind) if kind == "platform.bogus"));
    }

    #[test]
    fn test_decode_record_mismatch() {
        let err = decode_event(
            br#"{"time": "2022-10-12T00:00:00.000Z", "type": "platform.start", "record": "not an object"}"#,
        )
        .unwrap_err();

        assert!(matches!(err, DecodeError::Record { ref kind, .. } if kind == "platform.start"));
    }

    #[test]
    fn test_decode_bad_time() {
        let err = decode_event(br#"{"time": "yesterday", "type": "function", "record": "x"}"#)
            .unwrap_err();

        assert!(matches!(err, DecodeError::Element(_)));
    }

    #[test]
    fn test_record_serializes_with_wire_type() {
        let value = serde_json::to_value(Record::Function("hello".to_string())).unwrap();
        assert_eq!(value, serde_json::json!({"type": "function", "record": "hello"}));
    }

    #[test]
    fn test_options_from_config() {
        let config = ExtensionConfig::builder()
            .destination_addr("127.0.0.1:0")
            .telemetry_types(vec![SubscriptionType::Platform])
            .build();

        let options = TelemetryOptions::from_config(&config);

        assert_eq!(options.destination_addr, "127.0.0.1:0");
        assert_eq!(options.types, vec![SubscriptionType::Platform]);
        assert!(options.buffering.is_none());
    }
}
