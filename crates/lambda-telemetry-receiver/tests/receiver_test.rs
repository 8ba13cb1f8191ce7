//! Integration tests for the Telemetry API receiver against a mock platform.

use async_trait::async_trait;
use lambda_extensions_api::{
    BoxError, ClientBuilder, ContextError, ExtensionContext, Registration, RunError,
    ShutdownReason,
};
use lambda_platform_mock::{ErrorKind, MockPlatform, StreamKind};
use lambda_telemetry_receiver::telemetry::{self, Event, TelemetryOptions};
use lambda_telemetry_receiver::{DecodeError, Processor, ReceiverError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

const START: &str = r#"{"time": "2022-10-12T00:00:00.000Z", "type": "platform.start",
    "record": {"requestId": "6d68ca91-49c9-448d-89b8-7ca3e6dc66aa", "version": "$LATEST"}}"#;

const LINE: &str = r#"{"time": "2022-10-12T00:00:00.100Z", "type": "function",
    "record": "[INFO] Hello world"}"#;

const RUNTIME_DONE: &str = r#"{"time": "2022-10-12T00:00:00.200Z", "type": "platform.runtimeDone",
    "record": {"requestId": "6d68ca91-49c9-448d-89b8-7ca3e6dc66aa", "status": "success"}}"#;

#[derive(Debug, Default)]
struct Observed {
    init: usize,
    kinds: Vec<&'static str>,
    processed_at_shutdown: Option<usize>,
    shutdowns: Vec<(ShutdownReason, Option<String>)>,
}

struct RecordingProcessor {
    observed: Arc<Mutex<Observed>>,
    delay: Duration,
    fail_init: bool,
    fail_process: bool,
    fail_shutdown: bool,
}

impl RecordingProcessor {
    fn new(observed: Arc<Mutex<Observed>>) -> Self {
        Self {
            observed,
            delay: Duration::ZERO,
            fail_init: false,
            fail_process: false,
            fail_shutdown: false,
        }
    }
}

#[async_trait]
impl Processor<Event> for RecordingProcessor {
    async fn init(
        &mut self,
        _ctx: &ExtensionContext,
        _registration: &Registration,
    ) -> Result<(), BoxError> {
        self.observed.lock().unwrap().init += 1;
        if self.fail_init {
            return Err("processor init exploded".into());
        }
        Ok(())
    }

    async fn process(&mut self, _ctx: &ExtensionContext, event: Event) -> Result<(), BoxError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.observed.lock().unwrap().kinds.push(event.record.kind());
        if self.fail_process {
            return Err("processor exploded".into());
        }
        Ok(())
    }

    async fn shutdown(
        &mut self,
        _ctx: &ExtensionContext,
        reason: ShutdownReason,
        err: Option<&RunError>,
    ) -> Result<(), BoxError> {
        let mut observed = self.observed.lock().unwrap();
        observed.processed_at_shutdown = Some(observed.kinds.len());
        observed.shutdowns.push((reason, err.map(ToString::to_string)));
        if self.fail_shutdown {
            return Err("processor shutdown exploded".into());
        }
        Ok(())
    }
}

fn options(platform: &MockPlatform) -> TelemetryOptions {
    TelemetryOptions::new()
        .destination_addr("127.0.0.1:0")
        .client(
            ClientBuilder::new()
                .extension_name("receiver-test")
                .runtime_api(platform.runtime_api()),
        )
}

fn spawn_run(
    platform: &MockPlatform,
    processor: RecordingProcessor,
) -> tokio::task::JoinHandle<Result<(), RunError>> {
    let options = options(platform);
    tokio::spawn(async move { telemetry::run(&ExtensionContext::new(), processor, options).await })
}

fn shutdown_receiver_error(err: &RunError) -> &ReceiverError {
    match err {
        RunError::Shutdown(source) => source
            .downcast_ref::<ReceiverError>()
            .unwrap_or_else(|| panic!("expected receiver error, got {source}")),
        other => panic!("expected shutdown error, got {other:?}"),
    }
}

fn signaled_receiver_error(err: &RunError) -> &ReceiverError {
    match err {
        RunError::Signaled(source) => source
            .downcast_ref::<ReceiverError>()
            .unwrap_or_else(|| panic!("expected receiver error, got {source}")),
        other => panic!("expected signaled error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscription_carries_configured_host_and_bound_port() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let run = spawn_run(&platform, RecordingProcessor::new(Arc::clone(&observed)));

    let subscription = platform.wait_for_subscription(WAIT).await.unwrap();
    assert_eq!(subscription.stream, StreamKind::Telemetry);

    let port = subscription
        .destination_uri
        .strip_prefix("http://127.0.0.1:")
        .unwrap_or_else(|| panic!("unexpected uri {}", subscription.destination_uri));
    assert_ne!(port.parse::<u16>().unwrap(), 0);

    assert_eq!(subscription.body["schemaVersion"], "2022-07-01");
    assert_eq!(
        subscription.body["types"],
        serde_json::json!(["platform", "function"])
    );
    assert_eq!(subscription.body["destination"]["protocol"], "HTTP");

    let registrations = platform.registrations().await;
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].events, vec!["SHUTDOWN".to_string()]);

    platform.enqueue_shutdown("spindown", i64::MAX).await;
    run.await.unwrap().unwrap();

    assert_eq!(observed.lock().unwrap().init, 1);
    platform.shutdown().await;
}

#[tokio::test]
async fn test_batches_are_processed_in_push_order() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let run = spawn_run(&platform, RecordingProcessor::new(Arc::clone(&observed)));

    platform.wait_for_subscription(WAIT).await.unwrap();

    let status = platform
        .push_batch(format!("[{START}, {LINE}]"))
        .await
        .unwrap();
    assert_eq!(status, 200);
    let status = platform.push_batch(format!("[{RUNTIME_DONE}]")).await.unwrap();
    assert_eq!(status, 200);
    let status = platform.push_batch("[]").await.unwrap();
    assert_eq!(status, 200);

    platform.enqueue_shutdown("spindown", i64::MAX).await;
    run.await.unwrap().unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(
        observed.kinds,
        vec!["platform.start", "function", "platform.runtimeDone"]
    );
    assert_eq!(observed.processed_at_shutdown, Some(3));
    assert_eq!(observed.shutdowns, vec![(ShutdownReason::Spindown, None)]);

    drop(observed);
    assert!(platform.error_reports().await.is_empty());
    platform.shutdown().await;
}

#[tokio::test]
async fn test_accepted_events_are_drained_before_processor_shutdown() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let mut processor = RecordingProcessor::new(Arc::clone(&observed));
    processor.delay = Duration::from_millis(200);
    let run = spawn_run(&platform, processor);

    platform.wait_for_subscription(WAIT).await.unwrap();

    let status = platform
        .push_batch(format!("[{START}, {LINE}]"))
        .await
        .unwrap();
    assert_eq!(status, 200);

    platform.enqueue_shutdown("spindown", i64::MAX).await;
    run.await.unwrap().unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.kinds, vec!["platform.start", "function"]);
    assert_eq!(observed.processed_at_shutdown, Some(2));

    drop(observed);
    platform.shutdown().await;
}

#[tokio::test]
async fn test_bad_element_stops_batch_and_ends_run() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let run = spawn_run(&platform, RecordingProcessor::new(Arc::clone(&observed)));

    platform.wait_for_subscription(WAIT).await.unwrap();

    let bogus = r#"{"time": "2022-10-12T00:00:00.000Z", "type": "platform.bogus", "record": {}}"#;
    let status = platform
        .push_batch(format!("[{START}, {bogus}, {LINE}]"))
        .await
        .unwrap();
    assert_eq!(status, 500);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        signaled_receiver_error(&err),
        ReceiverError::Decode(DecodeError::UnknownType(kind)) if kind == "platform.bogus"
    ));

    let observed = observed.lock().unwrap();
    assert_eq!(observed.kinds, vec!["platform.start"]);
    assert_eq!(observed.shutdowns.len(), 1);
    assert_eq!(observed.shutdowns[0].0, ShutdownReason::ExtensionError);
    assert!(observed.shutdowns[0].1.is_some());

    drop(observed);
    let reports = platform.error_reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, ErrorKind::Exit);
    assert_eq!(reports[0].error_type, "Extension.Exit");
    platform.shutdown().await;
}

#[tokio::test]
async fn test_non_post_batch_is_rejected() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let run = spawn_run(&platform, RecordingProcessor::new(Arc::clone(&observed)));

    let subscription = platform.wait_for_subscription(WAIT).await.unwrap();

    let response = reqwest::Client::new()
        .get(&subscription.destination_uri)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(
        response.text().await.unwrap(),
        "got unexpected HTTP request method GET, want POST"
    );

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        signaled_receiver_error(&err),
        ReceiverError::MethodNotAllowed(method) if method == "GET"
    ));
    assert!(observed.lock().unwrap().kinds.is_empty());

    platform.shutdown().await;
}

#[tokio::test]
async fn test_process_failure_ends_run() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let mut processor = RecordingProcessor::new(Arc::clone(&observed));
    processor.fail_process = true;
    let run = spawn_run(&platform, processor);

    platform.wait_for_subscription(WAIT).await.unwrap();

    let status = platform.push_batch(format!("[{START}]")).await.unwrap();
    assert_eq!(status, 200);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        signaled_receiver_error(&err),
        ReceiverError::Process(_)
    ));

    let observed = observed.lock().unwrap();
    assert_eq!(observed.kinds, vec!["platform.start"]);
    assert_eq!(observed.shutdowns.len(), 1);
    assert_eq!(observed.shutdowns[0].0, ShutdownReason::ExtensionError);

    drop(observed);
    platform.shutdown().await;
}

#[tokio::test]
async fn test_processor_init_failure_skips_subscription() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let mut processor = RecordingProcessor::new(Arc::clone(&observed));
    processor.fail_init = true;

    let err = spawn_run(&platform, processor).await.unwrap().unwrap_err();
    let RunError::Init(source) = &err else {
        panic!("expected init error, got {err:?}");
    };
    assert!(matches!(
        source.downcast_ref::<ReceiverError>(),
        Some(ReceiverError::ProcessorInit(_))
    ));

    let observed = observed.lock().unwrap();
    assert_eq!(observed.init, 1);
    assert_eq!(observed.shutdowns.len(), 1);
    assert_eq!(observed.shutdowns[0].0, ShutdownReason::ExtensionError);

    drop(observed);
    assert!(platform.subscriptions().await.is_empty());
    let reports = platform.error_reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, ErrorKind::Init);
    platform.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscription_fails_init() {
    let platform = MockPlatform::builder()
        .subscribe_failure(400, r#"{"errorType": "ValidationError", "errorMessage": "bad uri"}"#)
        .start()
        .await
        .unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));

    let err = spawn_run(&platform, RecordingProcessor::new(Arc::clone(&observed)))
        .await
        .unwrap()
        .unwrap_err();
    let RunError::Init(source) = &err else {
        panic!("expected init error, got {err:?}");
    };
    assert!(matches!(
        source.downcast_ref::<ReceiverError>(),
        Some(ReceiverError::Subscribe(_))
    ));

    // The processor was initialized and is shut down again.
    let observed = observed.lock().unwrap();
    assert_eq!(observed.init, 1);
    assert_eq!(observed.shutdowns.len(), 1);

    drop(observed);
    platform.shutdown().await;
}

#[tokio::test]
async fn test_timeout_shutdown_after_logs_dropped() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let run = spawn_run(&platform, RecordingProcessor::new(Arc::clone(&observed)));

    platform.wait_for_subscription(WAIT).await.unwrap();

    let dropped = r#"{"time": "2022-10-12T00:00:01.000Z", "type": "platform.logsDropped",
        "record": {"droppedBytes": 10, "droppedRecords": 1, "reason": "slow consumer"}}"#;
    let status = platform.push_batch(format!("[{dropped}]")).await.unwrap();
    assert_eq!(status, 200);

    platform.enqueue_shutdown("timeout", i64::MAX).await;
    run.await.unwrap().unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.kinds, vec!["platform.logsDropped"]);
    assert_eq!(observed.shutdowns, vec![(ShutdownReason::Timeout, None)]);

    drop(observed);
    platform.shutdown().await;
}

#[tokio::test]
async fn test_processor_shutdown_failure_is_returned_and_reported() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let mut processor = RecordingProcessor::new(Arc::clone(&observed));
    processor.fail_shutdown = true;
    let run = spawn_run(&platform, processor);

    platform.wait_for_subscription(WAIT).await.unwrap();
    platform.enqueue_shutdown("spindown", i64::MAX).await;

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        shutdown_receiver_error(&err),
        ReceiverError::ProcessorShutdown(source) if source.to_string() == "processor shutdown exploded"
    ));
    assert_eq!(
        observed.lock().unwrap().shutdowns,
        vec![(ShutdownReason::Spindown, None)]
    );

    let reports = platform.error_reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, ErrorKind::Exit);
    assert!(reports[0].body.contains("processor shutdown exploded"));
    platform.shutdown().await;
}

#[tokio::test]
async fn test_expired_shutdown_deadline_fails_server_stop() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let run = spawn_run(&platform, RecordingProcessor::new(Arc::clone(&observed)));

    platform.wait_for_subscription(WAIT).await.unwrap();
    platform.enqueue_shutdown("spindown", 1).await;

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        shutdown_receiver_error(&err),
        ReceiverError::ServerShutdown(ContextError::DeadlineExceeded)
    ));
    // The processor is still shut down after the server fails to stop.
    assert_eq!(observed.lock().unwrap().shutdowns.len(), 1);

    platform.shutdown().await;
}

#[tokio::test]
async fn test_processor_shutdown_failure_wins_over_server_stop_failure() {
    let platform = MockPlatform::start().await.unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let mut processor = RecordingProcessor::new(Arc::clone(&observed));
    processor.fail_shutdown = true;
    let run = spawn_run(&platform, processor);

    platform.wait_for_subscription(WAIT).await.unwrap();
    platform.enqueue_shutdown("spindown", 1).await;

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        shutdown_receiver_error(&err),
        ReceiverError::ProcessorShutdown(_)
    ));

    platform.shutdown().await;
}
