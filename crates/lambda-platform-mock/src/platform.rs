//! Mock platform server and its builder.

use crate::error::{PlatformError, PlatformResult};
use crate::extensions_api::create_extensions_api_router;
use crate::state::{
    CannedFailure, ErrorReport, PlatformConfig, PlatformState, RecordedRegistration,
    RecordedSubscription,
};
use crate::subscription_api::create_subscription_api_router;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for [`MockPlatform`].
#[must_use = "builders do nothing unless .start() is called"]
#[derive(Debug, Default)]
pub struct MockPlatformBuilder {
    config: PlatformConfig,
}

impl MockPlatformBuilder {
    /// Creates a builder with the default function metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the function name returned at registration.
    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.config.function_name = name.into();
        self
    }

    /// Sets the function version returned at registration.
    pub fn function_version(mut self, version: impl Into<String>) -> Self {
        self.config.function_version = version.into();
        self
    }

    /// Sets the handler returned at registration.
    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.config.handler = handler.into();
        self
    }

    /// Sets the account id returned at registration.
    pub fn account_id(mut self, account_id: impl Into<String>) -> Self {
        self.config.account_id = account_id.into();
        self
    }

    /// Stops the platform from sending `Lambda-Extension-Identifier` on
    /// registration.
    pub fn without_extension_id(mut self) -> Self {
        self.config.issue_extension_id = false;
        self
    }

    /// Makes every registration fail with `status` and `body`.
    pub fn register_failure(mut self, status: u16, body: impl Into<String>) -> Self {
        self.config.register_failure = Some(CannedFailure {
            status,
            body: body.into(),
        });
        self
    }

    /// Makes every subscription fail with `status` and `body`.
    pub fn subscribe_failure(mut self, status: u16, body: impl Into<String>) -> Self {
        self.config.subscribe_failure = Some(CannedFailure {
            status,
            body: body.into(),
        });
        self
    }

    /// Binds to a free port on 127.0.0.1 and starts serving.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Bind`] if the listener cannot be created.
    pub async fn start(self) -> PlatformResult<MockPlatform> {
        let state = Arc::new(PlatformState::new(self.config));

        let router = create_extensions_api_router(Arc::clone(&state))
            .merge(create_subscription_api_router(Arc::clone(&state)))
            .fallback(|req: axum::extract::Request| async move {
                tracing::warn!(method = %req.method(), uri = %req.uri(), "Unhandled request");
                axum::http::StatusCode::NOT_FOUND
            });

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await
                {
                    tracing::error!(error = %e, "Mock platform server error");
                }
            })
        };

        tracing::debug!(%addr, "Mock platform listening");

        Ok(MockPlatform {
            state,
            addr,
            cancel,
            server,
            http: reqwest::Client::new(),
            sequence: AtomicU64::new(0),
        })
    }
}

/// In-process mock of the Lambda Extensions, Logs and Telemetry APIs.
#[derive(Debug)]
pub struct MockPlatform {
    state: Arc<PlatformState>,
    addr: SocketAddr,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    http: reqwest::Client,
    sequence: AtomicU64,
}

impl MockPlatform {
    /// Creates a new builder.
    pub fn builder() -> MockPlatformBuilder {
        MockPlatformBuilder::new()
    }

    /// Starts a platform with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Bind`] if the listener cannot be created.
    pub async fn start() -> PlatformResult<Self> {
        Self::builder().start().await
    }

    /// Returns the `host:port` to use as `AWS_LAMBDA_RUNTIME_API`.
    pub fn runtime_api(&self) -> String {
        self.addr.to_string()
    }

    /// Returns the socket address the platform listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues a raw lifecycle event for the next poll.
    pub async fn enqueue_event(&self, event: Value) {
        self.state.push_event(event).await;
    }

    /// Queues an `INVOKE` event.
    pub async fn enqueue_invoke(&self, request_id: &str, deadline_ms: i64) {
        self.enqueue_event(json!({
            "eventType": "INVOKE",
            "deadlineMs": deadline_ms,
            "requestId": request_id,
            "invokedFunctionArn": format!(
                "arn:aws:lambda:us-east-1:{}:function:{}",
                self.state.config.account_id, self.state.config.function_name
            ),
            "tracing": {
                "type": "X-Amzn-Trace-Id",
                "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2;Parent=2be948a625588e32;Sampled=1"
            }
        }))
        .await;
    }

    /// Queues a `SHUTDOWN` event.
    pub async fn enqueue_shutdown(&self, reason: &str, deadline_ms: i64) {
        self.enqueue_event(json!({
            "eventType": "SHUTDOWN",
            "shutdownReason": reason,
            "deadlineMs": deadline_ms,
        }))
        .await;
    }

    /// Returns every registration seen so far.
    pub async fn registrations(&self) -> Vec<RecordedRegistration> {
        self.state.registrations().await
    }

    /// Returns every init and exit error report seen so far.
    pub async fn error_reports(&self) -> Vec<ErrorReport> {
        self.state.error_reports().await
    }

    /// Returns every stream subscription seen so far.
    pub async fn subscriptions(&self) -> Vec<RecordedSubscription> {
        self.state.subscriptions().await
    }

    /// Returns how many next event calls have been received.
    pub fn next_event_calls(&self) -> usize {
        self.state.next_event_calls()
    }

    /// Polls `condition` until it returns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Timeout`] if `timeout` elapses first.
    pub async fn wait_for<F, Fut>(&self, condition: F, timeout: Duration) -> PlatformResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if condition().await {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(PlatformError::Timeout(format!(
                    "Condition did not become true within {:?}",
                    timeout
                )));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits for the first stream subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Timeout`] if no subscription arrives in time.
    pub async fn wait_for_subscription(
        &self,
        timeout: Duration,
    ) -> PlatformResult<RecordedSubscription> {
        self.wait_for(
            || async { !self.state.subscriptions().await.is_empty() },
            timeout,
        )
        .await?;

        self.state
            .subscriptions()
            .await
            .into_iter()
            .next()
            .ok_or(PlatformError::NoSubscription)
    }

    /// Pushes one batch to the most recent subscription's destination, the
    /// way the platform delivers logs and telemetry. Returns the status code
    /// the receiver answered with.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NoSubscription`] if nothing subscribed, or
    /// [`PlatformError::Push`] if the request could not be sent.
    pub async fn push_batch(&self, body: impl Into<String>) -> PlatformResult<u16> {
        let destination = self
            .state
            .subscriptions()
            .await
            .pop()
            .ok_or(PlatformError::NoSubscription)?
            .destination_uri;

        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst);

        let response = self
            .http
            .post(&destination)
            .header("Content-Type", "application/json")
            .header("Sequence-Id", sequence_id.to_string())
            .body(body.into())
            .send()
            .await?;

        Ok(response.status().as_u16())
    }

    /// Stops the server.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        // Long-polling handlers never finish on their own.
        self.server.abort();
        let _ = self.server.await;
    }
}
