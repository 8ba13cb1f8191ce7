//! Generic push-stream receiver.
//!
//! [`StreamReceiver`] is an [`Extension`] that never handles invoke events.
//! On init it starts an HTTP server the platform pushes batches to, subscribes
//! that server's URL to a stream, and feeds decoded events one at a time to a
//! [`Processor`]. On shutdown it stops intake, drains what was already
//! accepted, then shuts the processor down.

use crate::decode::{DecodeFn, decode_batch};
use crate::error::{DecodeError, ReceiverError};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use lambda_extensions_api::{
    BoxError, Client, ClientError, ErrorReporter, ErrorSignal, Extension, ExtensionContext,
    InvokeEvent, Registration, RunError, ShutdownReason, error_signal,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SEQUENCE_ID_HEADER: &str = "Sequence-Id";

/// Application logic that consumes decoded stream events.
#[async_trait]
pub trait Processor<E>: Send + 'static
where
    E: Send + 'static,
{
    /// Called once before any event is received. A good place to open
    /// connections and allocate buffers.
    ///
    /// # Errors
    ///
    /// A failure aborts startup; `shutdown` is still called.
    async fn init(
        &mut self,
        ctx: &ExtensionContext,
        registration: &Registration,
    ) -> Result<(), BoxError>;

    /// Called for every event, in arrival order. Calls never overlap.
    ///
    /// # Errors
    ///
    /// A failure ends the run. Events still buffered are discarded.
    async fn process(&mut self, ctx: &ExtensionContext, event: E) -> Result<(), BoxError>;

    /// Called once after every accepted event has been processed. Flush and
    /// release resources here.
    ///
    /// # Errors
    ///
    /// A failure takes priority over any HTTP server shutdown error.
    async fn shutdown(
        &mut self,
        ctx: &ExtensionContext,
        reason: ShutdownReason,
        err: Option<&RunError>,
    ) -> Result<(), BoxError>;
}

/// The parts that differ between the Logs API and the Telemetry API.
#[async_trait]
pub(crate) trait PushStream: Send + 'static {
    type Event: Send + 'static;

    /// Decodes one element of a pushed batch.
    fn decode(raw: &[u8]) -> Result<Self::Event, DecodeError>;

    /// Subscribes `destination_url` to the stream.
    async fn subscribe(
        &self,
        ctx: &ExtensionContext,
        client: &Client,
        destination_url: String,
    ) -> Result<(), ClientError>;
}

enum ProcessorSlot<P> {
    Ready(P),
    Running(JoinHandle<P>),
    Gone,
}

/// Shared with every batch request.
struct BatchState<E> {
    events: mpsc::WeakSender<E>,
    decode: DecodeFn<E>,
    cancel: CancellationToken,
    reporter: ErrorReporter<BoxError>,
}

/// Extension that receives a pushed stream and hands it to a [`Processor`].
pub(crate) struct StreamReceiver<S, P>
where
    S: PushStream,
{
    stream: S,
    destination_addr: String,
    processor: ProcessorSlot<P>,
    events_tx: Option<mpsc::Sender<S::Event>>,
    events_rx: Option<mpsc::Receiver<S::Event>>,
    decode_cancel: CancellationToken,
    server_cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
    reporter: ErrorReporter<BoxError>,
    signal: Option<ErrorSignal<BoxError>>,
}

impl<S, P> StreamReceiver<S, P>
where
    S: PushStream,
    P: Processor<S::Event>,
{
    pub(crate) fn new(stream: S, processor: P, destination_addr: impl Into<String>) -> Self {
        // One slot: a batch handler waits while the worker is busy.
        let (events_tx, events_rx) = mpsc::channel(1);
        let (reporter, signal) = error_signal();

        Self {
            stream,
            destination_addr: destination_addr.into(),
            processor: ProcessorSlot::Ready(processor),
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            decode_cancel: CancellationToken::new(),
            server_cancel: CancellationToken::new(),
            server: None,
            reporter,
            signal: Some(signal),
        }
    }

    async fn start(
        &mut self,
        ctx: &ExtensionContext,
        client: &Client,
    ) -> Result<(), ReceiverError> {
        let ProcessorSlot::Ready(processor) = &mut self.processor else {
            return Err(ReceiverError::AlreadyStarted);
        };
        let (Some(events_tx), Some(events_rx)) = (&self.events_tx, self.events_rx.take()) else {
            return Err(ReceiverError::AlreadyStarted);
        };

        processor
            .init(ctx, client.registration())
            .await
            .map_err(ReceiverError::ProcessorInit)?;

        if let ProcessorSlot::Ready(processor) =
            std::mem::replace(&mut self.processor, ProcessorSlot::Gone)
        {
            let worker = tokio::spawn(process_events(
                processor,
                ctx.child(),
                events_rx,
                self.reporter.clone(),
            ));
            self.processor = ProcessorSlot::Running(worker);
        }

        tracing::debug!(addr = %self.destination_addr, "Starting event receiving HTTP server");
        let listener = TcpListener::bind(self.destination_addr.as_str())
            .await
            .map_err(|source| ReceiverError::Bind {
                addr: self.destination_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ReceiverError::Bind {
            addr: self.destination_addr.clone(),
            source,
        })?;

        let state = Arc::new(BatchState {
            events: events_tx.downgrade(),
            decode: S::decode,
            cancel: self.decode_cancel.clone(),
            reporter: self.reporter.clone(),
        });
        let app = Router::new()
            .fallback(handle_batch::<S::Event>)
            .with_state(state);

        let shutdown = self.server_cancel.clone().cancelled_owned();
        let reporter = self.reporter.clone();
        self.server = Some(tokio::spawn(async move {
            match axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                Ok(()) => tracing::debug!("Event receiving HTTP server stopped"),
                Err(e) => {
                    tracing::error!(error = %e, "Event receiving HTTP server failed");
                    reporter.report(Box::new(ReceiverError::Server(e)));
                }
            }
        }));

        tracing::info!(%local_addr, "Event receiving HTTP server started");

        let url = destination_url(&self.destination_addr, local_addr)?;
        self.stream
            .subscribe(ctx, client, url)
            .await
            .map_err(ReceiverError::Subscribe)
    }

    async fn stop_server(&mut self, ctx: &ExtensionContext) -> Result<(), ReceiverError> {
        self.server_cancel.cancel();

        let Some(mut server) = self.server.take() else {
            return Ok(());
        };

        match ctx.run(&mut server).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_err)) => Err(ReceiverError::ServerTask(join_err)),
            Err(ctx_err) => {
                server.abort();
                let _ = server.await;
                Err(ReceiverError::ServerShutdown(ctx_err))
            }
        }
    }

    async fn stop(
        &mut self,
        ctx: &ExtensionContext,
        reason: ShutdownReason,
        err: Option<&RunError>,
    ) -> Result<(), ReceiverError> {
        if matches!(self.processor, ProcessorSlot::Gone) {
            return Err(ReceiverError::AlreadyShutDown);
        }

        tracing::debug!("Signalling in-flight batch decoding to stop");
        self.decode_cancel.cancel();

        tracing::debug!("Shutting down event receiving HTTP server");
        let server_result = self.stop_server(ctx).await;
        if let Err(e) = &server_result {
            tracing::error!(error = %e, "Event receiving HTTP server did not stop cleanly");
        }

        // No batch handler can send once the server has stopped.
        tracing::debug!("Closing event channel");
        self.events_tx = None;
        self.events_rx = None;

        let processor = match std::mem::replace(&mut self.processor, ProcessorSlot::Gone) {
            ProcessorSlot::Ready(processor) => processor,
            ProcessorSlot::Running(worker) => match worker.await {
                Ok(processor) => processor,
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Event processing task failed");
                    return Err(ReceiverError::Worker(join_err));
                }
            },
            ProcessorSlot::Gone => return Err(ReceiverError::AlreadyShutDown),
        };

        let mut processor = processor;
        tracing::debug!(%reason, "Calling processor shutdown");
        if let Err(e) = processor.shutdown(ctx, reason, err).await {
            tracing::error!(error = %e, "Processor shutdown failed");
            return Err(ReceiverError::ProcessorShutdown(e));
        }

        server_result
    }
}

#[async_trait]
impl<S, P> Extension for StreamReceiver<S, P>
where
    S: PushStream,
    P: Processor<S::Event>,
{
    async fn init(&mut self, ctx: &ExtensionContext, client: &Client) -> Result<(), BoxError> {
        self.start(ctx, client).await.map_err(BoxError::from)
    }

    async fn handle_invoke(
        &mut self,
        _ctx: &ExtensionContext,
        event: InvokeEvent,
    ) -> Result<(), BoxError> {
        tracing::error!(request_id = %event.request_id, "Receiver got an invoke event");
        Err(Box::new(ReceiverError::UnexpectedInvoke))
    }

    async fn shutdown(
        &mut self,
        ctx: &ExtensionContext,
        reason: ShutdownReason,
        err: Option<&RunError>,
    ) -> Result<(), BoxError> {
        self.stop(ctx, reason, err).await.map_err(BoxError::from)
    }

    fn take_error_signal(&mut self) -> Option<ErrorSignal<BoxError>> {
        self.signal.take()
    }
}

/// Feeds events to the processor until the channel closes. After the first
/// failure the remaining events are received and dropped so senders never
/// block.
async fn process_events<E, P>(
    mut processor: P,
    ctx: ExtensionContext,
    mut events: mpsc::Receiver<E>,
    reporter: ErrorReporter<BoxError>,
) -> P
where
    E: Send + 'static,
    P: Processor<E>,
{
    let mut failed = false;

    while let Some(event) = events.recv().await {
        if failed {
            continue;
        }

        if let Err(e) = processor.process(&ctx, event).await {
            tracing::error!(error = %e, "Processor failed to process event");
            reporter.report(Box::new(ReceiverError::Process(e)));
            failed = true;
        }
    }

    tracing::debug!(failed, "Event processing stopped");
    processor
}

async fn handle_batch<E>(
    State(state): State<Arc<BatchState<E>>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response
where
    E: Send + 'static,
{
    let sequence_id = headers
        .get(SEQUENCE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if method != Method::POST {
        let err = ReceiverError::MethodNotAllowed(method.to_string());
        tracing::error!(error = %err, %sequence_id, "Rejected batch request");
        let body = err.to_string();
        state.reporter.report(Box::new(err));
        return (StatusCode::BAD_REQUEST, body).into_response();
    }

    tracing::debug!(
        %sequence_id,
        content_length = headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
        "Received batch, decoding"
    );

    let result = match state.events.upgrade() {
        Some(events) => {
            let body = std::pin::pin!(body.into_data_stream());
            decode_batch(&state.cancel, body, state.decode, &events).await
        }
        None => Err(DecodeError::ChannelClosed),
    };

    match result {
        Ok(count) => {
            tracing::debug!(%sequence_id, count, "Batch decoded");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            let body = e.to_string();
            let err = ReceiverError::Decode(e);
            tracing::error!(error = %body, %sequence_id, "Batch decoding failed");
            state.reporter.report(Box::new(err));
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}

/// Builds the URL the platform pushes to: the configured host, which must not
/// be resolved to an IP, with the port the listener actually got.
pub(crate) fn destination_url(
    configured_addr: &str,
    local_addr: SocketAddr,
) -> Result<String, ReceiverError> {
    let (host, _) = configured_addr
        .rsplit_once(':')
        .ok_or_else(|| ReceiverError::InvalidAddress(configured_addr.to_string()))?;

    if host.is_empty() {
        return Err(ReceiverError::InvalidAddress(configured_addr.to_string()));
    }

    Ok(format!("http://{host}:{}", local_addr.port()))
}
