//! Lifecycle run loop.
//!
//! [`run`] registers, initializes the [`Extension`], then polls for lifecycle
//! events until a shutdown event arrives or something fails. Each poll runs in
//! its own task so the wait can be raced against the extension's error signal
//! and the caller's cancellation.

use crate::client::{Client, ClientBuilder};
use crate::context::ExtensionContext;
use crate::error::{BoxError, RunError};
use crate::event::{InvokeEvent, NextEvent, ShutdownReason};
use crate::signal::ErrorSignal;
use async_trait::async_trait;
use std::error::Error as StdError;
use std::fmt;

/// Error type reported to the platform when `init` fails.
pub const INIT_ERROR_TYPE: &str = "Extension.Init";

/// Error type reported to the platform when the run loop ends in error.
pub const EXIT_ERROR_TYPE: &str = "Extension.Exit";

/// Callbacks driven by [`run`].
#[async_trait]
pub trait Extension: Send {
    /// Called once after registration, before the first poll.
    ///
    /// # Errors
    ///
    /// A failure is reported to the platform as an init error and ends the
    /// run after `shutdown` is called with [`ShutdownReason::ExtensionError`].
    async fn init(&mut self, ctx: &ExtensionContext, client: &Client) -> Result<(), BoxError>;

    /// Called for every invoke event. `ctx` carries the invocation deadline.
    ///
    /// # Errors
    ///
    /// A failure ends the loop.
    async fn handle_invoke(
        &mut self,
        ctx: &ExtensionContext,
        event: InvokeEvent,
    ) -> Result<(), BoxError>;

    /// Called once when the loop ends. `err` is the error that ended the
    /// loop, if any.
    ///
    /// # Errors
    ///
    /// A failure is returned from [`run`] unless the loop already failed.
    async fn shutdown(
        &mut self,
        ctx: &ExtensionContext,
        reason: ShutdownReason,
        err: Option<&RunError>,
    ) -> Result<(), BoxError>;

    /// Hands the run loop a signal that ends the loop when it fires.
    /// Called once, after `init` succeeds.
    fn take_error_signal(&mut self) -> Option<ErrorSignal<BoxError>> {
        None
    }
}

/// Drives `extension` through the lifecycle until shutdown.
///
/// # Errors
///
/// Returns the error that ended the loop, or the shutdown error if the loop
/// ended cleanly. Any error is also reported to the platform on a best
/// effort basis.
pub async fn run<E>(
    ctx: &ExtensionContext,
    extension: &mut E,
    builder: ClientBuilder,
) -> Result<(), RunError>
where
    E: Extension + ?Sized,
{
    let client = builder.register(ctx).await.map_err(RunError::Register)?;

    if let Err(err) = extension.init(ctx, &client).await {
        tracing::error!(error = %ErrorChain(err.as_ref()), "Extension init failed");

        if let Err(report_err) = client
            .init_error(ctx, INIT_ERROR_TYPE, ErrorChain(err.as_ref()))
            .await
        {
            tracing::warn!(error = %report_err, "Failed to report init error");
        }

        let err = RunError::Init(err);
        if let Err(shutdown_err) = extension
            .shutdown(ctx, ShutdownReason::ExtensionError, Some(&err))
            .await
        {
            tracing::warn!(
                error = %ErrorChain(shutdown_err.as_ref()),
                "Extension shutdown after failed init also failed"
            );
        }

        return Err(err);
    }

    let mut error_signal = extension.take_error_signal();
    let loop_ctx = ctx.child();
    let mut shutdown_event = None;

    let loop_result = loop {
        let poll = {
            let client = client.clone();
            let poll_ctx = loop_ctx.clone();
            tokio::spawn(async move { client.next_event(&poll_ctx).await })
        };

        // A poll that loses the race keeps running until `loop_ctx` is
        // cancelled below.
        let event = tokio::select! {
            biased;
            err = ctx.done() => break Err(RunError::Cancelled(err)),
            err = recv_error(&mut error_signal) => break Err(RunError::Signaled(err)),
            joined = poll => match joined {
                Ok(Ok(event)) => event,
                Ok(Err(err)) => break Err(RunError::NextEvent(err)),
                Err(join_err) => break Err(RunError::Task(join_err)),
            },
        };

        match event {
            NextEvent::Invoke(invoke) => {
                tracing::debug!(
                    request_id = %invoke.request_id,
                    deadline_ms = invoke.deadline_ms,
                    "Handling invoke event"
                );

                // The handler runs to completion. Parent cancellation reaches
                // it through `invoke_ctx`; a reported error is picked up by
                // the next poll race.
                let invoke_ctx = loop_ctx.with_deadline_ms(invoke.deadline_ms);
                let handled = extension.handle_invoke(&invoke_ctx, invoke).await;
                invoke_ctx.cancel();

                if let Err(err) = handled {
                    break Err(RunError::Invoke(err));
                }
            }
            NextEvent::Shutdown(event) => {
                tracing::debug!(
                    reason = %event.shutdown_reason,
                    deadline_ms = event.deadline_ms,
                    "Received shutdown event"
                );
                shutdown_event = Some(event);
                break Ok(());
            }
        }
    };

    loop_ctx.cancel();

    if let Err(err) = &loop_result {
        tracing::error!(error = %ErrorChain(err), "Extension loop failed");
    }

    let (reason, shutdown_ctx) = match &shutdown_event {
        Some(event) => (
            event.shutdown_reason,
            ctx.with_deadline_ms(event.deadline_ms),
        ),
        None => (ShutdownReason::ExtensionError, ctx.child()),
    };

    let shutdown_result = extension
        .shutdown(&shutdown_ctx, reason, loop_result.as_ref().err())
        .await;

    let result = match (loop_result, shutdown_result) {
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(shutdown_err)) => {
            tracing::warn!(
                error = %ErrorChain(shutdown_err.as_ref()),
                "Extension shutdown failed after loop error"
            );
            Err(err)
        }
        (Ok(()), Err(shutdown_err)) => {
            tracing::error!(
                error = %ErrorChain(shutdown_err.as_ref()),
                "Extension shutdown failed"
            );
            Err(RunError::Shutdown(shutdown_err))
        }
        (Ok(()), Ok(())) => Ok(()),
    };

    if let Err(err) = &result {
        if let Err(report_err) = client
            .exit_error(&shutdown_ctx, EXIT_ERROR_TYPE, ErrorChain(err))
            .await
        {
            tracing::warn!(error = %report_err, "Failed to report exit error");
        }
    }

    tracing::debug!(ok = result.is_ok(), "Extension finished");
    result
}

async fn recv_error(signal: &mut Option<ErrorSignal<BoxError>>) -> BoxError {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

/// Formats an error followed by its sources, separated by `: `.
struct ErrorChain<'a>(&'a (dyn StdError + Send + Sync + 'static));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }

        Ok(())
    }
}
