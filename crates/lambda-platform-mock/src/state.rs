//! Shared state behind the mock platform's HTTP handlers.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};

/// Canned failure returned instead of the normal response.
#[derive(Debug, Clone)]
pub struct CannedFailure {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

/// Static behaviour of the mock platform.
#[derive(Debug, Clone)]
pub(crate) struct PlatformConfig {
    pub function_name: String,
    pub function_version: String,
    pub handler: String,
    pub account_id: String,
    pub issue_extension_id: bool,
    pub register_failure: Option<CannedFailure>,
    pub subscribe_failure: Option<CannedFailure>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            function_name: "helloWorld".to_string(),
            function_version: "$LATEST".to_string(),
            handler: "lambda_function.lambda_handler".to_string(),
            account_id: "123456789012".to_string(),
            issue_extension_id: true,
            register_failure: None,
            subscribe_failure: None,
        }
    }
}

/// A registration seen by the platform.
#[derive(Debug, Clone)]
pub struct RecordedRegistration {
    /// Identifier issued to the extension.
    pub extension_id: String,
    /// Value of the `Lambda-Extension-Name` header.
    pub extension_name: String,
    /// Event types from the request body.
    pub events: Vec<String>,
    /// Value of the `Lambda-Extension-Accept-Feature` header.
    pub accept_feature: Option<String>,
}

/// Which error endpoint was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `POST /extension/init/error`.
    Init,
    /// `POST /extension/exit/error`.
    Exit,
}

/// An error report seen by the platform.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Endpoint called.
    pub kind: ErrorKind,
    /// Value of the `Lambda-Extension-Identifier` header.
    pub extension_id: Option<String>,
    /// Value of the `Lambda-Extension-Function-Error-Type` header.
    pub error_type: String,
    /// Raw request body.
    pub body: String,
}

/// Which stream a subscription targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `PUT /2020-08-15/logs`.
    Logs,
    /// `PUT /2022-07-01/telemetry`.
    Telemetry,
}

/// A stream subscription seen by the platform.
#[derive(Debug, Clone)]
pub struct RecordedSubscription {
    /// Stream subscribed to.
    pub stream: StreamKind,
    /// Value of the `Lambda-Extension-Identifier` header.
    pub extension_id: String,
    /// Destination URI from the request body.
    pub destination_uri: String,
    /// Full request body.
    pub body: Value,
}

#[derive(Debug, Default)]
pub(crate) struct PlatformState {
    pub config: PlatformConfig,
    events: Mutex<VecDeque<Value>>,
    event_ready: Notify,
    registrations: Mutex<Vec<RecordedRegistration>>,
    error_reports: Mutex<Vec<ErrorReport>>,
    subscriptions: Mutex<Vec<RecordedSubscription>>,
    next_event_calls: AtomicUsize,
}

impl PlatformState {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub async fn push_event(&self, event: Value) {
        self.events.lock().await.push_back(event);
        self.event_ready.notify_one();
    }

    /// Waits until an event is queued and removes it.
    pub async fn next_event(&self) -> Value {
        self.next_event_calls.fetch_add(1, Ordering::SeqCst);

        loop {
            let notified = self.event_ready.notified();

            if let Some(event) = self.events.lock().await.pop_front() {
                return event;
            }

            notified.await;
        }
    }

    pub fn next_event_calls(&self) -> usize {
        self.next_event_calls.load(Ordering::SeqCst)
    }

    pub async fn is_registered(&self, extension_id: &str) -> bool {
        self.registrations
            .lock()
            .await
            .iter()
            .any(|r| r.extension_id == extension_id)
    }

    pub async fn record_registration(&self, registration: RecordedRegistration) {
        self.registrations.lock().await.push(registration);
    }

    pub async fn registrations(&self) -> Vec<RecordedRegistration> {
        self.registrations.lock().await.clone()
    }

    pub async fn record_error(&self, report: ErrorReport) {
        self.error_reports.lock().await.push(report);
    }

    pub async fn error_reports(&self) -> Vec<ErrorReport> {
        self.error_reports.lock().await.clone()
    }

    pub async fn record_subscription(&self, subscription: RecordedSubscription) {
        self.subscriptions.lock().await.push(subscription);
    }

    pub async fn subscriptions(&self) -> Vec<RecordedSubscription> {
        self.subscriptions.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_next_event_waits_for_push() {
        let state = Arc::new(PlatformState::new(PlatformConfig::default()));

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.next_event().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        state.push_event(json!({"eventType": "SHUTDOWN"})).await;

        let event = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event["eventType"], "SHUTDOWN");
        assert_eq!(state.next_event_calls(), 1);
    }

    #[tokio::test]
    async fn test_events_are_fifo() {
        let state = PlatformState::new(PlatformConfig::default());

        state.push_event(json!(1)).await;
        state.push_event(json!(2)).await;

        assert_eq!(state.next_event().await, json!(1));
        assert_eq!(state.next_event().await, json!(2));
    }
}
