//! Mock Logs API and Telemetry API subscription endpoints.

use crate::extensions_api::{api_error, header};
use crate::state::{PlatformState, RecordedSubscription, StreamKind};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::put,
};
use serde_json::Value;
use std::sync::Arc;

/// Creates the subscription router for both streams.
pub(crate) fn create_subscription_api_router(state: Arc<PlatformState>) -> Router {
    Router::new()
        .route("/2020-08-15/logs", put(subscribe_logs))
        .route("/2022-07-01/telemetry", put(subscribe_telemetry))
        .with_state(state)
}

/// PUT /2020-08-15/logs
async fn subscribe_logs(
    State(state): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    subscribe(&state, StreamKind::Logs, &headers, body).await
}

/// PUT /2022-07-01/telemetry
async fn subscribe_telemetry(
    State(state): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    subscribe(&state, StreamKind::Telemetry, &headers, body).await
}

async fn subscribe(
    state: &PlatformState,
    stream: StreamKind,
    headers: &HeaderMap,
    body: Value,
) -> Response {
    if let Some(failure) = &state.config.subscribe_failure {
        let status = StatusCode::from_u16(failure.status).unwrap_or(StatusCode::BAD_REQUEST);
        return (status, failure.body.clone()).into_response();
    }

    let Some(extension_id) = header(headers, "Lambda-Extension-Identifier") else {
        return api_error(
            StatusCode::FORBIDDEN,
            "Extension.MissingExtensionIdentifier",
            "Missing Lambda-Extension-Identifier header",
        );
    };

    if body["destination"]["protocol"] != "HTTP" {
        return api_error(
            StatusCode::BAD_REQUEST,
            "ValidationError",
            "Only HTTP protocol is supported",
        );
    }

    let Some(destination_uri) = body["destination"]["URI"].as_str().map(str::to_owned) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "ValidationError",
            "Destination URI is required",
        );
    };

    tracing::debug!(
        ?stream,
        extension_id = %extension_id,
        destination = %destination_uri,
        types = %body["types"],
        "Extension subscribed"
    );

    state
        .record_subscription(RecordedSubscription {
            stream,
            extension_id,
            destination_uri,
            body,
        })
        .await;

    (StatusCode::OK, "OK").into_response()
}
