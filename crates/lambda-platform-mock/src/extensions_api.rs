//! Mock Extensions API endpoints.
//!
//! Mirrors the documented behaviour at
//! <https://docs.aws.amazon.com/lambda/latest/dg/runtimes-extensions-api.html>
//! closely enough to exercise a client, without any runtime or freeze logic.

use crate::state::{ErrorKind, ErrorReport, PlatformState, RecordedRegistration};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct RegisterBody {
    events: Vec<String>,
}

/// Creates the Extensions API router.
pub(crate) fn create_extensions_api_router(state: Arc<PlatformState>) -> Router {
    Router::new()
        .route("/2020-01-01/extension/register", post(register_extension))
        .route("/2020-01-01/extension/event/next", get(next_event))
        .route("/2020-01-01/extension/init/error", post(init_error))
        .route("/2020-01-01/extension/exit/error", post(exit_error))
        .with_state(state)
}

/// Builds a platform style JSON error response.
pub(crate) fn api_error(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "errorType": error_type, "errorMessage": message })),
    )
        .into_response()
}

pub(crate) fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// POST /2020-01-01/extension/register
async fn register_extension(
    State(state): State<Arc<PlatformState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterBody>,
) -> Response {
    if let Some(failure) = &state.config.register_failure {
        let status = StatusCode::from_u16(failure.status).unwrap_or(StatusCode::BAD_REQUEST);
        return (status, failure.body.clone()).into_response();
    }

    let Some(extension_name) = header(&headers, "Lambda-Extension-Name") else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "InvalidRequest",
            "Missing Lambda-Extension-Name header",
        );
    };

    let extension_id = uuid::Uuid::new_v4().to_string();

    tracing::debug!(
        extension_name = %extension_name,
        extension_id = %extension_id,
        events = ?request.events,
        "Extension registered"
    );

    state
        .record_registration(RecordedRegistration {
            extension_id: extension_id.clone(),
            extension_name,
            events: request.events,
            accept_feature: header(&headers, "Lambda-Extension-Accept-Feature"),
        })
        .await;

    let mut response_headers = HeaderMap::new();
    if state.config.issue_extension_id {
        if let Ok(id) = HeaderValue::from_str(&extension_id) {
            response_headers.insert("Lambda-Extension-Identifier", id);
        }
    }

    let body = json!({
        "functionName": state.config.function_name,
        "functionVersion": state.config.function_version,
        "handler": state.config.handler,
        "accountId": state.config.account_id,
    });

    (StatusCode::OK, response_headers, Json(body)).into_response()
}

/// GET /2020-01-01/extension/event/next
///
/// Long-polls until an event is queued.
async fn next_event(State(state): State<Arc<PlatformState>>, headers: HeaderMap) -> Response {
    let Some(extension_id) = header(&headers, "Lambda-Extension-Identifier") else {
        return api_error(
            StatusCode::FORBIDDEN,
            "Extension.MissingExtensionIdentifier",
            "Missing Lambda-Extension-Identifier header",
        );
    };

    if !state.is_registered(&extension_id).await {
        return api_error(
            StatusCode::FORBIDDEN,
            "Extension.UnknownExtensionIdentifier",
            "Extension not registered",
        );
    }

    let event = state.next_event().await;
    tracing::debug!(extension_id = %extension_id, event = %event, "Delivering event");

    Json(event).into_response()
}

/// POST /2020-01-01/extension/init/error
async fn init_error(
    State(state): State<Arc<PlatformState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    report_error(&state, ErrorKind::Init, &headers, body).await
}

/// POST /2020-01-01/extension/exit/error
async fn exit_error(
    State(state): State<Arc<PlatformState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    report_error(&state, ErrorKind::Exit, &headers, body).await
}

async fn report_error(
    state: &PlatformState,
    kind: ErrorKind,
    headers: &HeaderMap,
    body: String,
) -> Response {
    let error_type =
        header(headers, "Lambda-Extension-Function-Error-Type").unwrap_or_default();

    tracing::debug!(?kind, error_type = %error_type, body = %body, "Error reported");

    state
        .record_error(ErrorReport {
            kind,
            extension_id: header(headers, "Lambda-Extension-Identifier"),
            error_type,
            body,
        })
        .await;

    (StatusCode::ACCEPTED, Json(json!({ "status": "OK" }))).into_response()
}
