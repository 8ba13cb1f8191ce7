//! Subscription requests for the Logs API and the Telemetry API.
//!
//! An extension subscribes to at most one of the two streams per process
//! lifetime. The platform pushes batches to the destination URI given here.

use crate::client::Client;
use crate::context::ExtensionContext;
use crate::error::ClientError;
use serde::{Deserialize, Serialize};

const LOGS_API_PATH: &str = "/2020-08-15/logs";
const TELEMETRY_API_PATH: &str = "/2022-07-01/telemetry";

/// Kind of records a subscription asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Platform records such as start, report and runtime done.
    Platform,
    /// Output written by the function.
    Function,
    /// Output written by extensions.
    Extension,
}

/// Buffering thresholds. The platform flushes a batch as soon as any is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum number of records per batch (1000..=10000).
    pub max_items: u32,
    /// Maximum batch size in bytes (262144..=1048576).
    pub max_bytes: u32,
    /// Maximum time to buffer a batch in milliseconds (25..=30000).
    pub timeout_ms: u32,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_bytes: 262_144,
            timeout_ms: 1_000,
        }
    }
}

/// Transport used to deliver batches. Only HTTP is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationProtocol {
    /// Plain HTTP push.
    #[default]
    #[serde(rename = "HTTP")]
    Http,
}

/// HTTP method the Logs API uses when pushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `POST`, the platform default.
    Post,
    /// `PUT`.
    Put,
}

/// Body encoding the Logs API uses when pushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpEncoding {
    /// JSON array of records.
    Json,
}

/// Schema version of a Logs API subscription.
pub const LOGS_SCHEMA_VERSION: &str = "2021-03-18";

/// Schema version of a Telemetry API subscription.
pub const TELEMETRY_SCHEMA_VERSION: &str = "2022-07-01";

/// Where the Logs API pushes batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsDestination {
    /// Delivery transport.
    pub protocol: DestinationProtocol,
    /// Destination URI.
    #[serde(rename = "URI")]
    pub uri: String,
    /// Push method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    /// Push encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<HttpEncoding>,
}

/// Request body for subscribing to the Logs API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsSubscribeRequest {
    /// Requested schema version. The platform picks its oldest when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    /// Record kinds to deliver.
    pub types: Vec<SubscriptionType>,
    /// Buffering thresholds. Platform defaults apply when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffering: Option<BufferingConfig>,
    /// Push destination.
    pub destination: LogsDestination,
}

impl LogsSubscribeRequest {
    /// Creates a subscription for `types`, or for platform, function and
    /// extension records when `types` is empty.
    pub fn new(
        uri: impl Into<String>,
        types: Vec<SubscriptionType>,
        buffering: Option<BufferingConfig>,
    ) -> Self {
        let types = if types.is_empty() {
            vec![
                SubscriptionType::Platform,
                SubscriptionType::Function,
                SubscriptionType::Extension,
            ]
        } else {
            types
        };

        Self {
            schema_version: Some(LOGS_SCHEMA_VERSION.to_string()),
            types,
            buffering,
            destination: LogsDestination {
                protocol: DestinationProtocol::Http,
                uri: uri.into(),
                method: None,
                encoding: None,
            },
        }
    }
}

/// Where the Telemetry API pushes batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryDestination {
    /// Delivery transport.
    pub protocol: DestinationProtocol,
    /// Destination URI.
    #[serde(rename = "URI")]
    pub uri: String,
}

/// Request body for subscribing to the Telemetry API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySubscribeRequest {
    /// Requested schema version.
    pub schema_version: String,
    /// Record kinds to deliver.
    pub types: Vec<SubscriptionType>,
    /// Buffering thresholds. Platform defaults apply when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffering: Option<BufferingConfig>,
    /// Push destination.
    pub destination: TelemetryDestination,
}

impl TelemetrySubscribeRequest {
    /// Creates a subscription for `types`, or for platform and function
    /// records when `types` is empty. Extension records are left out by
    /// default so an extension does not receive its own output.
    pub fn new(
        uri: impl Into<String>,
        types: Vec<SubscriptionType>,
        buffering: Option<BufferingConfig>,
    ) -> Self {
        let types = if types.is_empty() {
            vec![SubscriptionType::Platform, SubscriptionType::Function]
        } else {
            types
        };

        Self {
            schema_version: TELEMETRY_SCHEMA_VERSION.to_string(),
            types,
            buffering,
            destination: TelemetryDestination {
                protocol: DestinationProtocol::Http,
                uri: uri.into(),
            },
        }
    }
}

impl Client {
    /// Subscribes to the Logs API.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the platform rejects the subscription,
    /// for instance because the telemetry stream is already subscribed.
    pub async fn logs_subscribe(
        &self,
        ctx: &ExtensionContext,
        request: &LogsSubscribeRequest,
    ) -> Result<(), ClientError> {
        tracing::debug!(
            uri = %request.destination.uri,
            types = ?request.types,
            "Subscribing to Logs API"
        );

        self.put_json(ctx, LOGS_API_PATH, request)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Logs API subscription failed"))
    }

    /// Subscribes to the Telemetry API.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the platform rejects the subscription.
    pub async fn telemetry_subscribe(
        &self,
        ctx: &ExtensionContext,
        request: &TelemetrySubscribeRequest,
    ) -> Result<(), ClientError> {
        tracing::debug!(
            uri = %request.destination.uri,
            types = ?request.types,
            "Subscribing to Telemetry API"
        );

        self.put_json(ctx, TELEMETRY_API_PATH, request)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Telemetry API subscription failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logs_request_defaults() {
        let request = LogsSubscribeRequest::new("http://sandbox.localdomain:4243", vec![], None);

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "schemaVersion": "2021-03-18",
                "types": ["platform", "function", "extension"],
                "destination": {
                    "protocol": "HTTP",
                    "URI": "http://sandbox.localdomain:4243"
                }
            })
        );
    }

    #[test]
    fn test_telemetry_request_defaults() {
        let request = TelemetrySubscribeRequest::new("http://sandbox.localdomain:4243", vec![], None);

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "schemaVersion": "2022-07-01",
                "types": ["platform", "function"],
                "destination": {
                    "protocol": "HTTP",
                    "URI": "http://sandbox.localdomain:4243"
                }
            })
        );
    }

    #[test]
    fn test_telemetry_request_with_buffering() {
        let request = TelemetrySubscribeRequest::new(
            "http://sandbox.localdomain:4243",
            vec![SubscriptionType::Extension],
            Some(BufferingConfig {
                max_items: 1000,
                max_bytes: 262_144,
                timeout_ms: 25,
            }),
        );

        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["types"], json!(["extension"]));
        assert_eq!(
            value["buffering"],
            json!({"maxItems": 1000, "maxBytes": 262144, "timeoutMs": 25})
        );

        let decoded: TelemetrySubscribeRequest = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_logs_destination_optional_fields() {
        let mut request = LogsSubscribeRequest::new(
            "http://sandbox.localdomain:4243",
            vec![SubscriptionType::Function],
            None,
        );
        request.destination.method = Some(HttpMethod::Put);
        request.destination.encoding = Some(HttpEncoding::Json);

        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["destination"]["method"], "PUT");
        assert_eq!(value["destination"]["encoding"], "JSON");

        let decoded: LogsSubscribeRequest = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_buffering_defaults() {
        let buffering = BufferingConfig::default();

        assert_eq!(buffering.max_items, 10_000);
        assert_eq!(buffering.max_bytes, 262_144);
        assert_eq!(buffering.timeout_ms, 1_000);
    }
}
