//! HTTP client for the Lambda Extensions API.
//!
//! A [`Client`] is obtained by registering through a [`ClientBuilder`]. The
//! identifier issued at registration is attached to every later call. Every
//! call is bound to an [`ExtensionContext`] so cancellation aborts the
//! in-flight round-trip.

use crate::config::ExtensionConfig;
use crate::context::ExtensionContext;
use crate::env;
use crate::error::{ApiError, ClientError};
use crate::event::{ErrorResponse, EventType, NextEvent, RegisterRequest, Registration};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// Header carrying the extension name on registration.
pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";

/// Header carrying the identifier issued at registration.
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Header carrying the error type on init and exit error reports.
pub const FUNCTION_ERROR_TYPE_HEADER: &str = "Lambda-Extension-Function-Error-Type";

const ACCEPT_FEATURE_HEADER: &str = "Lambda-Extension-Accept-Feature";
const EXTENSIONS_API_VERSION: &str = "2020-01-01";

/// Builder for registering with the Extensions API.
#[must_use = "builders do nothing unless .register() is called"]
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    extension_name: Option<String>,
    runtime_api: Option<String>,
    event_types: Vec<EventType>,
    http_client: Option<reqwest::Client>,
}

impl ClientBuilder {
    /// Creates a builder registering for invoke and shutdown events.
    pub fn new() -> Self {
        Self {
            extension_name: None,
            runtime_api: None,
            event_types: vec![EventType::Invoke, EventType::Shutdown],
            http_client: None,
        }
    }

    /// Applies the extension name and runtime API address from `config`.
    pub fn from_config(mut self, config: &ExtensionConfig) -> Self {
        if let Some(name) = &config.extension_name {
            self.extension_name = Some(name.clone());
        }
        if let Some(runtime_api) = &config.runtime_api {
            self.runtime_api = Some(runtime_api.clone());
        }
        self
    }

    /// Sets the extension name. Defaults to the file name of the executable,
    /// which is what the platform expects for external extensions.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.extension_name = Some(name.into());
        self
    }

    /// Sets the runtime API address. Defaults to `AWS_LAMBDA_RUNTIME_API`.
    pub fn runtime_api(mut self, address: impl Into<String>) -> Self {
        self.runtime_api = Some(address.into());
        self
    }

    /// Sets the lifecycle events to register for.
    pub fn event_types(mut self, event_types: impl Into<Vec<EventType>>) -> Self {
        self.event_types = event_types.into();
        self
    }

    /// Sets the HTTP client. It must not impose a request timeout, as the
    /// next event call blocks for as long as the platform decides.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Registers the extension and returns a client bound to the issued
    /// identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::MissingRuntimeApi`] before any network traffic
    /// if no runtime API address is known, [`ClientError::MissingExtensionId`]
    /// if the platform did not issue an identifier, or any other
    /// [`ClientError`] from the round-trip.
    pub async fn register(self, ctx: &ExtensionContext) -> Result<Client, ClientError> {
        let runtime_api = match self.runtime_api.or_else(env::runtime_api) {
            Some(address) => address,
            None => {
                tracing::error!("AWS_LAMBDA_RUNTIME_API is not set");
                return Err(ClientError::MissingRuntimeApi);
            }
        };
        let extension_name = self.extension_name.unwrap_or_else(default_extension_name);
        let http = self.http_client.unwrap_or_default();
        let base_url = format!("http://{runtime_api}");

        let body = serde_json::to_vec(&RegisterRequest {
            events: &self.event_types,
        })
        .map_err(ClientError::Encode)?;

        tracing::debug!(
            extension_name = %extension_name,
            events = ?self.event_types,
            "Sending register request"
        );

        let url = format!("{base_url}/{EXTENSIONS_API_VERSION}/extension/register");
        let request = http
            .post(url)
            .header(EXTENSION_NAME_HEADER, &extension_name)
            .header(ACCEPT_FEATURE_HEADER, "accountId")
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        let response = send(ctx, request, StatusCode::OK).await.inspect_err(|e| {
            tracing::error!(error = %e, "Register call failed");
        })?;

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| {
                tracing::error!("Register response has no extension identifier");
                ClientError::MissingExtensionId
            })?;

        let registration: Registration = decode(ctx, response).await?;

        tracing::debug!(
            extension_id = %extension_id,
            function_name = %registration.function_name,
            function_version = %registration.function_version,
            "Extension registered"
        );

        Ok(Client {
            inner: Arc::new(Inner {
                http,
                base_url,
                extension_id,
                registration,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Inner {
    http: reqwest::Client,
    base_url: String,
    extension_id: String,
    registration: Registration,
}

/// Registered Extensions API client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Returns the identifier issued at registration.
    pub fn extension_id(&self) -> &str {
        &self.inner.extension_id
    }

    /// Returns the function metadata returned at registration.
    pub fn registration(&self) -> &Registration {
        &self.inner.registration
    }

    /// Returns the function name.
    pub fn function_name(&self) -> &str {
        &self.inner.registration.function_name
    }

    /// Returns the function version.
    pub fn function_version(&self) -> &str {
        &self.inner.registration.function_version
    }

    /// Returns the function handler.
    pub fn handler(&self) -> &str {
        &self.inner.registration.handler
    }

    /// Returns the account owning the function.
    pub fn account_id(&self) -> &str {
        &self.inner.registration.account_id
    }

    /// Blocks until the platform delivers the next lifecycle event.
    ///
    /// There is no client-side timeout: the platform may hold the call open
    /// for the lifetime of the execution environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the call fails or `ctx` stops first.
    pub async fn next_event(&self, ctx: &ExtensionContext) -> Result<NextEvent, ClientError> {
        tracing::debug!("Requesting next event");

        let request = self.request(Method::GET, "/event/next");
        let event: NextEvent = call(ctx, request, StatusCode::OK)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Next event call failed"))?;

        tracing::debug!(event = ?event, "Next event received");
        Ok(event)
    }

    /// Reports an initialization failure. The platform then shuts the
    /// environment down.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the report could not be delivered.
    pub async fn init_error(
        &self,
        ctx: &ExtensionContext,
        error_type: &str,
        error: impl fmt::Display,
    ) -> Result<ErrorResponse, ClientError> {
        self.report_error(ctx, "/init/error", error_type, error.to_string())
            .await
    }

    /// Reports a failure before exiting.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the report could not be delivered.
    pub async fn exit_error(
        &self,
        ctx: &ExtensionContext,
        error_type: &str,
        error: impl fmt::Display,
    ) -> Result<ErrorResponse, ClientError> {
        self.report_error(ctx, "/exit/error", error_type, error.to_string())
            .await
    }

    async fn report_error(
        &self,
        ctx: &ExtensionContext,
        action: &str,
        error_type: &str,
        body: String,
    ) -> Result<ErrorResponse, ClientError> {
        tracing::debug!(action, error_type, body = %body, "Reporting error");

        let request = self
            .request(Method::POST, action)
            .header(FUNCTION_ERROR_TYPE_HEADER, error_type)
            .body(body);

        let response: ErrorResponse = call(ctx, request, StatusCode::ACCEPTED)
            .await
            .inspect_err(|e| tracing::error!(action, error = %e, "Error report failed"))?;

        tracing::debug!(action, status = %response.status, "Error reported");
        Ok(response)
    }

    /// Sends `body` to an API outside the extension path, e.g. the logs or
    /// telemetry subscription endpoints.
    pub(crate) async fn put_json<T>(
        &self,
        ctx: &ExtensionContext,
        path: &str,
        body: &T,
    ) -> Result<(), ClientError>
    where
        T: serde::Serialize,
    {
        let body = serde_json::to_vec(body).map_err(ClientError::Encode)?;
        let url = format!("{}{path}", self.inner.base_url);

        let request = self
            .inner
            .http
            .put(url)
            .header(EXTENSION_ID_HEADER, &self.inner.extension_id)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        send(ctx, request, StatusCode::OK).await?;
        Ok(())
    }

    fn request(&self, method: Method, action: &str) -> RequestBuilder {
        let url = format!(
            "{}/{EXTENSIONS_API_VERSION}/extension{action}",
            self.inner.base_url
        );
        let is_write = method == Method::POST || method == Method::PUT;

        let request = self
            .inner
            .http
            .request(method, url)
            .header(EXTENSION_ID_HEADER, &self.inner.extension_id);

        if is_write {
            request.header(CONTENT_TYPE, "application/json")
        } else {
            request
        }
    }
}

/// Sends `request` and turns any status other than `expected` into an error.
async fn send(
    ctx: &ExtensionContext,
    request: RequestBuilder,
    expected: StatusCode,
) -> Result<Response, ClientError> {
    let response = ctx.run(request.send()).await??;
    let status = response.status();

    if status == expected {
        return Ok(response);
    }

    let body = ctx.run(response.text()).await??;
    match serde_json::from_str::<ApiError>(&body) {
        Ok(mut api_error) => {
            api_error.status = status.as_u16();
            Err(ClientError::Api(api_error))
        }
        Err(_) => Err(ClientError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        }),
    }
}

async fn call<T>(
    ctx: &ExtensionContext,
    request: RequestBuilder,
    expected: StatusCode,
) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let response = send(ctx, request, expected).await?;
    decode(ctx, response).await
}

async fn decode<T>(ctx: &ExtensionContext, response: Response) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let body = ctx.run(response.bytes()).await??;

    serde_json::from_slice(&body).map_err(|source| ClientError::Decode {
        body: String::from_utf8_lossy(&body).into_owned(),
        source,
    })
}

fn default_extension_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}
