use std::time::Duration;

use reqwest::header::InvalidHeaderValue;
use reqwest::{Client, StatusCode};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::LiveConfig;
use crate::signing::SignatureContext;

pub const APP_START_PATH: &str = "/v2/app/start";
pub const APP_HEARTBEAT_PATH: &str = "/v2/app/heartbeat";
pub const APP_END_PATH: &str = "/v2/app/end";

/// Signed HTTP client for the open-platform API.
///
/// Every call is signed with a fresh [`SignatureContext`]. Calls are never
/// retried.
#[derive(Clone)]
pub struct OpenApiClient {
    http: Client,
    access_key_id: String,
    access_key_secret: SecretString,
    base_url: String,
}

impl OpenApiClient {
    pub fn new(config: &LiveConfig) -> Result<Self, OpenApiError> {
        Self::with_timeouts(
            config.access_key_id.clone(),
            config.access_key_secret.clone(),
            config.api_host.clone(),
            config.connect_timeout,
            config.request_timeout,
        )
    }

    pub fn with_timeouts(
        access_key_id: String,
        access_key_secret: SecretString,
        base_url: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, OpenApiError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(OpenApiError::Transport)?;

        Ok(Self {
            http,
            access_key_id,
            access_key_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts a raw JSON `body` to `path` and returns the response envelope.
    ///
    /// A non-success HTTP status yields [`OpenApiError::HttpStatus`] with the
    /// server's body untouched. The envelope's own `code` is not inspected
    /// here; see [`ApiResponse::into_data`].
    pub async fn send(&self, body: &str, path: &str) -> Result<ApiResponse, OpenApiError> {
        let endpoint = self.endpoint(path);
        let context = SignatureContext::for_body(&self.access_key_id, body);
        let headers = context.header_map(&self.access_key_secret)?;

        let response = self
            .http
            .post(&endpoint)
            .headers(headers)
            .body(body.to_string())
            .send()
            .await
            .map_err(OpenApiError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(OpenApiError::Transport)?;

        debug!(event = "open_api_response", path, status = status.as_u16());

        if !status.is_success() {
            return Err(OpenApiError::HttpStatus { status, body: text });
        }

        serde_json::from_str(&text).map_err(OpenApiError::Json)
    }

    /// Serializes `request`, sends it, and decodes the envelope payload.
    pub async fn call<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, OpenApiError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_string(request)?;
        self.send(&body, path).await?.into_data()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Response envelope shared by every open-platform endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Fails with [`OpenApiError::Api`] when the envelope code is non-zero.
    pub fn into_result(self) -> Result<Self, OpenApiError> {
        if self.is_ok() {
            return Ok(self);
        }
        Err(OpenApiError::Api {
            code: self.code,
            message: self.message,
            request_id: self.request_id,
        })
    }

    /// Checks the envelope code and decodes `data` into `T`.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, OpenApiError> {
        let response = self.into_result()?;
        let data = match response.data {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        serde_json::from_value(data).map_err(OpenApiError::Json)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartAppRequest {
    /// Broadcaster identity code.
    pub code: String,
    pub app_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppHeartbeatRequest {
    pub game_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndAppRequest {
    pub game_id: String,
    pub app_id: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartAppData {
    #[serde(default)]
    pub game_info: GameInfo,
    #[serde(default)]
    pub websocket_info: WebsocketInfo,
    #[serde(default)]
    pub anchor_info: AnchorInfo,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameInfo {
    #[serde(default)]
    pub game_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebsocketInfo {
    /// Opaque payload sent verbatim in the socket AUTH frame.
    #[serde(default)]
    pub auth_body: String,
    #[serde(default)]
    pub wss_link: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorInfo {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub uface: String,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub open_id: String,
}

#[derive(Debug, Error)]
pub enum OpenApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("open-platform code {code}: {message} (request_id={request_id})")]
    Api {
        code: i64,
        message: String,
        request_id: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}
