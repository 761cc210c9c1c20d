//! Session-aware synchronous API calls.
//!
//! Every call carries the current `session_id`. A reply with
//! `error_id == "invalid_session_id"` renews the session and replays the
//! same request once; any further rejection surfaces to the caller.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use genwire_core::errors::{ClientError, Result, INVALID_SESSION_ERROR_ID};
use genwire_core::params::FlatParams;

use crate::session::SessionManager;

const DEFAULT_ERROR_MESSAGE: &str = "Request failed";

/// `<base>/API/<method>`.
pub fn api_url(base_url: &str, method: &str) -> String {
    format!("{}/API/{}", base_url.trim_end_matches('/'), method)
}

/// Shared HTTP client with a whole-request timeout.
pub fn build_http_client(request_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| ClientError::Config(format!("http client: {e}")))
}

/// Why a decoded reply was not accepted.
#[derive(Debug)]
pub(crate) enum Rejection {
    InvalidSession { message: String, details: Value },
    Failed(ClientError),
}

impl Rejection {
    pub(crate) fn into_error(self) -> ClientError {
        match self {
            Self::InvalidSession { message, details } => ClientError::SessionInvalid { message, details },
            Self::Failed(err) => err,
        }
    }
}

/// Classify a decoded reply. Non-2xx wins over any error id in the body.
pub(crate) fn check_response(status: StatusCode, body: Value) -> std::result::Result<Value, Rejection> {
    let error_id = body.get("error_id").and_then(Value::as_str).map(str::to_string);
    let error = body.get("error").and_then(Value::as_str);

    if !status.is_success() {
        return Err(Rejection::Failed(api_error(status, error_id, body)));
    }

    if error_id.is_none() && error.is_none() {
        return Ok(body);
    }

    if error_id.as_deref() == Some(INVALID_SESSION_ERROR_ID) {
        return Err(Rejection::InvalidSession {
            message: error_message(&body),
            details: body,
        });
    }
    Err(Rejection::Failed(api_error(status, error_id, body)))
}

fn error_message(body: &Value) -> String {
    body.get("error")
        .and_then(Value::as_str)
        .or_else(|| body.get("error_message").and_then(Value::as_str))
        .unwrap_or(DEFAULT_ERROR_MESSAGE)
        .to_string()
}

fn api_error(status: StatusCode, error_id: Option<String>, body: Value) -> ClientError {
    ClientError::Api {
        code: error_id.unwrap_or_else(|| status.as_u16().to_string()),
        message: error_message(&body),
        details: body,
    }
}

/// POST one JSON object and decode the reply. An unparseable body reads as `{}`.
pub(crate) async fn post_json(
    http: &reqwest::Client,
    url: &str,
    payload: &Value,
) -> Result<(StatusCode, Value)> {
    let resp = http
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    let body = serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        debug!(url, status = status.as_u16(), error = %e, "non-JSON reply body");
        Value::Object(Map::new())
    });
    Ok((status, body))
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    images: Vec<String>,
}

/// Client for `POST <base>/API/<Method>` calls.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    sessions: SessionManager,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, sessions: SessionManager) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Call `method` with `body` (a JSON object or null).
    pub async fn post(&self, method: &str, body: Value) -> Result<Value> {
        let params = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ClientError::Config(format!(
                    "request body for {method} must be a JSON object, got {other}"
                )))
            }
        };

        let url = api_url(&self.base_url, method);
        let mut session_id = self.sessions.ensure_session().await?;
        let mut attempt = 1u32;

        loop {
            let payload = with_session(&session_id, &params);
            debug!(method, attempt, "api call");
            let (status, body) = post_json(&self.http, &url, &payload).await?;

            match check_response(status, body) {
                Ok(body) => return Ok(body),
                Err(Rejection::InvalidSession { message, .. }) if attempt == 1 => {
                    warn!(method, attempt, %message, "session rejected, renewing");
                    session_id = self.sessions.refresh_session().await?;
                    attempt += 1;
                }
                Err(rejection @ Rejection::InvalidSession { .. }) => {
                    warn!(method, attempt, "session rejected after renewal");
                    return Err(rejection.into_error());
                }
                Err(Rejection::Failed(err)) => {
                    warn!(method, attempt, error_kind = err.error_kind(), error = %err, "api call failed");
                    return Err(err);
                }
            }
        }
    }

    /// Typed variant of [`ApiClient::post`].
    pub async fn call<T: DeserializeOwned>(&self, method: &str, body: impl Serialize) -> Result<T> {
        let body = serde_json::to_value(body)?;
        let reply = self.post(method, body).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Blocking `GenerateText2Image`. Returns image references in server order.
    pub async fn generate_text2image(&self, params: FlatParams) -> Result<Vec<String>> {
        let reply: GenerateResponse = self.call("GenerateText2Image", Value::Object(params)).await?;
        Ok(reply.images)
    }
}

/// `{session_id, ...params}`; a caller-supplied `session_id` is dropped so
/// the renewed id always reaches the server.
pub(crate) fn with_session(session_id: &str, params: &FlatParams) -> Value {
    let mut payload = Map::with_capacity(params.len() + 1);
    payload.insert("session_id".into(), Value::from(session_id));
    for (key, value) in params {
        if key != "session_id" {
            payload.insert(key.clone(), value.clone());
        }
    }
    Value::Object(payload)
}
