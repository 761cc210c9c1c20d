//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may carry any subset of fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "baseUrl": "http://gpu-box:7801" },
///   "stream": { "openTimeoutMs": 8000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenwireSettings {
    pub server: ServerSettings,
    pub stream: StreamSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

/// Backend endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// HTTP base, without the `/API` suffix.
    pub base_url: String,
    /// WebSocket base. Derived from `base_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    /// Whole-request timeout for synchronous calls.
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7801".to_string(),
            ws_url: None,
            request_timeout_ms: 300_000,
        }
    }
}

impl ServerSettings {
    /// WebSocket base: explicit `wsUrl`, or `baseUrl` with `http`→`ws`.
    pub fn resolved_ws_url(&self) -> Result<String> {
        if let Some(ws) = &self.ws_url {
            return Ok(ws.trim_end_matches('/').to_string());
        }
        let base = self.base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(SettingsError::InvalidValue(format!(
                "baseUrl must start with http:// or https://, got {base}"
            )))
        }
    }
}

/// Streaming job settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// How long the socket may take to open before falling back to HTTP.
    pub open_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self { open_timeout_ms: 4_000 }
    }
}

/// Session persistence settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Reuse the last session across process restarts.
    pub persist: bool,
    /// Session file. Defaults to `~/.genwire/session.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            persist: true,
            file: None,
        }
    }
}

impl SessionSettings {
    pub fn resolved_file(&self) -> PathBuf {
        match &self.file {
            Some(path) => PathBuf::from(path),
            None => crate::loader::genwire_dir().join("session.json"),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive. `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
