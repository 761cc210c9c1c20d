use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RequestId;

/// One classified inbound stream frame.
///
/// Percent fields carry raw server units (either 0–1 or 0–100); consumers
/// normalise them. `metadata` keeps presence: `None` means the field was
/// absent, `Some(Value::Null)` means the server sent an explicit null.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Status {
        waiting_gens: i64,
        loading_models: i64,
        waiting_backends: i64,
        live_gens: i64,
        backend_status: Option<BackendStatus>,
        supported_features: Vec<String>,
    },
    Progress {
        batch_index: String,
        overall_percent: Option<f64>,
        current_percent: Option<f64>,
        preview: Option<String>,
        request_id: Option<RequestId>,
        metadata: Option<Value>,
    },
    Image {
        image: String,
        batch_index: String,
        request_id: Option<RequestId>,
        metadata: Option<Value>,
    },
    Discard {
        indices: Vec<i64>,
    },
    KeepAlive,
    Close,
    Error {
        message: String,
        code: Option<String>,
    },
}

/// Backend health summary pushed alongside queue status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub status: String,
    pub class: String,
    pub message: String,
    pub any_loading: bool,
}

impl ProtocolEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    /// Request id named by the frame itself, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Progress { request_id, .. } | Self::Image { request_id, .. } => {
                request_id.as_ref()
            }
            _ => None,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Progress { .. } => "progress",
            Self::Image { .. } => "image",
            Self::Discard { .. } => "discard",
            Self::KeepAlive => "keep_alive",
            Self::Close => "close",
            Self::Error { .. } => "error",
        }
    }
}
