//! Classification of inbound stream frames.
//!
//! [`decode_frame`] turns one decoded JSON frame into at most one
//! [`ProtocolEvent`]. The order of checks is part of the protocol: a frame
//! carrying several recognised fields is classified by the first rule that
//! matches, not by the richest one.
//!
//! [`Dispatcher`] adds synchronous, registration-ordered delivery to
//! subscribed listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use genwire_core::events::{BackendStatus, ProtocolEvent};
use genwire_core::ids::RequestId;

pub const INVALID_MESSAGE: &str = "Invalid message";
pub const INVALID_GEN_PROGRESS: &str = "Invalid gen_progress payload";

/// Classify one frame. Never panics; malformed input becomes an `Error`
/// event and unknown shapes yield `None`.
pub fn decode_frame(frame: &Value) -> Option<ProtocolEvent> {
    let Some(obj) = frame.as_object() else {
        return Some(ProtocolEvent::error(INVALID_MESSAGE));
    };

    if str_field(obj, "socket_intention") == Some("close") {
        return Some(ProtocolEvent::Close);
    }

    if let Some(error) = str_field(obj, "error") {
        return Some(ProtocolEvent::Error {
            message: error.to_string(),
            code: str_field(obj, "error_id").map(str::to_string),
        });
    }

    if let (Some(error_id), Some(error_message)) =
        (str_field(obj, "error_id"), str_field(obj, "error_message"))
    {
        return Some(ProtocolEvent::Error {
            message: error_message.to_string(),
            code: Some(error_id.to_string()),
        });
    }

    if let Some(status) = obj.get("status").and_then(Value::as_object) {
        return Some(decode_status(obj, status));
    }

    if let Some(progress) = obj.get("gen_progress") {
        return Some(
            decode_progress(progress).unwrap_or_else(|| ProtocolEvent::error(INVALID_GEN_PROGRESS)),
        );
    }

    if let (Some(image), Some(batch_index)) = (str_field(obj, "image"), str_field(obj, "batch_index")) {
        return Some(ProtocolEvent::Image {
            image: image.to_string(),
            batch_index: batch_index.to_string(),
            request_id: request_id_field(obj),
            metadata: obj.get("metadata").cloned(),
        });
    }

    if let Some(image) = obj.get("image") {
        if !image.is_string() {
            if let Some(event) = decode_nested_image(obj, image) {
                return Some(event);
            }
        }
    }

    if let Some(indices) = obj.get("discard_indices").and_then(Value::as_array) {
        let indices = indices
            .iter()
            .filter_map(Value::as_f64)
            .filter(|n| n.is_finite())
            .map(|n| n as i64)
            .collect();
        return Some(ProtocolEvent::Discard { indices });
    }

    if obj.get("keep_alive") == Some(&Value::Bool(true)) {
        return Some(ProtocolEvent::KeepAlive);
    }

    None
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn int_field(obj: &Map<String, Value>, key: &str) -> i64 {
    match obj.get(key) {
        Some(v) => v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)).unwrap_or(0),
        None => 0,
    }
}

fn request_id_field(obj: &Map<String, Value>) -> Option<RequestId> {
    str_field(obj, "request_id").map(RequestId::from)
}

fn decode_status(frame: &Map<String, Value>, status: &Map<String, Value>) -> ProtocolEvent {
    let backend_status = frame
        .get("backend_status")
        .and_then(Value::as_object)
        .map(|b| BackendStatus {
            status: str_field(b, "status").unwrap_or_default().to_string(),
            class: str_field(b, "class").unwrap_or_default().to_string(),
            message: str_field(b, "message").unwrap_or_default().to_string(),
            any_loading: b.get("any_loading").and_then(Value::as_bool).unwrap_or(false),
        });

    let supported_features = frame
        .get("supported_features")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    ProtocolEvent::Status {
        waiting_gens: int_field(status, "waiting_gens"),
        loading_models: int_field(status, "loading_models"),
        waiting_backends: int_field(status, "waiting_backends"),
        live_gens: int_field(status, "live_gens"),
        backend_status,
        supported_features,
    }
}

fn decode_progress(progress: &Value) -> Option<ProtocolEvent> {
    let p = progress.as_object()?;
    let batch_index = str_field(p, "batch_index")?;
    Some(ProtocolEvent::Progress {
        batch_index: batch_index.to_string(),
        overall_percent: p.get("overall_percent").and_then(Value::as_f64),
        current_percent: p.get("current_percent").and_then(Value::as_f64),
        preview: str_field(p, "preview").map(str::to_string),
        request_id: request_id_field(p),
        metadata: p.get("metadata").cloned(),
    })
}

fn decode_nested_image(frame: &Map<String, Value>, image: &Value) -> Option<ProtocolEvent> {
    let nested = image.as_object()?;
    let data = str_field(nested, "image")?;
    let batch_index = str_field(nested, "batch_index")?;
    Some(ProtocolEvent::Image {
        image: data.to_string(),
        batch_index: batch_index.to_string(),
        request_id: request_id_field(nested).or_else(|| request_id_field(frame)),
        metadata: nested.get("metadata").cloned(),
    })
}

type Listener = Arc<dyn Fn(&ProtocolEvent) + Send + Sync>;

struct DispatcherInner {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// Fan-out of classified frames to subscribed listeners.
///
/// Delivery is synchronous and in registration order. Each pass works on a
/// snapshot of the listener list, so subscribing or unsubscribing from inside
/// a listener only affects later frames.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ProtocolEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));
        Subscription {
            id,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Classify `frame` and deliver the resulting event, if any.
    pub fn dispatch(&self, frame: &Value) -> Option<ProtocolEvent> {
        let event = decode_frame(frame)?;
        self.emit(&event);
        Some(event)
    }

    /// Deliver an already-built event (e.g. a synthetic decode error).
    pub fn emit(&self, event: &ProtocolEvent) {
        let snapshot: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

/// Handle for one registered listener.
pub struct Subscription {
    id: u64,
    dispatcher: Weak<DispatcherInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}
