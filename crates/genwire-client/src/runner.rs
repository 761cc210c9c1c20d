//! One WebSocket generation run, from open to final image.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use genwire_core::errors::{ClientError, Result};
use genwire_core::events::ProtocolEvent;
use genwire_core::ids::RequestId;
use genwire_core::job::{normalize_percent, ProgressUpdate};
use genwire_core::params::{take_image_count, FlatParams, IMAGES_KEY};

use crate::dispatch::{Dispatcher, Subscription};
use crate::jobs::JobStore;
use crate::session::SessionManager;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(4_000);
pub const DECODE_ERROR_CODE: &str = "decode_error";
const STREAM_METHOD: &str = "GenerateText2ImageWS";

/// Receives every event with the request id it was resolved to.
pub type EventCallback = Arc<dyn Fn(&RequestId, &ProtocolEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Streaming,
    Closed,
    OpenTimedOut,
}

#[derive(Clone)]
pub struct RunOptions {
    /// Generated when unset.
    pub request_id: Option<RequestId>,
    /// Only the open handshake is bounded.
    pub open_timeout: Duration,
    pub on_event: Option<EventCallback>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            request_id: None,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            on_event: None,
        }
    }
}

impl RunOptions {
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RequestId, &ProtocolEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }
}

/// Control handle for a running stream.
#[derive(Clone)]
pub struct JobHandle {
    request_id: RequestId,
    cancel: CancellationToken,
    finished: CancellationToken,
    state: Arc<Mutex<ConnectionState>>,
}

impl JobHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Ask the socket to close. Safe to call repeatedly; the job is settled
    /// by the reader once the socket is actually gone.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(request_id = %self.request_id, "closing stream");
            self.cancel.cancel();
        }
    }

    /// Resolves once the socket is closed and the job finalised.
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

/// Opens generation sockets and folds their events into the [`JobStore`].
#[derive(Clone)]
pub struct StreamRunner {
    sessions: SessionManager,
    jobs: Arc<JobStore>,
    ws_base: String,
}

impl StreamRunner {
    pub fn new(sessions: SessionManager, jobs: Arc<JobStore>, ws_base: impl Into<String>) -> Self {
        Self {
            sessions,
            jobs,
            ws_base: ws_base.into(),
        }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn stream_url(&self) -> String {
        format!("{}/API/{}", self.ws_base.trim_end_matches('/'), STREAM_METHOD)
    }

    /// Start a generation over the stream.
    ///
    /// The job is created and made active before any network I/O. Failing to
    /// open (timeout or connect error) leaves the job `Running` so the caller
    /// can retry the same request another way.
    pub async fn run(&self, mut payload: FlatParams, options: RunOptions) -> Result<JobHandle> {
        let session_id = self.sessions.ensure_session().await?;

        let request_id = options.request_id.unwrap_or_default();
        self.jobs.ensure_job(&request_id);
        self.jobs.set_active(Some(request_id.clone()));

        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let url = self.stream_url();
        debug!(request_id = %request_id, %url, "opening stream");

        let ws = match tokio::time::timeout(options.open_timeout, tokio_tungstenite::connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                *state.lock() = ConnectionState::Closed;
                warn!(request_id = %request_id, error = %e, "stream connect failed");
                return Err(ClientError::Transport(e.to_string()));
            }
            Err(_) => {
                *state.lock() = ConnectionState::OpenTimedOut;
                warn!(
                    request_id = %request_id,
                    timeout_ms = options.open_timeout.as_millis() as u64,
                    "stream did not open in time"
                );
                return Err(ClientError::OpenTimeout(options.open_timeout));
            }
        };
        *state.lock() = ConnectionState::Open;

        let (mut sink, stream) = ws.split();
        let images = take_image_count(&mut payload);
        let frame = initial_frame(&session_id, images, payload);
        if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
            *state.lock() = ConnectionState::Closed;
            warn!(request_id = %request_id, error = %e, "failed to send generation request");
            return Err(ClientError::Transport(e.to_string()));
        }
        *state.lock() = ConnectionState::Streaming;
        info!(request_id = %request_id, images, "stream open");

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let dispatcher = Dispatcher::new();
        let sub_jobs = SubJobs::default();
        let subscription = subscribe_job_updates(
            &dispatcher,
            Arc::clone(&self.jobs),
            request_id.clone(),
            Arc::clone(&sub_jobs),
            options.on_event,
            cancel.clone(),
        );

        let reader = StreamReader {
            request_id: request_id.clone(),
            jobs: Arc::clone(&self.jobs),
            dispatcher,
            subscription,
            sub_jobs,
            cancel: cancel.clone(),
            finished: finished.clone(),
            state: Arc::clone(&state),
        };
        tokio::spawn(reader.run(sink, stream));

        Ok(JobHandle {
            request_id,
            cancel,
            finished,
            state,
        })
    }
}

/// `{session_id, images, ...rest}`.
fn initial_frame(session_id: &str, images: u64, params: FlatParams) -> Value {
    let mut frame = Map::with_capacity(params.len() + 2);
    frame.insert("session_id".into(), Value::from(session_id));
    frame.insert(IMAGES_KEY.into(), Value::from(images));
    for (key, value) in params {
        if key != "session_id" {
            frame.insert(key, value);
        }
    }
    Value::Object(frame)
}

/// Wire metadata to the job's representation: absent, explicit null, or text.
fn metadata_entry(metadata: &Option<Value>) -> Option<Option<String>> {
    metadata.as_ref().map(|value| match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}

/// Other request ids this connection has written to.
type SubJobs = Arc<Mutex<BTreeSet<RequestId>>>;

fn subscribe_job_updates(
    dispatcher: &Dispatcher,
    jobs: Arc<JobStore>,
    original: RequestId,
    sub_jobs: SubJobs,
    on_event: Option<EventCallback>,
    cancel: CancellationToken,
) -> Subscription {
    dispatcher.subscribe(move |event| {
        let resolved = event.request_id().cloned().unwrap_or_else(|| original.clone());
        if resolved != original {
            sub_jobs.lock().insert(resolved.clone());
        }

        match event {
            ProtocolEvent::Progress {
                batch_index,
                overall_percent,
                current_percent,
                preview,
                metadata,
                ..
            } => {
                jobs.ensure_job(&resolved);
                jobs.update_progress(
                    &resolved,
                    ProgressUpdate {
                        batch_index: batch_index.clone(),
                        overall_percent: overall_percent.map(normalize_percent),
                        current_percent: current_percent.map(normalize_percent),
                        preview: preview.clone(),
                        metadata: metadata_entry(metadata),
                    },
                );
            }
            ProtocolEvent::Image {
                image,
                batch_index,
                metadata,
                ..
            } => {
                jobs.ensure_job(&resolved);
                jobs.add_image(&resolved, batch_index.as_str(), image.as_str(), metadata_entry(metadata));
            }
            ProtocolEvent::Error { message, code } => {
                warn!(request_id = %original, code = ?code, %message, "generation error");
                jobs.mark_error(&original, message.as_str());
                // A bad frame does not end the stream; the server still decides.
                if code.as_deref() != Some(DECODE_ERROR_CODE) {
                    cancel.cancel();
                }
            }
            ProtocolEvent::Close => {
                jobs.mark_complete(&original);
                for sub_job in sub_jobs.lock().iter() {
                    jobs.mark_complete(sub_job);
                }
            }
            ProtocolEvent::Status { .. } | ProtocolEvent::Discard { .. } | ProtocolEvent::KeepAlive => {}
        }

        if let Some(callback) = &on_event {
            callback(&resolved, event);
        }
    })
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct StreamReader {
    request_id: RequestId,
    jobs: Arc<JobStore>,
    dispatcher: Dispatcher,
    subscription: Subscription,
    sub_jobs: SubJobs,
    cancel: CancellationToken,
    finished: CancellationToken,
    state: Arc<Mutex<ConnectionState>>,
}

impl StreamReader {
    async fn run(
        self,
        mut sink: futures::stream::SplitSink<WsStream, Message>,
        mut stream: futures::stream::SplitStream<WsStream>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(request_id = %self.request_id, error = %e, "close frame not sent");
                    }
                    break;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(request_id = %self.request_id, ?frame, "server closed stream");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.transport_error(&e.to_string());
                        break;
                    }
                    None => break,
                },
            }
        }
        self.finish();
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(frame) => {
                if let Some(event) = self.dispatcher.dispatch(&frame) {
                    trace!(request_id = %self.request_id, kind = event.kind(), "stream event");
                }
            }
            Err(e) => {
                warn!(request_id = %self.request_id, error = %e, "undecodable stream frame");
                self.dispatcher.emit(&ProtocolEvent::Error {
                    message: format!("Failed to decode frame: {e}"),
                    code: Some(DECODE_ERROR_CODE.to_string()),
                });
            }
        }
    }

    fn transport_error(&self, error: &str) {
        let settled = self.jobs.get(&self.request_id).is_some_and(|job| job.is_terminal());
        if settled {
            debug!(request_id = %self.request_id, error, "transport error after job settled");
            return;
        }
        warn!(request_id = %self.request_id, error, "stream transport error");
        self.jobs
            .mark_error(&self.request_id, format!("WebSocket transport error: {error}"));
    }

    fn finish(self) {
        drop(self.subscription);
        *self.state.lock() = ConnectionState::Closed;

        let sub_jobs = std::mem::take(&mut *self.sub_jobs.lock());
        for id in std::iter::once(&self.request_id).chain(sub_jobs.iter()) {
            let settled = self.jobs.get(id).is_some_and(|job| job.is_terminal());
            if !settled {
                self.jobs.mark_complete(id);
            }
        }
        info!(request_id = %self.request_id, sub_jobs = sub_jobs.len(), "stream closed");
        self.finished.cancel();
    }
}
