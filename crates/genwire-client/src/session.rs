//! Session acquisition, renewal, and persistence.
//!
//! At most one `GetNewSession` request is in flight at a time. It runs as a
//! spawned task shared by every caller that asks while it is pending, so a
//! caller giving up (dropped future or cancelled token) never aborts the
//! fetch for the others.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use genwire_core::errors::{ClientError, Result};
use genwire_core::session::{NewSessionResponse, Session};

use crate::http::{api_url, check_response, post_json, Rejection};
use crate::storage::SessionStorage;

/// Issues new sessions.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch(&self) -> Result<Session>;
}

/// `POST <base>/API/GetNewSession` with an empty object.
pub struct HttpSessionSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSessionSource {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch(&self) -> Result<Session> {
        let url = api_url(&self.base_url, "GetNewSession");
        let (status, body) = post_json(&self.http, &url, &json!({})).await?;
        let body = check_response(status, body).map_err(Rejection::into_error)?;
        let response: NewSessionResponse = serde_json::from_value(body)?;
        Ok(response.into())
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct SessionState {
    current: Option<Arc<Session>>,
    in_flight: Option<InFlight>,
    /// Bumped by `clear`; fetches from an older epoch are not stored.
    epoch: u64,
    next_fetch_id: u64,
}

struct Inner {
    source: Arc<dyn SessionSource>,
    storage: Option<Arc<dyn SessionStorage>>,
    state: Mutex<SessionState>,
}

/// Owns the current session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        Self::build(source, None, None)
    }

    /// Start from the persisted session, if any, and persist every new one.
    pub fn with_storage(source: Arc<dyn SessionSource>, storage: Arc<dyn SessionStorage>) -> Self {
        let initial = match storage.load() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "failed to load persisted session, starting without one");
                None
            }
        };
        if let Some(session) = &initial {
            debug!(session_id = %session.session_id, "restored persisted session");
        }
        Self::build(source, Some(storage), initial)
    }

    fn build(
        source: Arc<dyn SessionSource>,
        storage: Option<Arc<dyn SessionStorage>>,
        initial: Option<Session>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                storage,
                state: Mutex::new(SessionState {
                    current: initial.map(Arc::new),
                    ..Default::default()
                }),
            }),
        }
    }

    /// Current session id, fetching one only when none is held.
    pub async fn ensure_session(&self) -> Result<String> {
        let fetch = {
            let mut state = self.inner.state.lock();
            if let Some(session) = &state.current {
                return Ok(session.session_id.clone());
            }
            Inner::join_or_start(&self.inner, &mut state)
        };
        Ok(fetch.await?.session_id.clone())
    }

    /// Replace the session with a newly issued one.
    pub async fn refresh_session(&self) -> Result<String> {
        let fetch = {
            let mut state = self.inner.state.lock();
            Inner::join_or_start(&self.inner, &mut state)
        };
        Ok(fetch.await?.session_id.clone())
    }

    pub async fn ensure_session_cancellable(&self, cancel: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.ensure_session() => result,
        }
    }

    pub async fn refresh_session_cancellable(&self, cancel: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.refresh_session() => result,
        }
    }

    /// Forget the session here and in storage.
    pub fn clear_session(&self) {
        let mut state = self.inner.state.lock();
        state.current = None;
        state.in_flight = None;
        state.epoch += 1;
        if let Some(storage) = &self.inner.storage {
            if let Err(e) = storage.clear() {
                warn!(error = %e, "failed to clear persisted session");
            }
        }
        info!("session cleared");
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner.state.lock().current.clone()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.current()
            .is_some_and(|session| session.has_permission(permission))
    }
}

impl Inner {
    fn join_or_start(this: &Arc<Self>, state: &mut SessionState) -> SharedFetch {
        if let Some(in_flight) = &state.in_flight {
            debug!(fetch_id = in_flight.id, "joining in-flight session fetch");
            return in_flight.fetch.clone();
        }

        let id = state.next_fetch_id;
        state.next_fetch_id += 1;
        let epoch = state.epoch;

        let inner = Arc::clone(this);
        let task = tokio::spawn(async move {
            let result = inner.source.fetch().await;
            inner.finish_fetch(id, epoch, result)
        });

        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ClientError::Transport(format!("session fetch task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        debug!(fetch_id = id, "session fetch started");
        state.in_flight = Some(InFlight {
            id,
            fetch: fetch.clone(),
        });
        fetch
    }

    fn finish_fetch(&self, id: u64, epoch: u64, result: Result<Session>) -> Result<Arc<Session>> {
        let mut state = self.state.lock();
        if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
            state.in_flight = None;
        }

        let session = match result {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(fetch_id = id, error_kind = e.error_kind(), error = %e, "session fetch failed");
                return Err(e);
            }
        };

        if state.epoch != epoch {
            debug!(fetch_id = id, "session cleared during fetch, not storing");
            return Ok(session);
        }

        info!(session_id = %session.session_id, "new session");
        state.current = Some(Arc::clone(&session));
        // Written under the state lock so a concurrent clear cannot be
        // overtaken by this save.
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(&session) {
                warn!(error = %e, "failed to persist session");
            }
        }
        Ok(session)
    }
}
