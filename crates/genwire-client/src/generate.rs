//! Stream-first generation with a blocking HTTP fallback.

use std::sync::Arc;

use tracing::{info, warn};

use genwire_core::errors::Result;
use genwire_core::ids::RequestId;
use genwire_core::params::{FlatParams, GenerationParams};

use crate::http::ApiClient;
use crate::jobs::JobStore;
use crate::runner::{JobHandle, RunOptions, StreamRunner};

#[derive(Clone)]
pub struct GenerateOptions {
    pub run: RunOptions,
    /// Retry over `GenerateText2Image` when the stream cannot be opened.
    pub fallback: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            run: RunOptions::default(),
            fallback: true,
        }
    }
}

pub enum GenerationOutcome {
    /// Events keep arriving; follow the job in the store or via the handle.
    Streaming(JobHandle),
    /// The stream never opened; the job already holds every image.
    Fallback { request_id: RequestId, images: Vec<String> },
}

impl GenerationOutcome {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Streaming(handle) => handle.request_id(),
            Self::Fallback { request_id, .. } => request_id,
        }
    }
}

#[derive(Clone)]
pub struct Generator {
    runner: StreamRunner,
    api: ApiClient,
}

impl Generator {
    pub fn new(runner: StreamRunner, api: ApiClient) -> Self {
        Self { runner, api }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        self.runner.jobs()
    }

    pub async fn generate(&self, params: &GenerationParams, options: GenerateOptions) -> Result<GenerationOutcome> {
        self.generate_flat(params.flatten(), options).await
    }

    /// Same as [`Generator::generate`] for an already flattened payload.
    pub async fn generate_flat(&self, payload: FlatParams, options: GenerateOptions) -> Result<GenerationOutcome> {
        let request_id = options.run.request_id.clone().unwrap_or_default();
        let run = options.run.with_request_id(request_id.clone());

        match self.runner.run(payload.clone(), run).await {
            Ok(handle) => Ok(GenerationOutcome::Streaming(handle)),
            Err(e) if options.fallback && e.is_fallback_eligible() => {
                warn!(
                    request_id = %request_id,
                    error_kind = e.error_kind(),
                    error = %e,
                    "stream unavailable, falling back to GenerateText2Image"
                );
                self.fallback(request_id, payload).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fallback(&self, request_id: RequestId, payload: FlatParams) -> Result<GenerationOutcome> {
        let jobs = self.runner.jobs();
        jobs.ensure_job(&request_id);

        match self.api.generate_text2image(payload).await {
            Ok(images) => {
                for (index, image) in images.iter().enumerate() {
                    jobs.add_image(&request_id, index.to_string(), image.as_str(), None);
                }
                jobs.mark_complete(&request_id);
                info!(request_id = %request_id, count = images.len(), "fallback generation complete");
                Ok(GenerationOutcome::Fallback { request_id, images })
            }
            Err(e) => {
                jobs.mark_error(&request_id, e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::HttpSessionSource;
    use crate::session::SessionManager;
    use genwire_core::errors::ClientError;
    use genwire_core::job::JobStatus;
    use serde_json::json;
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn closed_ws_base() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("ws://{}", listener.local_addr().unwrap())
    }

    async fn generator(server: &MockServer, ws_base: String) -> Generator {
        Mock::given(method("POST"))
            .and(path("/API/GetNewSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "s1"})))
            .mount(server)
            .await;

        let http = reqwest::Client::new();
        let sessions = SessionManager::new(Arc::new(HttpSessionSource::new(http.clone(), server.uri())));
        let runner = StreamRunner::new(sessions.clone(), Arc::new(JobStore::new()), ws_base);
        let api = ApiClient::new(http, server.uri(), sessions);
        Generator::new(runner, api)
    }

    #[tokio::test]
    async fn falls_back_when_stream_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/API/GenerateText2Image"))
            .and(body_partial_json(json!({"session_id": "s1", "prompt": "cat", "images": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"images": ["View/a.png", "View/b.png"]})))
            .expect(1)
            .mount(&server)
            .await;

        let generator = generator(&server, closed_ws_base().await).await;
        let params = GenerationParams {
            images: Some(2),
            ..GenerationParams::new("cat")
        };
        let outcome = generator.generate(&params, GenerateOptions::default()).await.unwrap();

        let GenerationOutcome::Fallback { request_id, images } = outcome else {
            panic!("expected fallback");
        };
        assert_eq!(images.len(), 2);
        let job = generator.jobs().get(&request_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.images, vec!["View/a.png", "View/b.png"]);
    }

    #[tokio::test]
    async fn failed_fallback_marks_job_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/API/GenerateText2Image"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "No model selected"})))
            .mount(&server)
            .await;

        let generator = generator(&server, closed_ws_base().await).await;
        let request_id = RequestId::from_raw("req-fail");
        let options = GenerateOptions {
            run: RunOptions::default().with_request_id(request_id.clone()),
            fallback: true,
        };
        let err = generator
            .generate(&GenerationParams::new("cat"), options)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ClientError::Api { .. }));
        let job = generator.jobs().get(&request_id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("No model selected (200)"));
    }

    #[tokio::test]
    async fn fallback_can_be_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/API/GenerateText2Image"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"images": []})))
            .expect(0)
            .mount(&server)
            .await;

        let generator = generator(&server, closed_ws_base().await).await;
        let options = GenerateOptions {
            fallback: false,
            ..Default::default()
        };
        let err = generator
            .generate(&GenerationParams::new("cat"), options)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[tokio::test]
    async fn session_failure_does_not_fall_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/API/GetNewSession"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": "Forbidden"})))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let sessions = SessionManager::new(Arc::new(HttpSessionSource::new(http.clone(), server.uri())));
        let runner = StreamRunner::new(sessions.clone(), Arc::new(JobStore::new()), closed_ws_base().await);
        let generator = Generator::new(runner, ApiClient::new(http, server.uri(), sessions));

        let err = generator
            .generate(&GenerationParams::new("cat"), GenerateOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Some("403"));
        assert!(generator.jobs().is_empty());
    }
}
