//! # genwire
//!
//! Command-line client: wires settings, logging, sessions, and the
//! generation pipeline together.

#![deny(unsafe_code)]

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::info;

use genwire_client::{
    build_http_client, ApiClient, FileSessionStorage, GenerateOptions, GenerationOutcome, Generator,
    HttpSessionSource, JobStore, RunOptions, SessionManager, StreamRunner,
};
use genwire_core::events::ProtocolEvent;
use genwire_core::job::JobStatus;
use genwire_settings::GenwireSettings;
use genwire_telemetry::{init_telemetry, TelemetryConfig};

use crate::cli::{Cli, Command, GenerateArgs};

struct App {
    sessions: SessionManager,
    api: ApiClient,
    generator: Generator,
    settings: GenwireSettings,
}

impl App {
    fn build(settings: GenwireSettings) -> Result<Self> {
        let http = build_http_client(Duration::from_millis(settings.server.request_timeout_ms))?;
        let base_url = settings.server.base_url.clone();
        let ws_base = settings.server.resolved_ws_url()?;

        let source = Arc::new(HttpSessionSource::new(http.clone(), base_url.clone()));
        let sessions = if settings.session.persist {
            let path = settings.session.resolved_file();
            info!(path = %path.display(), "session persistence enabled");
            SessionManager::with_storage(source, Arc::new(FileSessionStorage::new(path)))
        } else {
            SessionManager::new(source)
        };

        let jobs = Arc::new(JobStore::new());
        let api = ApiClient::new(http, base_url, sessions.clone());
        let runner = StreamRunner::new(sessions.clone(), jobs, ws_base);
        let generator = Generator::new(runner, api.clone());

        Ok(Self {
            sessions,
            api,
            generator,
            settings,
        })
    }

    async fn show_session(&self) -> Result<()> {
        self.sessions.ensure_session().await?;
        let session = self.sessions.current().context("session was cleared")?;
        println!("{}", serde_json::to_string_pretty(&*session)?);
        Ok(())
    }

    async fn call(&self, method: &str, body: &str) -> Result<()> {
        let body: Value = serde_json::from_str(body).context("--body must be JSON")?;
        let reply = self.api.post(method, body).await?;
        println!("{}", serde_json::to_string_pretty(&reply)?);
        Ok(())
    }

    async fn generate(&self, args: &GenerateArgs) -> Result<()> {
        let open_timeout = args.timeout_ms.unwrap_or(self.settings.stream.open_timeout_ms);
        let run = RunOptions::default()
            .with_open_timeout(Duration::from_millis(open_timeout))
            .on_event(log_event);
        let options = GenerateOptions {
            run,
            fallback: !args.no_fallback,
        };

        let outcome = self.generator.generate(&args.to_params(), options).await?;
        let request_id = outcome.request_id().clone();
        if let GenerationOutcome::Streaming(handle) = &outcome {
            tokio::select! {
                _ = handle.closed() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!(request_id = %request_id, "interrupted, closing stream");
                    handle.close();
                    handle.closed().await;
                }
            }
        }

        let job = self
            .generator
            .jobs()
            .get(&request_id)
            .context("job missing from store")?;
        println!("{}", serde_json::to_string_pretty(&job)?);
        if job.status == JobStatus::Error {
            bail!("generation failed: {}", job.error.unwrap_or_default());
        }
        Ok(())
    }

    fn logout(&self) {
        self.sessions.clear_session();
        println!("session cleared");
    }
}

fn log_event(request_id: &genwire_core::ids::RequestId, event: &ProtocolEvent) {
    match event {
        ProtocolEvent::Progress {
            batch_index,
            overall_percent,
            ..
        } => info!(%request_id, batch_index = batch_index.as_str(), overall = ?overall_percent, "progress"),
        ProtocolEvent::Image { batch_index, image, .. } => {
            info!(%request_id, batch_index = batch_index.as_str(), image = image.as_str(), "image")
        }
        ProtocolEvent::Status {
            waiting_gens,
            live_gens,
            ..
        } => info!(%request_id, waiting_gens, live_gens, "queue status"),
        ProtocolEvent::Error { message, code } => {
            tracing::warn!(%request_id, code = ?code, %message, "backend error")
        }
        other => tracing::debug!(%request_id, kind = other.kind(), "event"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(genwire_settings::settings_path);
    let mut settings = genwire_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    if let Some(base_url) = cli.base_url {
        settings.server.base_url = base_url;
    }

    init_telemetry(&TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));

    let app = App::build(settings)?;
    match cli.command {
        Command::Session => app.show_session().await,
        Command::Call { method, body } => app.call(&method, &body).await,
        Command::Generate(args) => app.generate(&args).await,
        Command::Logout => {
            app.logout();
            Ok(())
        }
    }
}
