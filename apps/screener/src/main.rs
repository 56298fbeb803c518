mod channel;
mod config;
mod db;
mod errors;
mod llm_client;
mod mailer;
mod models;
mod orchestrator;
mod routes;
mod stages;
mod state;
mod store;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::channel::memory::MemoryChannel;
use crate::channel::redis::RedisChannel;
use crate::channel::{MessageChannel, Stage, Topic};
use crate::config::{ChannelBackend, Config, Mode, StoreBackend};
use crate::db::create_pool;
use crate::llm_client::embeddings::EmbeddingClient;
use crate::llm_client::LlmClient;
use crate::mailer::SmtpMailer;
use crate::orchestrator::{InputDirs, Orchestrator, OrchestratorSettings};
use crate::routes::build_router;
use crate::stages::matcher::MatcherStage;
use crate::stages::notifier::NotifierStage;
use crate::stages::resume_parser::{LlmProfileExtractor, ResumeParserStage};
use crate::stages::summarizer::{LlmSummarizer, SummarizerStage};
use crate::stages::{StageHandler, StageWorker};
use crate::state::AppState;
use crate::store::{MemoryStore, PgStore, StateStore};

/// Candidate screening pipeline: orchestrator, stage workers and status API.
#[derive(Debug, Parser)]
#[command(name = "screener", version, about)]
struct Cli {
    /// Which part of the pipeline this process runs.
    #[arg(long, value_enum, default_value_t = Mode::All)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configuration first; missing credentials for the selected mode stop us here.
    let config = Config::from_env(cli.mode)?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting screener v{} in {:?} mode",
        env!("CARGO_PKG_VERSION"),
        config.mode
    );

    let store = if config.mode.needs_store() {
        Some(build_store(&config).await?)
    } else {
        None
    };
    let channel = build_channel(&config).await?;
    channel
        .ensure_topics(&Topic::ALL)
        .await
        .context("failed to prepare channel topics")?;

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    if config.mode.runs_orchestrator() {
        let store = store.clone().context("orchestrator requires a store")?;
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            channel.clone(),
            OrchestratorSettings {
                threshold: config.match_threshold,
                channel_wait: config.channel_wait,
                outbox_interval: config.outbox_interval,
            },
        ));
        info!("Match threshold: {}", orchestrator.threshold());

        let dirs = InputDirs {
            jd_dir: prepare_input_dir(&config.jd_input_dir).await?,
            resume_dir: prepare_input_dir(&config.resume_input_dir).await?,
        };

        let run_cancel = cancel.clone();
        let running = orchestrator.clone();
        tasks.spawn(async move {
            running
                .run(Some(dirs), run_cancel)
                .await
                .context("orchestrator failed")
        });

        let state = AppState {
            store,
            orchestrator,
        };
        let app = build_router(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("Status API listening on {addr}");

        let serve_cancel = cancel.clone();
        tasks.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(serve_cancel.cancelled_owned())
                .await
                .context("status API failed")
        });
    }

    for stage in config.mode.stages() {
        let handler = build_handler(stage, &config, store.clone())?;
        let worker = StageWorker::new(
            handler,
            channel.clone(),
            config.retry.clone(),
            config.channel_wait,
        );
        let worker_cancel = cancel.clone();
        tasks.spawn(async move {
            worker.run(worker_cancel).await;
            Ok(())
        });
    }

    let mut outcome = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {}
        Some(joined) = tasks.join_next() => {
            outcome = settle(joined);
            warn!("A pipeline task ended early; shutting down");
        }
    }
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        let result = settle(joined);
        if outcome.is_ok() {
            outcome = result;
        }
    }
    info!("Screener shutdown complete");
    outcome
}

fn settle(joined: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{e:#}");
            Err(e)
        }
        Err(e) => {
            error!("Task panicked: {e}");
            Err(e.into())
        }
    }
}

/// Creates an input directory and returns its canonical path; watch events carry absolute
/// paths on some platforms.
async fn prepare_input_dir(dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create input directory {}", dir.display()))?;
    tokio::fs::canonicalize(dir)
        .await
        .with_context(|| format!("failed to resolve input directory {}", dir.display()))
}

async fn build_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let store = PgStore::new(create_pool(url).await?);
            store.migrate().await.context("failed to apply migrations")?;
            info!("PostgreSQL store ready");
            Ok(Arc::new(store))
        }
    }
}

async fn build_channel(config: &Config) -> Result<Arc<dyn MessageChannel>> {
    match config.channel_backend {
        ChannelBackend::Memory => Ok(Arc::new(MemoryChannel::new(config.visibility_timeout))),
        ChannelBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("REDIS_URL is required for the redis channel")?;
            let channel = RedisChannel::connect(url, config.visibility_timeout)
                .await
                .context("failed to connect to Redis")?;
            info!("Redis channel initialized");
            Ok(Arc::new(channel))
        }
    }
}

fn build_handler(
    stage: Stage,
    config: &Config,
    store: Option<Arc<dyn StateStore>>,
) -> Result<Arc<dyn StageHandler>> {
    let llm = || -> Result<LlmClient> {
        let settings = config
            .llm
            .clone()
            .context("LLM settings are required for this stage")?;
        let client = LlmClient::new(settings)?;
        info!("LLM client initialized (model: {})", client.model());
        Ok(client)
    };

    let handler: Arc<dyn StageHandler> = match stage {
        Stage::Summarize => Arc::new(SummarizerStage::new(Arc::new(LlmSummarizer::new(llm()?)))),
        Stage::ParseResume => Arc::new(ResumeParserStage::new(Arc::new(
            LlmProfileExtractor::new(llm()?),
        ))),
        Stage::Score => {
            let embedder =
                EmbeddingClient::new(config.embedding_url.clone(), config.embedding_model.clone())?;
            info!("Embedding client initialized (model: {})", embedder.model());
            Arc::new(MatcherStage::new(
                store.context("the matcher requires a store")?,
                Arc::new(embedder),
            ))
        }
        Stage::Notify => {
            let smtp = config
                .smtp
                .as_ref()
                .context("SMTP settings are required for the notifier")?;
            let mailer = SmtpMailer::new(smtp)?;
            info!("SMTP mailer initialized ({}:{})", smtp.server, smtp.port);
            Arc::new(NotifierStage::new(
                store.context("the notifier requires a store")?,
                Arc::new(mailer),
                smtp.company.clone(),
            ))
        }
    };
    Ok(handler)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
