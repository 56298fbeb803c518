use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;

use crate::channel::Stage;
use crate::llm_client::LlmSettings;
use crate::mailer::SmtpSettings;
use crate::stages::RetryPolicy;

const DEFAULT_LLM_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_LLM_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11434/api/embeddings";
const DEFAULT_EMBEDDING_MODEL: &str = "all-minilm";

/// Which part of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Orchestrator, every stage and the status API in one process.
    All,
    /// Orchestrator and status API only.
    Orchestrator,
    Summarizer,
    ResumeParser,
    Matcher,
    Notifier,
}

impl Mode {
    pub fn runs_orchestrator(&self) -> bool {
        matches!(self, Mode::All | Mode::Orchestrator)
    }

    /// Stage workers hosted by this process.
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            Mode::All => Stage::ALL.to_vec(),
            Mode::Orchestrator => Vec::new(),
            Mode::Summarizer => vec![Stage::Summarize],
            Mode::ResumeParser => vec![Stage::ParseResume],
            Mode::Matcher => vec![Stage::Score],
            Mode::Notifier => vec![Stage::Notify],
        }
    }

    fn needs_llm(&self) -> bool {
        self.stages()
            .iter()
            .any(|s| matches!(s, Stage::Summarize | Stage::ParseResume))
    }

    fn needs_smtp(&self) -> bool {
        self.stages().contains(&Stage::Notify)
    }

    /// Summarizer and resume parser never touch the store.
    pub fn needs_store(&self) -> bool {
        self.runs_orchestrator()
            || self
                .stages()
                .iter()
                .any(|s| matches!(s, Stage::Score | Stage::Notify))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBackend {
    Redis,
    Memory,
}

/// Process configuration, read once at startup.
/// Credentials for the components the selected mode runs are required; the rest are optional.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub channel_backend: ChannelBackend,
    pub redis_url: Option<String>,
    pub match_threshold: f64,
    pub llm: Option<LlmSettings>,
    pub embedding_url: String,
    pub embedding_model: String,
    pub smtp: Option<SmtpSettings>,
    pub jd_input_dir: PathBuf,
    pub resume_input_dir: PathBuf,
    pub channel_wait: Duration,
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
    pub outbox_interval: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env(mode: Mode) -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(mode, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(mode: Mode, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup: &lookup };

        let store_backend = match env.or("STORE_BACKEND", "postgres").as_str() {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{other}'"),
        };
        let channel_backend = match env.or("CHANNEL_BACKEND", "redis").as_str() {
            "redis" => ChannelBackend::Redis,
            "memory" => ChannelBackend::Memory,
            other => bail!("CHANNEL_BACKEND must be 'redis' or 'memory', got '{other}'"),
        };
        if mode != Mode::All
            && (store_backend == StoreBackend::Memory || channel_backend == ChannelBackend::Memory)
        {
            bail!("in-memory backends are only available in 'all' mode");
        }

        let database_url = match (store_backend, mode.needs_store()) {
            (StoreBackend::Postgres, true) => Some(env.require("DATABASE_URL")?),
            _ => env.get("DATABASE_URL"),
        };
        let redis_url = match channel_backend {
            ChannelBackend::Redis => Some(env.require("REDIS_URL")?),
            ChannelBackend::Memory => env.get("REDIS_URL"),
        };

        let match_threshold: f64 = env.parse("MATCH_THRESHOLD", 0.80)?;
        if !match_threshold.is_finite() || !(-1.0..=1.0).contains(&match_threshold) {
            bail!("MATCH_THRESHOLD must be a finite number in [-1, 1], got {match_threshold}");
        }

        let llm = if mode.needs_llm() {
            Some(LlmSettings {
                api_url: env.or("LLM_API_URL", DEFAULT_LLM_API_URL),
                api_key: env.require("LLM_API_KEY")?,
                model: env.or("LLM_MODEL", DEFAULT_LLM_MODEL),
            })
        } else {
            None
        };

        let smtp = if mode.needs_smtp() {
            Some(SmtpSettings {
                server: env.require("SMTP_SERVER")?,
                port: env.parse("SMTP_PORT", 587)?,
                user: env.require("SMTP_USER")?,
                password: env.require("SMTP_PASSWORD")?,
                from: env.require("EMAIL_FROM")?,
                company: env.or("COMPANY_NAME", "Our Company"),
            })
        } else {
            None
        };

        Ok(Config {
            mode,
            store_backend,
            database_url,
            channel_backend,
            redis_url,
            match_threshold,
            llm,
            embedding_url: env.or("EMBEDDING_URL", DEFAULT_EMBEDDING_URL),
            embedding_model: env.or("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            smtp,
            jd_input_dir: env.or("JD_INPUT_DIR", "data/job_descriptions").into(),
            resume_input_dir: env.or("RESUME_INPUT_DIR", "data/resumes").into(),
            channel_wait: Duration::from_millis(env.parse("CHANNEL_WAIT_MS", 2000)?),
            visibility_timeout: Duration::from_secs(env.parse("VISIBILITY_TIMEOUT_SECS", 300)?),
            retry: RetryPolicy {
                max_retries: env.parse("STAGE_RETRIES", 3)?,
                base_delay: Duration::from_millis(env.parse("RETRY_BASE_DELAY_MS", 500)?),
                max_deliveries: env.parse("MAX_DELIVERIES", 5)?,
            },
            outbox_interval: Duration::from_millis(env.parse("OUTBOX_INTERVAL_MS", 1000)?),
            port: env
                .parse("PORT", 8080)
                .context("PORT must be a valid port number")?,
            rust_log: env.or("RUST_LOG", "info"),
        })
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("Required environment variable '{key}' is not set"))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("'{key}' has an invalid value '{raw}'")),
            None => Ok(default),
        }
    }
}
