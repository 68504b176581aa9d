//! Configuration parsing and validation.
//!
//! ragtutor is configured from a TOML file (default `config/tutor.toml`).
//! Every section except `[db]` is optional and falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/tutor.sqlite"
//! collection = "tutor_docs"
//!
//! [corpus]
//! root = "./docs"
//!
//! [chunking]
//! max_tokens = 1000
//! overlap_tokens = 200
//!
//! [embedding]
//! provider = "local"
//! model = "bge-small-en-v1.5"
//!
//! [retrieval]
//! k = 4
//! fetch_k = 10
//! lambda = 0.5
//!
//! [chat]
//! provider = "gemini"
//! model = "gemini-2.0-flash"
//! system_prompt_path = "./prompts/dsa_tutor_workflow.md"
//! ```
//!
//! `TUTOR_DB_PATH` and `TUTOR_COLLECTION` override `[db]` after parsing.
//! API keys never live in the file; see [`Secrets`].

use anyhow::{bail, Context, Result};
use ragtutor_core::chunk::ChunkSettings;
use ragtutor_core::prompt::DEFAULT_INSTRUCTIONS;
use ragtutor_core::retrieve::MmrParams;
use ragtutor_core::session::DEFAULT_GREETING;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub corpus: Option<CorpusConfig>,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Namespace for index records; several corpora can share one database.
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_collection() -> String {
    "tutor_docs".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.md".to_string(),
        "**/*.markdown".to_string(),
        "**/*.txt".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    /// HuggingFace `tokenizer.json` used to count tokens. Requires the
    /// `hf-tokenizer` feature; without it, a 4-chars-per-token estimate is used.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            tokenizer_path: None,
        }
    }
}

impl ChunkingConfig {
    pub fn settings(&self) -> ChunkSettings {
        ChunkSettings {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }
}

fn default_max_tokens() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// L2-normalize every vector before it is stored or compared.
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            normalize: true,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Fail unless a provider is configured. Ingestion and retrieval both
    /// need one.
    pub fn require_enabled(&self) -> Result<()> {
        if !self.is_enabled() {
            bail!("Embeddings are disabled. Set [embedding] provider in the config (local, openai, or ollama).");
        }
        Ok(())
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,
    #[serde(default = "default_lambda")]
    pub lambda: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            fetch_k: default_fetch_k(),
            lambda: default_lambda(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> MmrParams {
        MmrParams {
            k: self.k,
            fetch_k: self.fetch_k,
            lambda: self.lambda,
        }
    }
}

fn default_k() -> usize {
    4
}
fn default_fetch_k() -> usize {
    10
}
fn default_lambda() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// `gemini`, `openai`, or `ollama`.
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// Base URL override (OpenAI-compatible servers, remote Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for the initial request on 429/5xx and network errors.
    /// A stream that fails part-way is never retried.
    #[serde(default = "default_chat_max_retries")]
    pub max_retries: u32,
    /// File holding the tutor instructions sent as the system prompt.
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    /// Number of past sessions fed back as long-term context.
    #[serde(default = "default_history_sessions")]
    pub history_sessions: usize,
    /// Cap on retrieved-context tokens in the prompt. Unlimited when unset.
    #[serde(default)]
    pub max_context_tokens: Option<usize>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            model: default_chat_model(),
            url: None,
            temperature: 0.0,
            timeout_secs: default_chat_timeout_secs(),
            max_retries: default_chat_max_retries(),
            system_prompt_path: None,
            greeting: default_greeting(),
            history_path: default_history_path(),
            history_sessions: default_history_sessions(),
            max_context_tokens: None,
        }
    }
}

impl ChatConfig {
    /// Tutor instructions from `system_prompt_path`, or the built-in prompt.
    pub fn instructions(&self) -> Result<String> {
        match &self.system_prompt_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt: {}", path.display())),
            None => Ok(DEFAULT_INSTRUCTIONS.to_string()),
        }
    }
}

fn default_chat_provider() -> String {
    "gemini".to_string()
}
fn default_chat_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_chat_timeout_secs() -> u64 {
    120
}
fn default_chat_max_retries() -> u32 {
    2
}
fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}
fn default_history_path() -> PathBuf {
    PathBuf::from("./data/history.log")
}
fn default_history_sessions() -> usize {
    ragtutor_core::history::DEFAULT_HISTORY_SESSIONS
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(db_path) = std::env::var("TUTOR_DB_PATH") {
        config.db.path = PathBuf::from(db_path);
    }
    if let Ok(collection) = std::env::var("TUTOR_COLLECTION") {
        config.db.collection = collection;
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.collection.trim().is_empty() {
        bail!("db.collection must not be empty");
    }

    config.chunking.settings().validate()?;
    config.retrieval.params().validate()?;

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.chat.provider.as_str() {
        "gemini" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown chat provider: '{}'. Must be gemini, openai, or ollama.",
            other
        ),
    }

    if config.chat.history_sessions == 0 {
        bail!("chat.history_sessions must be >= 1");
    }

    Ok(())
}

/// API keys read from the environment (after `.env` is loaded).
///
/// Resolved once at startup for the command being run, so a missing key
/// stops the process before any retrieval or generation work.
#[derive(Clone, Default)]
pub struct Secrets {
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .field("google_api_key", &self.google_api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Secrets {
    /// Keys needed to embed documents and queries.
    pub fn for_embedding(config: &Config) -> Result<Self> {
        let mut secrets = Self::default();
        if config.embedding.provider == "openai" {
            secrets.openai_api_key = Some(
                env_key("OPENAI_API_KEY")
                    .context("OPENAI_API_KEY environment variable not set (embedding.provider = \"openai\")")?,
            );
        }
        Ok(secrets)
    }

    /// Keys needed to embed queries and generate answers.
    pub fn for_chat(config: &Config) -> Result<Self> {
        let mut secrets = Self::for_embedding(config)?;
        match config.chat.provider.as_str() {
            "gemini" => {
                secrets.google_api_key = Some(
                    env_key("GOOGLE_API_KEY")
                        .context("GOOGLE_API_KEY environment variable not set (chat.provider = \"gemini\")")?,
                );
            }
            "openai" if config.chat.url.is_none() => {
                secrets.openai_api_key = Some(
                    env_key("OPENAI_API_KEY")
                        .context("OPENAI_API_KEY environment variable not set (chat.provider = \"openai\")")?,
                );
            }
            "openai" => secrets.openai_api_key = env_key("OPENAI_API_KEY"),
            _ => {}
        }
        Ok(secrets)
    }
}
