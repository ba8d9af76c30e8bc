//! TOML configuration.
//!
//! Every section except `[db]` and `[source]` is optional and falls back to
//! the defaults below. Secrets (API keys, the webhook secret) are never read
//! from the file: the file names the environment variable that holds them.
//!
//! ```toml
//! [db]
//! path = "./data/support.sqlite"
//!
//! [source]
//! kind = "google_sheets"
//! spreadsheet_id = "1AbC..."
//!
//! [retrieval]
//! min_similarity = 0.3
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub conversations: ConversationsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Similarity threshold τ. Candidates scoring below it are discarded.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Maximum characters of knowledge placed in the prompt.
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
    /// Confidence ceiling when no knowledge matched or generation failed.
    #[serde(default = "default_no_match_ceiling")]
    pub no_match_ceiling: f64,
    /// Model confidence assumed when the generator reports none.
    #[serde(default = "default_model_confidence_prior")]
    pub model_confidence_prior: f64,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            context_budget: default_context_budget(),
            no_match_ceiling: default_no_match_ceiling(),
            model_confidence_prior: default_model_confidence_prior(),
            escalation_threshold: default_escalation_threshold(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.3
}
fn default_context_budget() -> usize {
    4000
}
fn default_no_match_ceiling() -> f64 {
    0.3
}
fn default_model_confidence_prior() -> f64 {
    0.5
}
fn default_escalation_threshold() -> f64 {
    0.5
}
fn default_history_turns() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hash"` (offline feature hashing) or `"openai"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: default_embedding_url(),
            api_key_env: default_embedding_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// Vector dimensionality after applying the provider default.
    pub fn resolved_dims(&self) -> Option<usize> {
        match self.provider.as_str() {
            "hash" => Some(self.dims.unwrap_or(crate::embedding::DEFAULT_HASH_DIMS)),
            _ => self.dims,
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embedding_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"openai"` (any OpenAI-compatible chat endpoint) or `"disabled"`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default = "default_generation_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: default_generation_url(),
            api_key_env: default_generation_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_model() -> String {
    "deepseek-chat".to_string()
}
fn default_generation_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}
fn default_generation_key_env() -> String {
    "DEEPSEEK_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    500
}

/// Limits shared by every embedder and generator call.
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Outer deadline for a single attempt, on top of the HTTP client timeout.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    4000
}
fn default_attempt_timeout_secs() -> u64 {
    45
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `"google_sheets"` or `"json_file"`.
    pub kind: String,
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    #[serde(default = "default_worksheet")]
    pub worksheet: String,
    #[serde(default = "default_sheets_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_sheets_url")]
    pub url: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_worksheet() -> String {
    "knowledge_base".to_string()
}
fn default_sheets_key_env() -> String {
    "GOOGLE_SHEETS_API_KEY".to_string()
}
fn default_sheets_url() -> String {
    "https://sheets.googleapis.com/v4".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between background passes. `0` disables polling; webhook
    /// triggers still run passes.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub on_startup: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            on_startup: true,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}

fn default_poll_interval_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_secret_env")]
    pub secret_env: String,
    /// How long a seen event id is remembered.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Upper bound on remembered event ids.
    #[serde(default = "default_max_tracked")]
    pub max_tracked: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret_env: default_webhook_secret_env(),
            retention_secs: default_retention_secs(),
            max_tracked: default_max_tracked(),
        }
    }
}

impl WebhookConfig {
    /// Read the shared secret from the configured environment variable.
    pub fn secret(&self) -> Result<String> {
        let secret = std::env::var(&self.secret_env)
            .with_context(|| format!("{} is not set", self.secret_env))?;
        if secret.is_empty() {
            anyhow::bail!("{} must not be empty", self.secret_env);
        }
        Ok(secret)
    }
}

fn default_webhook_secret_env() -> String {
    "WEBHOOK_SECRET".to_string()
}
fn default_retention_secs() -> u64 {
    86_400
}
fn default_max_tracked() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationsConfig {
    /// `"log"` or `"jsonl"`.
    #[serde(default = "default_sink")]
    pub sink: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            sink: default_sink(),
            path: None,
        }
    }
}

fn default_sink() -> String {
    "log".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.max_chunk_size == 0 {
        anyhow::bail!("chunking.max_chunk_size must be > 0");
    }
    if chunking.overlap >= chunking.max_chunk_size {
        anyhow::bail!("chunking.overlap must be < chunking.max_chunk_size");
    }

    let retrieval = &config.retrieval;
    if retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if retrieval.context_budget == 0 {
        anyhow::bail!("retrieval.context_budget must be > 0");
    }
    if !(0.0..=1.0).contains(&retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [0.0, 1.0]");
    }
    for (name, value) in [
        ("no_match_ceiling", retrieval.no_match_ceiling),
        ("model_confidence_prior", retrieval.model_confidence_prior),
        ("escalation_threshold", retrieval.escalation_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "hash" => {}
        "openai" => {
            if embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or openai.",
            other
        ),
    }
    if matches!(embedding.resolved_dims(), None | Some(0)) {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            embedding.provider
        );
    }

    match config.generation.provider.as_str() {
        "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be openai or disabled.",
            other
        ),
    }

    let upstream = &config.upstream;
    if upstream.max_attempts < 1 {
        anyhow::bail!("upstream.max_attempts must be >= 1");
    }
    if upstream.max_concurrency < 1 {
        anyhow::bail!("upstream.max_concurrency must be >= 1");
    }

    let source = &config.source;
    match source.kind.as_str() {
        "google_sheets" => {
            if source.spreadsheet_id.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("source.spreadsheet_id is required for google_sheets");
            }
        }
        "json_file" => {
            if source.path.is_none() {
                anyhow::bail!("source.path is required for json_file");
            }
        }
        other => anyhow::bail!(
            "Unknown source kind: '{}'. Must be google_sheets or json_file.",
            other
        ),
    }

    if config.webhook.max_tracked == 0 {
        anyhow::bail!("webhook.max_tracked must be > 0");
    }

    match config.conversations.sink.as_str() {
        "log" => {}
        "jsonl" => {
            if config.conversations.path.is_none() {
                anyhow::bail!("conversations.path is required for the jsonl sink");
            }
        }
        other => anyhow::bail!(
            "Unknown conversation sink: '{}'. Must be log or jsonl.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/support.sqlite"

[source]
kind = "json_file"
path = "./kb.json"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.chunking.max_chunk_size, 1000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.min_similarity - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.resolved_dims(), Some(256));
        assert_eq!(config.generation.model, "deepseek-chat");
        assert_eq!(config.generation.url, "https://api.deepseek.com/v1");
        assert_eq!(config.generation.max_tokens, 500);
        assert_eq!(config.upstream.max_attempts, 3);
        assert_eq!(config.source.worksheet, "knowledge_base");
        assert_eq!(config.webhook.secret_env, "WEBHOOK_SECRET");
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(config.sync.poll_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/support.example.toml")).unwrap();
        assert_eq!(config.source.kind, "google_sheets");
        assert_eq!(config.conversations.sink, "jsonl");
    }

    #[test]
    fn test_overlap_must_be_below_chunk_size() {
        let text = format!("{}\n[chunking]\nmax_chunk_size = 100\noverlap = 100\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let text = format!("{}\n[retrieval]\nmin_similarity = 1.5\n", MINIMAL);
        assert!(parse_config(&text).is_err());
        let text = format!("{}\n[retrieval]\nescalation_threshold = -0.1\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_openai_embedding_requires_model_and_dims() {
        let text = format!("{}\n[embedding]\nprovider = \"openai\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
        let text = format!(
            "{}\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
            MINIMAL
        );
        assert!(parse_config(&text).is_err());
        let text = format!(
            "{}\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
            MINIMAL
        );
        assert!(parse_config(&text).is_ok());
    }

    #[test]
    fn test_unknown_source_kind_rejected() {
        let text = "[db]\npath = \"x\"\n[source]\nkind = \"csv\"\n";
        let err = parse_config(text).unwrap_err();
        assert!(err.to_string().contains("Unknown source kind"));
    }

    #[test]
    fn test_google_sheets_requires_spreadsheet_id() {
        let text = "[db]\npath = \"x\"\n[source]\nkind = \"google_sheets\"\n";
        assert!(parse_config(text).is_err());
        let text = "[db]\npath = \"x\"\n[source]\nkind = \"google_sheets\"\nspreadsheet_id = \"abc\"\n";
        assert!(parse_config(text).is_ok());
    }

    #[test]
    fn test_jsonl_sink_requires_path() {
        let text = format!("{}\n[conversations]\nsink = \"jsonl\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_zero_poll_interval_disables_polling() {
        let text = format!("{}\n[sync]\npoll_interval_secs = 0\n", MINIMAL);
        let config = parse_config(&text).unwrap();
        assert_eq!(config.sync.poll_interval(), None);
    }

    #[test]
    fn test_webhook_secret_read_from_env() {
        let config = WebhookConfig {
            secret_env: "SUPPORT_HARNESS_TEST_SECRET_UNSET".to_string(),
            ..WebhookConfig::default()
        };
        assert!(config.secret().is_err());
    }
}
